use clap::Parser;
use std::{path::PathBuf, process::ExitCode};
use swift_rs::{
    image::ObjectFile,
    init_tracing,
    types::TypeKind,
    value::layout::HasLayout,
    Catalog, TypeDescriptor,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Dump the layout, members and conformances of a Swift type"
)]
struct Args {
    /// The Mach-O or ELF image to read
    image: PathBuf,
    /// The full name of the type (e.g. main.Point)
    type_name: String,
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn print_type(catalog: &Catalog, ty: &TypeDescriptor) -> swift_rs::Result<()> {
    let layout = ty.layout();
    println!("{} {}", ty.kind, ty.full_name());
    if let Some(descriptor) = ty.descriptor {
        println!("  descriptor: {descriptor:#x}");
    }
    println!(
        "  size: {}, stride: {}, alignment: {}, extra inhabitants: {}",
        layout.size, layout.stride, layout.alignment, layout.extra_inhabitants
    );
    println!(
        "  layout: {}, pod: {}, bitwise takable: {}",
        ty.layout.type_tag(),
        ty.layout.is_pod(),
        ty.layout.is_bitwise_takable()
    );

    if ty.kind == TypeKind::Class {
        if let Some(superclass) = catalog.superclass_of(ty)? {
            println!("  superclass: {}", superclass.full_name());
        }
    }

    let fields = catalog.fields_of(ty)?;
    if !fields.is_empty() {
        println!("  fields:");
        for field in fields {
            let keyword = if field.is_var { "var" } else { "let" };
            println!(
                "    [{:>4}] {keyword} {}: {}",
                field.offset,
                field.name,
                field.ty.full_name()
            );
        }
    }

    let cases = catalog.cases_of(ty);
    if !cases.is_empty() {
        println!("  cases:");
        for case in cases {
            match &case.payload {
                Some(payload) => println!(
                    "    {}: {}({}{})",
                    case.tag,
                    case.name,
                    if payload.indirect { "indirect " } else { "" },
                    payload.ty.full_name()
                ),
                None => println!("    {}: {}", case.tag, case.name),
            }
        }
    }

    let methods = catalog.methods_of(ty);
    if !methods.is_empty() {
        println!("  methods:");
        for method in methods {
            println!("    {method:?}");
        }
    }

    if !ty.conformances.is_empty() {
        println!("  conformances:");
        for (protocol, conformance) in &ty.conformances {
            println!("    {protocol} ({:#x})", conformance.witness_table);
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let file = match ObjectFile::open(&args.image) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error loading image: {}", e);
            return ExitCode::from(1);
        }
    };
    let catalog = match Catalog::new(file.memory(), &file, None) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error reading metadata: {}", e);
            return ExitCode::from(1);
        }
    };

    let ty = match catalog.resolve_type_name(&args.type_name) {
        Ok(ty) => ty,
        Err(e) => {
            eprintln!("{}: {}", args.type_name, e);
            return ExitCode::from(1);
        }
    };
    match print_type(&catalog, &ty) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error dumping {}: {}", ty.full_name(), e);
            ExitCode::from(1)
        }
    }
}
