//! # swift-rs
//!
//! Introspects Swift runtime type metadata from inside a process, and calls or
//! intercepts Swift functions with the Swift calling convention.
//!
//! [`Catalog`] indexes the metadata sections of loaded images. Types resolve
//! to [`TypeDescriptor`]s whose layouts drive [`Value`]s, the enum tag codec in
//! [`value::enums`] and the existential containers in [`value::existential`].
//! [`Bridge`] ties these to native invocation and interception.
use clap::Parser;
use std::{path::PathBuf, process::ExitCode};
use tracing_subscriber::EnvFilter;

pub mod abi;
pub mod bridge;
pub mod error;
pub mod image;
pub mod memory;
pub mod metadata;
pub mod resolve;
pub mod runtime;
pub mod symbols;
pub mod types;
pub mod utils;
pub mod value;

pub use bridge::{Bridge, BridgeBuilder, NativeFunction};
pub use error::{BridgeError, MemoryError, Result};
pub use resolve::Catalog;
pub use types::{TypeDescriptor, TypeKind};
pub use value::Value;

use image::ObjectFile;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Lists the Swift modules, types and protocols of an image"
)]
pub struct Args {
    #[arg(value_name = "IMAGE")]
    pub image: PathBuf,
    /// Only show this module
    #[arg(short, long)]
    pub module: Option<String>,
    /// Also resolve every type and print its layout
    #[arg(short, long)]
    pub layouts: bool,
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Installs a stderr subscriber. `RUST_LOG` wins over `verbose`.
pub fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

pub fn run_cli() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let file = match ObjectFile::open(&args.image) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error loading image: {}", e);
            return ExitCode::from(1);
        }
    };
    if !file.image().has_swift_metadata() {
        eprintln!("{} has no Swift metadata sections", file.image().name);
        return ExitCode::from(1);
    }
    let catalog = match Catalog::new(file.memory(), &file, None) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error reading metadata: {}", e);
            return ExitCode::from(1);
        }
    };

    let modules = catalog
        .list_modules()
        .into_iter()
        .filter(|m| args.module.as_deref().map_or(true, |name| m.name == name));
    for module in modules {
        println!(
            "{}: {} classes, {} structs, {} enums, {} protocols",
            module.name,
            module.classes.len(),
            module.structs.len(),
            module.enums.len(),
            module.protocols.len()
        );
        for (kind, names) in [
            ("class", &module.classes),
            ("struct", &module.structs),
            ("enum", &module.enums),
            ("protocol", &module.protocols),
        ] {
            for name in names {
                println!("  {kind} {name}");
            }
        }
        if args.layouts {
            for ty in catalog.all_types(&module.name) {
                let layout = ty.layout();
                println!(
                    "  {} size={} stride={} align={} xi={}",
                    ty.full_name(),
                    layout.size,
                    layout.stride,
                    layout.alignment,
                    layout.extra_inhabitants
                );
            }
        }
    }
    ExitCode::SUCCESS
}
