#![allow(dead_code)]

use std::{collections::HashMap, sync::Arc};
use swift_rs::{
    image::{ModuleImage, Section, StaticModuleSource, Symbol},
    memory::{LocalMemory, Memory},
    metadata::CLASS_DESCRIPTION_WORD,
    resolve::{Catalog, MetadataAccessor},
    runtime::StaticDemangler,
    BridgeError, Result,
};

const CAPACITY_WORDS: usize = 8 * 1024;

const MODULE: u32 = 0;
const PROTOCOL: u32 = 3;
const CLASS: u32 = 16;
const STRUCT: u32 = 17;
const ENUM: u32 = 18;
const GENERIC: u32 = 0x80;
const CLASS_HAS_VTABLE: u32 = 0x8000 << 16;
const PROTOCOL_NOT_CLASS_BOUND: u32 = 1 << 16;

pub const STRUCT_KIND: u64 = 0x200;
pub const ENUM_KIND: u64 = 0x201;
const CLASS_ISA: u64 = 0x1_0000_4000;

/// One piece of a mangled type name.
#[derive(Clone, Copy, Debug)]
pub enum Mangled<'a> {
    Text(&'a str),
    /// A direct symbolic reference to a context descriptor.
    Ref(usize),
}

#[derive(Clone, Copy, Debug)]
pub struct Record<'a> {
    pub name: &'a str,
    pub ty: Option<usize>,
    pub flags: u32,
}

impl<'a> Record<'a> {
    pub fn var(name: &'a str, ty: usize) -> Self {
        Self { name, ty: Some(ty), flags: 2 }
    }

    pub fn constant(name: &'a str, ty: usize) -> Self {
        Self { name, ty: Some(ty), flags: 0 }
    }

    pub fn case(name: &'a str, ty: usize) -> Self {
        Self { name, ty: Some(ty), flags: 0 }
    }

    pub fn empty(name: &'a str) -> Self {
        Self { name, ty: None, flags: 0 }
    }

    pub fn indirect(name: &'a str, ty: usize) -> Self {
        Self { name, ty: Some(ty), flags: 1 }
    }
}

/// Lays out Swift metadata in a heap buffer the way the compiler lays it out
/// in an image, with relative pointers between the pieces.
pub struct ImageBuilder {
    storage: Box<[u64]>,
    cursor: usize,
    types: Vec<usize>,
    protocols: Vec<usize>,
    conformances: Vec<usize>,
    access: HashMap<usize, usize>,
    symbols: Vec<Symbol>,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self {
            storage: vec![0u64; CAPACITY_WORDS].into_boxed_slice(),
            cursor: 0,
            types: vec![],
            protocols: vec![],
            conformances: vec![],
            access: HashMap::new(),
            symbols: vec![],
        }
    }

    pub fn base(&self) -> usize {
        self.storage.as_ptr() as usize
    }

    pub fn alloc(&mut self, size: usize, align: usize) -> usize {
        self.cursor = self.cursor.div_ceil(align) * align;
        let address = self.base() + self.cursor;
        self.cursor += size.max(1);
        assert!(self.cursor <= CAPACITY_WORDS * 8, "synthetic image is full");
        address
    }

    pub fn put_u32(&self, at: usize, value: u32) {
        LocalMemory.write(at, &value.to_le_bytes()).unwrap();
    }

    pub fn put_u64(&self, at: usize, value: u64) {
        LocalMemory.write_u64(at, value).unwrap();
    }

    pub fn put_rel(&self, at: usize, target: usize) {
        let offset = i32::try_from(target as i64 - at as i64).unwrap();
        self.put_u32(at, offset as u32);
    }

    pub fn string(&mut self, s: &str) -> usize {
        let at = self.alloc(s.len() + 1, 1);
        LocalMemory.write(at, s.as_bytes()).unwrap();
        at
    }

    pub fn mangled(&mut self, parts: &[Mangled]) -> usize {
        let len: usize = parts
            .iter()
            .map(|p| match p {
                Mangled::Text(t) => t.len(),
                Mangled::Ref(_) => 5,
            })
            .sum();
        let start = self.alloc(len + 1, 1);
        let mut at = start;
        for part in parts {
            match part {
                Mangled::Text(t) => {
                    LocalMemory.write(at, t.as_bytes()).unwrap();
                    at += t.len();
                }
                Mangled::Ref(target) => {
                    LocalMemory.write(at, &[0x01]).unwrap();
                    self.put_rel(at + 1, *target);
                    at += 5;
                }
            }
        }
        start
    }

    /// A standard mangled name such as `Si` or `SiSg`.
    pub fn standard(&mut self, text: &str) -> usize {
        self.mangled(&[Mangled::Text(text)])
    }

    /// A symbolic reference to `descriptor`.
    pub fn reference(&mut self, descriptor: usize) -> usize {
        self.mangled(&[Mangled::Ref(descriptor)])
    }

    fn context(&mut self, size: usize, flags: u32, parent: Option<usize>, name: &str) -> usize {
        let descriptor = self.alloc(size, 4);
        self.put_u32(descriptor, flags);
        if let Some(parent) = parent {
            self.put_rel(descriptor + 4, parent);
        }
        let name = self.string(name);
        self.put_rel(descriptor + 8, name);
        descriptor
    }

    pub fn module(&mut self, name: &str) -> usize {
        self.context(0x10, MODULE, None, name)
    }

    pub fn declare_struct(&mut self, parent: usize, name: &str) -> usize {
        let descriptor = self.context(0x1c, STRUCT, Some(parent), name);
        // field offsets start two words into struct metadata
        self.put_u32(descriptor + 0x18, 2);
        self.types.push(descriptor);
        descriptor
    }

    pub fn generic_struct(&mut self, parent: usize, name: &str) -> usize {
        let descriptor = self.context(0x1c, STRUCT | GENERIC, Some(parent), name);
        self.types.push(descriptor);
        descriptor
    }

    pub fn declare_enum(&mut self, parent: usize, name: &str) -> usize {
        let descriptor = self.context(0x1c, ENUM, Some(parent), name);
        self.types.push(descriptor);
        descriptor
    }

    /// A class whose vtable lists `methods` as (flags, implementation).
    pub fn declare_class(
        &mut self,
        parent: usize,
        name: &str,
        superclass: Option<usize>,
        methods: &[(u32, usize)],
    ) -> usize {
        let flags = if methods.is_empty() { CLASS } else { CLASS | CLASS_HAS_VTABLE };
        let descriptor = self.context(0x34 + 8 * methods.len(), flags, Some(parent), name);
        if let Some(superclass) = superclass {
            self.put_rel(descriptor + 0x14, superclass);
        }
        self.put_u32(descriptor + 0x30, methods.len() as u32);
        for (i, (flags, implementation)) in methods.iter().enumerate() {
            let at = descriptor + 0x34 + i * 8;
            self.put_u32(at, *flags);
            self.put_rel(at + 4, *implementation);
        }
        self.types.push(descriptor);
        descriptor
    }

    /// Writes the field descriptor of a struct, enum or class.
    pub fn set_fields(&mut self, descriptor: usize, records: &[Record]) {
        let fields = self.alloc(0x10 + 0xc * records.len(), 4);
        self.put_u32(fields + 0xc, records.len() as u32);
        for (i, record) in records.iter().enumerate() {
            let at = fields + 0x10 + i * 0xc;
            self.put_u32(at, record.flags);
            if let Some(ty) = record.ty {
                self.put_rel(at + 4, ty);
            }
            let name = self.string(record.name);
            self.put_rel(at + 8, name);
        }
        self.put_rel(descriptor + 0x10, fields);

        let count = records.len() as u32;
        match LocalMemory.read_u32(descriptor).unwrap() & 0x1f {
            STRUCT => self.put_u32(descriptor + 0x14, count),
            ENUM => {
                let payloads = records.iter().filter(|r| r.ty.is_some()).count() as u32;
                self.put_u32(descriptor + 0x14, payloads);
                self.put_u32(descriptor + 0x18, count - payloads);
            }
            CLASS => self.put_u32(descriptor + 0x24, count),
            _ => {}
        }
    }

    pub fn structure(&mut self, parent: usize, name: &str, records: &[Record]) -> usize {
        let descriptor = self.declare_struct(parent, name);
        self.set_fields(descriptor, records);
        descriptor
    }

    pub fn enumeration(&mut self, parent: usize, name: &str, records: &[Record]) -> usize {
        let descriptor = self.declare_enum(parent, name);
        self.set_fields(descriptor, records);
        descriptor
    }

    pub fn protocol(&mut self, parent: usize, name: &str, requirements: u32, class_only: bool) -> usize {
        let flags = if class_only { PROTOCOL } else { PROTOCOL | PROTOCOL_NOT_CLASS_BOUND };
        let descriptor = self.context(0x18, flags, Some(parent), name);
        self.put_u32(descriptor + 0x10, requirements);
        self.protocols.push(descriptor);
        descriptor
    }

    /// Records a conformance and returns its witness table.
    pub fn conform(&mut self, ty: usize, protocol: usize) -> usize {
        let witness_table = self.alloc(16, 8);
        self.put_u64(witness_table, protocol as u64);
        let record = self.alloc(16, 4);
        self.put_rel(record, protocol);
        self.put_rel(record + 4, ty);
        self.put_rel(record + 8, witness_table);
        self.conformances.push(record);
        witness_table
    }

    fn value_witnesses(&mut self, size: usize, stride: usize, alignment: usize) -> usize {
        let vwt = self.alloc(0x70, 8);
        self.put_u64(vwt + 0x40, size as u64);
        self.put_u64(vwt + 0x48, stride as u64);
        self.put_u32(vwt + 0x50, (alignment - 1) as u32);
        vwt
    }

    fn publish(&mut self, descriptor: usize, metadata: usize) {
        let stub = self.alloc(4, 4);
        self.put_rel(descriptor + 0xc, stub);
        self.access.insert(stub, metadata);
    }

    /// Value type metadata reachable through the descriptor's access function.
    pub fn metadata(
        &mut self,
        descriptor: usize,
        kind: u64,
        (size, stride, alignment): (usize, usize, usize),
        field_offsets: &[u32],
    ) -> usize {
        let vwt = self.value_witnesses(size, stride, alignment);
        let block = self.alloc(8 * 3 + 4 * field_offsets.len(), 8);
        self.put_u64(block, vwt as u64);
        let metadata = block + 8;
        self.put_u64(metadata, kind);
        self.put_u64(metadata + 8, descriptor as u64);
        for (i, offset) in field_offsets.iter().enumerate() {
            self.put_u32(metadata + 16 + 4 * i, *offset);
        }
        self.publish(descriptor, metadata);
        metadata
    }

    pub fn class_metadata(&mut self, descriptor: usize) -> usize {
        let vwt = self.value_witnesses(8, 8, 8);
        let block = self.alloc(8 * (CLASS_DESCRIPTION_WORD + 2), 8);
        self.put_u64(block, vwt as u64);
        let metadata = block + 8;
        self.put_u64(metadata, CLASS_ISA);
        self.put_u64(metadata + 8 * CLASS_DESCRIPTION_WORD, descriptor as u64);
        self.publish(descriptor, metadata);
        metadata
    }

    /// A heap object of `size` bytes whose isa is `metadata`.
    pub fn object(&mut self, metadata: usize, size: usize) -> usize {
        let object = self.alloc(size, 16);
        self.put_u64(object, metadata as u64);
        object
    }

    /// A placeholder function address inside the image.
    pub fn function(&mut self, symbol: &str) -> usize {
        let address = self.alloc(4, 4);
        self.symbols.push(Symbol {
            name: symbol.to_string(),
            address,
        });
        address
    }

    fn section(&mut self, targets: &[usize]) -> Option<Section> {
        if targets.is_empty() {
            return None;
        }
        let address = self.alloc(4 * targets.len(), 4);
        for (i, target) in targets.iter().enumerate() {
            self.put_rel(address + 4 * i, *target);
        }
        Some(Section {
            address,
            size: 4 * targets.len(),
        })
    }

    pub fn finish(mut self, name: &str) -> SyntheticImage {
        let types = self.types.clone();
        let protocols = self.protocols.clone();
        let conformances = self.conformances.clone();
        let image = ModuleImage {
            name: name.to_string(),
            base: self.base(),
            size: CAPACITY_WORDS * 8,
            types: self.section(&types),
            protocols: self.section(&protocols),
            conformances: self.section(&conformances),
        };
        SyntheticImage {
            image,
            symbols: self.symbols,
            accessor: Arc::new(MapAccessor(self.access)),
            _storage: self.storage,
        }
    }
}

/// Answers metadata access functions from a fixed table.
pub struct MapAccessor(HashMap<usize, usize>);

impl MetadataAccessor for MapAccessor {
    fn access_metadata(&self, access_function: usize) -> Result<usize> {
        self.0
            .get(&access_function)
            .copied()
            .ok_or_else(|| BridgeError::not_found(format!("access function {access_function:#x}")))
    }
}

/// A finished image; its memory lives as long as this value.
pub struct SyntheticImage {
    pub image: ModuleImage,
    pub symbols: Vec<Symbol>,
    accessor: Arc<MapAccessor>,
    _storage: Box<[u64]>,
}

impl SyntheticImage {
    pub fn source(&self) -> StaticModuleSource {
        StaticModuleSource::new(vec![self.image.clone()]).with_symbols(&self.image.name, self.symbols.clone())
    }

    pub fn accessor(&self) -> Arc<dyn MetadataAccessor> {
        self.accessor.clone()
    }

    pub fn catalog(&self) -> Catalog {
        Catalog::new(Arc::new(LocalMemory), &self.source(), None).unwrap()
    }

    pub fn catalog_with_metadata(&self) -> Catalog {
        Catalog::new(Arc::new(LocalMemory), &self.source(), Some(self.accessor())).unwrap()
    }
}

pub const BASE_INIT: &str = "$s4main4BaseC2idACSi_tcfC";
pub const BASE_DESCRIBE: &str = "$s4main4BaseC8describeSSyF";

pub fn demangler() -> StaticDemangler {
    StaticDemangler(
        [
            (BASE_INIT, "main.Base.__allocating_init(id: Swift.Int) -> main.Base"),
            (BASE_DESCRIBE, "main.Base.describe() -> Swift.String"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect(),
    )
}

/// Descriptor and metadata addresses of [`main_module`].
pub struct MainModule {
    pub image: SyntheticImage,
    pub point: usize,
    pub line: usize,
    pub direction: usize,
    pub shape: usize,
    pub link: usize,
    pub settings: usize,
    pub broken: usize,
    pub outer: usize,
    pub inner: usize,
    pub base: usize,
    pub derived: usize,
    pub drawable: usize,
    pub named: usize,
    pub point_metadata: usize,
    pub line_metadata: usize,
    pub base_metadata: usize,
    pub derived_metadata: usize,
    pub point_drawable: usize,
    pub line_drawable: usize,
    pub base_named: usize,
    pub base_init: usize,
    pub base_describe: usize,
}

/// A module `main` shaped like:
///
/// ```swift
/// protocol Drawable { func draw(); var bounds: Line { get } }
/// protocol Named: AnyObject { var name: String { get } }
/// struct Point: Drawable { var x: Int; var y: Int }
/// struct Line: Drawable { var start: Point; var end: Point }
/// enum Direction { case north, south, east, west }
/// enum Shape { case circle(Int), square(Point), empty }
/// enum Link { indirect case next(Line), end }
/// struct Settings { let enabled: Bool; var limit: Int?; var shape: Shape }
/// struct Broken { var x: Int }  // metadata claims 16 bytes
/// struct Outer { struct Inner { var v: Int } }
/// struct Box<T> { var value: T }
/// class Base: Named { var id: Int; init(id: Int); func describe() -> String }
/// class Derived: Base { var flag: Bool }
/// ```
pub fn main_module() -> MainModule {
    let mut b = ImageBuilder::new();
    let module = b.module("main");

    let drawable = b.protocol(module, "Drawable", 2, false);
    let named = b.protocol(module, "Named", 1, true);

    let int = b.standard("Si");
    let point = b.structure(module, "Point", &[Record::var("x", int), Record::var("y", int)]);
    let point_ref = b.reference(point);
    let line = b.structure(
        module,
        "Line",
        &[Record::var("start", point_ref), Record::var("end", point_ref)],
    );
    let line_ref = b.reference(line);

    let direction = b.enumeration(
        module,
        "Direction",
        &[
            Record::empty("north"),
            Record::empty("south"),
            Record::empty("east"),
            Record::empty("west"),
        ],
    );
    let shape = b.enumeration(
        module,
        "Shape",
        &[
            Record::case("circle", int),
            Record::case("square", point_ref),
            Record::empty("empty"),
        ],
    );
    let link = b.enumeration(module, "Link", &[Record::indirect("next", line_ref), Record::empty("end")]);

    let bool_ = b.standard("Sb");
    let optional_int = b.standard("SiSg");
    let shape_ref = b.reference(shape);
    let settings = b.structure(
        module,
        "Settings",
        &[
            Record::constant("enabled", bool_),
            Record::var("limit", optional_int),
            Record::var("shape", shape_ref),
        ],
    );
    let broken = b.structure(module, "Broken", &[Record::var("x", int)]);
    let outer = b.structure(module, "Outer", &[]);
    let inner = b.structure(outer, "Inner", &[Record::var("v", int)]);
    b.generic_struct(module, "Box");

    let base_init = b.function(BASE_INIT);
    let base_describe = b.function(BASE_DESCRIBE);
    let base = b.declare_class(module, "Base", None, &[(0x1, base_init), (0x10, base_describe)]);
    b.set_fields(base, &[Record::var("id", int)]);
    let base_ref = b.reference(base);
    let derived = b.declare_class(module, "Derived", Some(base_ref), &[]);
    b.set_fields(derived, &[Record::var("flag", bool_)]);

    let point_drawable = b.conform(point, drawable);
    let line_drawable = b.conform(line, drawable);
    let base_named = b.conform(base, named);

    let point_metadata = b.metadata(point, STRUCT_KIND, (16, 16, 8), &[0, 8]);
    let line_metadata = b.metadata(line, STRUCT_KIND, (32, 32, 8), &[0, 16]);
    b.metadata(broken, STRUCT_KIND, (16, 16, 8), &[0]);
    let base_metadata = b.class_metadata(base);
    let derived_metadata = b.class_metadata(derived);

    MainModule {
        image: b.finish("main"),
        point,
        line,
        direction,
        shape,
        link,
        settings,
        broken,
        outer,
        inner,
        base,
        derived,
        drawable,
        named,
        point_metadata,
        line_metadata,
        base_metadata,
        derived_metadata,
        point_drawable,
        line_drawable,
        base_named,
        base_init,
        base_describe,
    }
}
