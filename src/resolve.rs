//! The metadata catalog: indexes the Swift sections of every image and turns
//! nominal type descriptors into [`TypeDescriptor`]s on demand.

use crate::{
    error::{BridgeError, Result},
    image::{ModuleImage, ModuleSource},
    memory::{Memory, POINTER_SIZE},
    metadata::{
        descriptors::{
            ClassDescriptor, ConformanceRecord, ContextDescriptor, EnumDescriptor,
            ProtocolRecord, StructDescriptor, TypeContextDescriptor,
        },
        mangling::{parse_type_name, NominalKind, TypeName},
        records::FieldDescriptor,
        relative::{RelativeDirectPointer, RelativeIndirectablePointer},
        values::ContextDescriptorKind,
        TypeMetadata,
    },
    types::{
        builtins,
        members::{EnumCase, Field, MethodEntry},
        protocols::{ProtocolComposition, ProtocolDescriptor},
        CaseSpec, TypeDescriptor, TypeKind,
    },
    value::{
        enums::DecodedEnum,
        existential::boxed_value_offset,
        layout::{FieldLayoutManager, HasLayout, Layout, OpaqueLayoutManager, HEAP_OBJECT_HEADER_SIZE},
        Value,
    },
    utils::split_top_level,
};
use dashmap::DashMap;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, warn};

/// Runs type metadata access functions.
pub trait MetadataAccessor: Send + Sync {
    /// Calls `access_function` with a request for complete metadata.
    fn access_metadata(&self, access_function: usize) -> Result<usize>;
}

/// An indexed nominal type; cheap to list, resolved lazily.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeEntry {
    pub kind: TypeKind,
    pub module: String,
    pub name: String,
    pub descriptor: usize,
    pub image: String,
}

impl TypeEntry {
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.module, self.name)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SwiftModule {
    pub name: String,
    pub classes: Vec<String>,
    pub structs: Vec<String>,
    pub enums: Vec<String>,
    pub protocols: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct ConformanceEntry {
    protocol: String,
    witness_table: usize,
    image: String,
}

/// Instance layout of a class, superclass fields first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassInstance {
    pub fields: Vec<Field>,
    pub size: usize,
    pub alignment: usize,
}

/// Caches for resolved types and layouts.
#[derive(Default)]
pub struct CatalogCaches {
    /// Descriptor address -> resolved type
    pub types: DashMap<usize, Arc<TypeDescriptor>>,
    /// Full name -> builtin, standard, tuple, optional and existential types
    pub synthetic: DashMap<String, Arc<TypeDescriptor>>,
    /// Metadata address -> type
    pub by_metadata: DashMap<usize, Arc<TypeDescriptor>>,
    /// Full name -> metadata address
    pub metadata: DashMap<String, usize>,
    /// Class descriptor -> instance layout
    pub class_instances: DashMap<usize, Arc<ClassInstance>>,
}

pub struct Catalog {
    memory: Arc<dyn Memory>,
    accessor: Option<Arc<dyn MetadataAccessor>>,
    images: DashMap<String, ModuleImage>,
    entries: DashMap<(String, String), TypeEntry>,
    protocols: DashMap<String, (Arc<ProtocolDescriptor>, String)>,
    conformances: DashMap<String, Vec<ConformanceEntry>>,
    symbols: DashMap<usize, String>,
    symbol_addresses: DashMap<String, usize>,
    pub caches: CatalogCaches,
}

/// Resolves one entry of `__swift5_types`: the low two bits of the offset
/// select a direct or an indirect reference.
fn type_record(memory: &dyn Memory, at: usize) -> Result<Option<usize>> {
    let raw = memory.read_i32(at)?;
    if raw == 0 {
        return Ok(None);
    }
    let target = at.wrapping_add_signed((raw & !3) as isize);
    match raw & 3 {
        0 => Ok(Some(target)),
        1 => Ok(Some(memory.read_pointer(target)?).filter(|&p| p != 0)),
        _ => Ok(None),
    }
}

impl Catalog {
    fn empty(memory: Arc<dyn Memory>, accessor: Option<Arc<dyn MetadataAccessor>>) -> Self {
        Self {
            memory,
            accessor,
            images: DashMap::new(),
            entries: DashMap::new(),
            protocols: DashMap::new(),
            conformances: DashMap::new(),
            symbols: DashMap::new(),
            symbol_addresses: DashMap::new(),
            caches: CatalogCaches::default(),
        }
    }

    /// Indexes every image of `source`. Conformances are bound after all
    /// types and protocols are known.
    pub fn new(
        memory: Arc<dyn Memory>,
        source: &dyn ModuleSource,
        accessor: Option<Arc<dyn MetadataAccessor>>,
    ) -> Result<Self> {
        let catalog = Self::empty(memory, accessor);
        let images = source.list_modules()?;
        for image in &images {
            catalog.index_image(source, image)?;
        }
        for image in &images {
            catalog.index_conformances(image)?;
        }
        debug!(
            images = images.len(),
            types = catalog.entries.len(),
            protocols = catalog.protocols.len(),
            "catalog ready"
        );
        Ok(catalog)
    }

    pub fn memory(&self) -> &Arc<dyn Memory> {
        &self.memory
    }

    pub fn images(&self) -> Vec<ModuleImage> {
        self.images.iter().map(|i| i.value().clone()).collect()
    }

    /// Indexes an image loaded after construction.
    pub fn load_image(&self, source: &dyn ModuleSource, image: &ModuleImage) -> Result<()> {
        self.index_image(source, image)?;
        self.index_conformances(image)
    }

    fn index_image(&self, source: &dyn ModuleSource, image: &ModuleImage) -> Result<()> {
        debug!(image = %image.name, base = image.base, "indexing image");
        self.images.insert(image.name.clone(), image.clone());
        let memory = self.memory.as_ref();

        if let Some(section) = image.types {
            for entry in section.entries() {
                let indexed = type_record(memory, entry)
                    .and_then(|address| match address {
                        Some(address) => self.index_type(address, image),
                        None => Ok(()),
                    });
                if let Err(e) = indexed {
                    warn!(image = %image.name, entry, error = %e, "skipping type record");
                }
            }
        }

        if let Some(section) = image.protocols {
            for entry in section.entries() {
                if let Err(e) = self.index_protocol(entry, image) {
                    warn!(image = %image.name, entry, error = %e, "skipping protocol record");
                }
            }
        }

        match source.enumerate_symbols(image) {
            Ok(symbols) => {
                for symbol in symbols {
                    self.symbol_addresses.insert(symbol.name.clone(), symbol.address);
                    self.symbols.insert(symbol.address, symbol.name);
                }
            }
            Err(e) => warn!(image = %image.name, error = %e, "cannot enumerate symbols"),
        }
        Ok(())
    }

    fn index_type(&self, address: usize, image: &ModuleImage) -> Result<()> {
        let context = ContextDescriptor::read(self.memory.as_ref(), address)?;
        let Some(kind) = context.kind().and_then(TypeKind::from_context) else {
            warn!(address, flags = context.flags.0, "not a nominal type descriptor");
            return Ok(());
        };
        let (module, name) = context.qualified_name(self.memory.as_ref())?;
        if context.flags.is_generic() {
            debug!(%module, %name, "skipping generic type");
            return Ok(());
        }
        self.entries.insert(
            (module.clone(), name.clone()),
            TypeEntry {
                kind,
                module,
                name,
                descriptor: address,
                image: image.name.clone(),
            },
        );
        Ok(())
    }

    fn index_protocol(&self, entry: usize, image: &ModuleImage) -> Result<()> {
        let memory = self.memory.as_ref();
        let Some(address) = RelativeIndirectablePointer::resolve(memory, entry)? else {
            return Ok(());
        };
        let context = ContextDescriptor::read(memory, address)?;
        if context.kind() != Some(ContextDescriptorKind::Protocol) {
            warn!(address, "not a protocol descriptor");
            return Ok(());
        }
        let record = ProtocolRecord::read(memory, context)?;
        let (module, name) = context.qualified_name(memory)?;
        let protocol = ProtocolDescriptor {
            name,
            module,
            descriptor: Some(address),
            num_requirements: record.num_requirements as usize,
            class_only: record.class_constrained,
        };
        self.protocols
            .insert(protocol.full_name(), (Arc::new(protocol), image.name.clone()));
        Ok(())
    }

    fn context_full_name(&self, address: usize) -> Result<String> {
        let context = ContextDescriptor::read(self.memory.as_ref(), address)?;
        let (module, name) = context.qualified_name(self.memory.as_ref())?;
        Ok(format!("{module}.{name}"))
    }

    fn index_conformances(&self, image: &ModuleImage) -> Result<()> {
        let Some(section) = image.conformances else {
            return Ok(());
        };
        let memory = self.memory.as_ref();
        for entry in section.entries() {
            let bound = RelativeDirectPointer::resolve(memory, entry)
                .map_err(BridgeError::from)
                .and_then(|address| match address {
                    Some(address) => self.bind_conformance(address, image),
                    None => Ok(()),
                });
            if let Err(e) = bound {
                warn!(image = %image.name, entry, error = %e, "skipping conformance record");
            }
        }
        Ok(())
    }

    fn bind_conformance(&self, address: usize, image: &ModuleImage) -> Result<()> {
        let record = ConformanceRecord::read(self.memory.as_ref(), address)?;
        let (Some(protocol), Some(ty), Some(witness_table)) =
            (record.protocol, record.type_descriptor, record.witness_table)
        else {
            return Ok(());
        };
        let protocol = self.context_full_name(protocol)?;
        let ty = self.context_full_name(ty)?;
        debug!(%ty, %protocol, witness_table, "conformance");
        self.conformances.entry(ty).or_default().push(ConformanceEntry {
            protocol,
            witness_table,
            image: image.name.clone(),
        });
        Ok(())
    }

    /// Forgets everything indexed from `image` and every type resolved from it.
    pub fn unload_image(&self, name: &str) -> Option<ModuleImage> {
        let (_, image) = self.images.remove(name)?;
        let inside = |address: usize| image.contains(address);
        self.entries.retain(|_, e| e.image != name);
        self.protocols.retain(|_, (_, owner)| owner.as_str() != name);
        self.conformances.retain(|_, list| {
            list.retain(|c| c.image != name);
            !list.is_empty()
        });
        self.symbols.retain(|address, _| !inside(*address));
        self.symbol_addresses.retain(|_, address| !inside(*address));
        self.caches.types.retain(|address, _| !inside(*address));
        self.caches.class_instances.retain(|address, _| !inside(*address));
        self.caches
            .by_metadata
            .retain(|address, ty| !inside(*address) && !ty.descriptor.is_some_and(inside));
        self.caches.metadata.retain(|_, address| !inside(*address));
        // synthetic types may wrap unloaded ones; they are rebuilt on demand
        self.caches.synthetic.clear();
        debug!(image = %name, "unloaded image");
        Some(image)
    }

    pub fn list_modules(&self) -> Vec<SwiftModule> {
        let mut modules: BTreeMap<String, SwiftModule> = BTreeMap::new();
        for entry in self.entries.iter() {
            let module = modules
                .entry(entry.module.clone())
                .or_insert_with(|| SwiftModule {
                    name: entry.module.clone(),
                    ..Default::default()
                });
            let list = match entry.kind {
                TypeKind::Class => &mut module.classes,
                TypeKind::Struct => &mut module.structs,
                TypeKind::Enum => &mut module.enums,
                TypeKind::Protocol => &mut module.protocols,
            };
            list.push(entry.name.clone());
        }
        for protocol in self.protocols.iter() {
            let (protocol, _) = protocol.value();
            modules
                .entry(protocol.module.clone())
                .or_insert_with(|| SwiftModule {
                    name: protocol.module.clone(),
                    ..Default::default()
                })
                .protocols
                .push(protocol.name.clone());
        }
        modules
            .into_values()
            .map(|mut m| {
                m.classes.sort();
                m.structs.sort();
                m.enums.sort();
                m.protocols.sort();
                m
            })
            .collect()
    }

    /// Every indexed type of `module`, without resolving any of them.
    pub fn entries(&self, module: &str) -> Vec<TypeEntry> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .filter(|e| e.module == module)
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub fn entry(&self, module: &str, name: &str) -> Option<TypeEntry> {
        self.entries
            .get(&(module.to_string(), name.to_string()))
            .map(|e| e.value().clone())
    }

    pub fn protocols(&self, module: &str) -> Vec<Arc<ProtocolDescriptor>> {
        let mut protocols: Vec<_> = self
            .protocols
            .iter()
            .filter(|p| p.value().0.module == module)
            .map(|p| p.value().0.clone())
            .collect();
        protocols.sort_by(|a, b| a.name.cmp(&b.name));
        protocols
    }

    /// Every type of `module` that resolves. Failures are logged and skipped.
    pub fn all_types(&self, module: &str) -> Vec<Arc<TypeDescriptor>> {
        self.entries(module)
            .into_iter()
            .filter_map(|entry| match self.resolve_descriptor(entry.descriptor) {
                Ok(ty) => Some(ty),
                Err(e) => {
                    warn!(ty = %entry.full_name(), error = %e, "skipping unresolvable type");
                    None
                }
            })
            .collect()
    }

    pub fn resolve_type(&self, module: &str, kind: TypeKind, name: &str) -> Result<Arc<TypeDescriptor>> {
        if kind == TypeKind::Protocol {
            let protocol = self.resolve_protocol(&format!("{module}.{name}"))?;
            return Ok(self.existential_type(&ProtocolComposition::new(vec![protocol])));
        }
        match self.entry(module, name) {
            Some(entry) if entry.kind == kind => self.resolve_descriptor(entry.descriptor),
            _ => Err(BridgeError::not_found(format!("{kind} {module}.{name}"))),
        }
    }

    pub fn resolve_protocol(&self, full_name: &str) -> Result<Arc<ProtocolDescriptor>> {
        self.protocols
            .get(full_name)
            .map(|p| p.value().0.clone())
            .ok_or_else(|| BridgeError::not_found(format!("protocol {full_name}")))
    }

    /// Parses `"A & B"`, `Any` or `AnyObject` into a composition.
    pub fn composition(&self, name: &str) -> Result<ProtocolComposition> {
        let mut protocols = vec![];
        let mut class_only = false;
        for part in ProtocolComposition::split(name) {
            match part {
                "Any" | "Swift.Any" => {}
                "AnyObject" | "Swift.AnyObject" => class_only = true,
                _ => protocols.push(self.resolve_protocol(part)?),
            }
        }
        let mut composition = ProtocolComposition::new(protocols);
        composition.class_only |= class_only;
        Ok(composition)
    }

    fn synthetic(
        &self,
        key: String,
        build: impl FnOnce() -> Result<TypeDescriptor>,
    ) -> Result<Arc<TypeDescriptor>> {
        if let Some(ty) = self.caches.synthetic.get(&key) {
            return Ok(ty.clone());
        }
        let ty = Arc::new(build()?);
        Ok(self.caches.synthetic.entry(key).or_insert(ty).clone())
    }

    pub fn existential_type(&self, composition: &ProtocolComposition) -> Arc<TypeDescriptor> {
        let key = composition.name();
        if let Some(ty) = self.caches.synthetic.get(&key) {
            return ty.clone();
        }
        let ty = Arc::new(TypeDescriptor::existential(composition.clone()));
        self.caches.synthetic.entry(key).or_insert(ty).clone()
    }

    pub fn standard_type(&self, name: &str) -> Result<Arc<TypeDescriptor>> {
        self.synthetic(format!("{}.{name}", builtins::STANDARD_MODULE), || {
            builtins::standard(name).ok_or_else(|| BridgeError::not_found(format!("Swift.{name}")))
        })
    }

    pub fn optional_type(&self, wrapped: Arc<TypeDescriptor>) -> Result<Arc<TypeDescriptor>> {
        self.synthetic(format!("Swift.Optional<{}>", wrapped.full_name()), || {
            Ok(builtins::optional(wrapped))
        })
    }

    pub fn tuple_type(&self, elements: Vec<Arc<TypeDescriptor>>) -> Result<Arc<TypeDescriptor>> {
        let ty = builtins::tuple(elements);
        self.synthetic(ty.full_name(), || Ok(ty))
    }

    /// Resolves a type by its source-level name: `main.Foo`, `Swift.Int`,
    /// `Swift.Int?`, `[Swift.Int]`, `(Swift.Int, Swift.Bool)` or `P & Q`.
    pub fn resolve_type_name(&self, name: &str) -> Result<Arc<TypeDescriptor>> {
        let name = name.trim();
        if let Some(inner) = name.strip_suffix('?') {
            return self.optional_type(self.resolve_type_name(inner)?);
        }
        if let Some(inner) = name.strip_prefix('[').and_then(|n| n.strip_suffix(']')) {
            let parts = split_top_level(inner, ':');
            let arguments = parts
                .iter()
                .map(|p| self.resolve_type_name(p))
                .collect::<Result<Vec<_>>>()?;
            let base = if arguments.len() == 2 { "Dictionary" } else { "Array" };
            return self.standard_generic_type(base, arguments);
        }
        if let Some(inner) = name.strip_prefix('(').and_then(|n| n.strip_suffix(')')) {
            let elements = if inner.trim().is_empty() {
                vec![]
            } else {
                split_top_level(inner, ',')
                    .into_iter()
                    .map(|e| {
                        // drop a label
                        let e = split_top_level(e, ':').pop().unwrap_or(e);
                        self.resolve_type_name(e)
                    })
                    .collect::<Result<Vec<_>>>()?
            };
            return self.tuple_type(elements);
        }
        if name.contains('&') || matches!(name, "Any" | "AnyObject") {
            return Ok(self.existential_type(&self.composition(name)?));
        }
        if let Some(open) = name.find('<') {
            let base = &name[..open];
            let arguments = name[open + 1..].strip_suffix('>').ok_or_else(|| {
                BridgeError::InvalidValue(format!("malformed type name {name}"))
            })?;
            let arguments = split_top_level(arguments, ',')
                .into_iter()
                .map(|a| self.resolve_type_name(a))
                .collect::<Result<Vec<_>>>()?;
            let base = base.strip_prefix("Swift.").unwrap_or(base);
            if base == "Optional" && arguments.len() == 1 {
                return self.optional_type(arguments[0].clone());
            }
            return self.standard_generic_type(base, arguments);
        }
        let (module, short) = name
            .split_once('.')
            .ok_or_else(|| BridgeError::not_found(format!("type {name} (expected Module.Name)")))?;
        if module == builtins::STANDARD_MODULE {
            if let Ok(ty) = self.standard_type(short) {
                return Ok(ty);
            }
        }
        if let Some(entry) = self.entry(module, short) {
            return self.resolve_descriptor(entry.descriptor);
        }
        if let Ok(protocol) = self.resolve_protocol(name) {
            return Ok(self.existential_type(&ProtocolComposition::new(vec![protocol])));
        }
        Err(BridgeError::not_found(format!("type {name}")))
    }

    fn standard_generic_type(&self, base: &str, arguments: Vec<Arc<TypeDescriptor>>) -> Result<Arc<TypeDescriptor>> {
        let ty = builtins::standard_generic(base, &arguments)
            .ok_or_else(|| BridgeError::not_found(format!("generic type Swift.{base}")))?;
        self.synthetic(ty.full_name(), || Ok(ty))
    }

    /// Resolves the nominal type whose context descriptor is at `address`.
    pub fn resolve_descriptor(&self, address: usize) -> Result<Arc<TypeDescriptor>> {
        self.resolve_descriptor_in(address, &mut vec![])
    }

    fn resolve_descriptor_in(&self, address: usize, stack: &mut Vec<usize>) -> Result<Arc<TypeDescriptor>> {
        if let Some(ty) = self.caches.types.get(&address) {
            return Ok(ty.clone());
        }
        let memory = self.memory.as_ref();
        let context = ContextDescriptor::read(memory, address)?;
        let (module, name) = context.qualified_name(memory)?;
        let full_name = format!("{module}.{name}");
        if stack.contains(&address) {
            return Err(BridgeError::layout(full_name, "type contains itself"));
        }
        if module == builtins::STANDARD_MODULE && builtins::standard(&name).is_some() {
            return self.standard_type(&name);
        }
        let kind = context
            .kind()
            .and_then(TypeKind::from_context)
            .ok_or_else(|| BridgeError::not_found(format!("type descriptor at {address:#x}")))?;
        if context.flags.is_generic() {
            return Err(BridgeError::layout(full_name, "generic types are not supported"));
        }
        if kind == TypeKind::Protocol {
            let protocol = self.resolve_protocol(&full_name)?;
            return Ok(self.existential_type(&ProtocolComposition::new(vec![protocol])));
        }

        stack.push(address);
        let descriptor = TypeContextDescriptor::read(memory, context)?;
        let metadata = self.metadata_for_descriptor(&full_name, &descriptor);
        let built = match kind {
            TypeKind::Struct => self.build_struct(&module, &name, &descriptor, metadata, stack),
            TypeKind::Enum => self.build_enum(&module, &name, &descriptor, metadata, stack),
            _ => self.build_class(&module, &name, &descriptor),
        };
        stack.pop();
        let mut ty = built?.with_descriptor(address);
        if let Some(metadata) = metadata {
            ty = ty.with_metadata(metadata);
        }
        for conformance in self.conformances_of(&full_name) {
            ty = ty.with_conformance(conformance.protocol, conformance.witness_table);
        }

        debug!(ty = %full_name, layout = ?ty.layout(), "resolved");
        let ty = self.caches.types.entry(address).or_insert(Arc::new(ty)).clone();
        if let Some(metadata) = ty.metadata {
            self.caches.by_metadata.entry(metadata).or_insert(ty.clone());
        }
        Ok(ty)
    }

    fn conformances_of(&self, full_name: &str) -> Vec<ConformanceEntry> {
        self.conformances
            .get(full_name)
            .map(|c| c.value().clone())
            .unwrap_or_default()
    }

    fn metadata_for_descriptor(&self, full_name: &str, descriptor: &TypeContextDescriptor) -> Option<usize> {
        if let Some(metadata) = self.caches.metadata.get(full_name) {
            return Some(*metadata);
        }
        let accessor = self.accessor.as_ref()?;
        let function = descriptor.access_function?;
        match accessor.access_metadata(function) {
            Ok(0) => None,
            Ok(metadata) => {
                self.caches.metadata.insert(full_name.to_string(), metadata);
                Some(metadata)
            }
            Err(e) => {
                warn!(ty = %full_name, error = %e, "metadata access function failed");
                None
            }
        }
    }

    fn field_records(&self, descriptor: &TypeContextDescriptor) -> Result<FieldDescriptor> {
        match descriptor.fields {
            Some(fields) => Ok(FieldDescriptor::read(self.memory.as_ref(), fields)?),
            None => Ok(FieldDescriptor {
                address: 0,
                records: vec![],
            }),
        }
    }

    fn mangled_type(&self, owner: &str, address: usize) -> Result<TypeName> {
        parse_type_name(self.memory.as_ref(), address)
            .map_err(|e| BridgeError::layout(owner, e.to_string()))
    }

    fn build_struct(
        &self,
        module: &str,
        name: &str,
        descriptor: &TypeContextDescriptor,
        metadata: Option<usize>,
        stack: &mut Vec<usize>,
    ) -> Result<TypeDescriptor> {
        let full_name = format!("{module}.{name}");
        let computed = self.struct_fields(&full_name, descriptor, stack).map(|fields| {
            let vars: Vec<bool> = fields.iter().map(|(_, _, var)| *var).collect();
            let mut ty = TypeDescriptor::structure(
                module,
                name,
                fields.into_iter().map(|(n, t, _)| (n, t)).collect(),
            );
            for (field, var) in ty.fields.iter_mut().zip(vars) {
                field.is_var = var;
            }
            ty
        });
        let Some(metadata) = metadata else {
            return computed;
        };
        match computed {
            Ok(ty) => {
                self.verify_layout(&full_name, &ty, metadata)?;
                let info = StructDescriptor::read(self.memory.as_ref(), descriptor.context.address)?;
                self.verify_field_offsets(
                    &full_name,
                    &ty.fields,
                    metadata,
                    info.field_offset_vector_offset as usize,
                )?;
                Ok(ty)
            }
            Err(e @ BridgeError::Layout { .. }) => {
                warn!(ty = %full_name, error = %e, "falling back to runtime layout");
                self.opaque(module, name, TypeKind::Struct, metadata)
            }
            Err(e) => Err(e),
        }
    }

    fn struct_fields(
        &self,
        full_name: &str,
        descriptor: &TypeContextDescriptor,
        stack: &mut Vec<usize>,
    ) -> Result<Vec<(String, Arc<TypeDescriptor>, bool)>> {
        let records = self.field_records(descriptor)?;
        records
            .records
            .into_iter()
            .map(|record| {
                let mangled = record.mangled_type_name.ok_or_else(|| {
                    BridgeError::layout(full_name, format!("field {} has no type", record.name))
                })?;
                let name = self.mangled_type(full_name, mangled)?;
                let ty = self.resolve_type_name_in(full_name, &name, stack)?;
                Ok((record.name, ty, record.flags.is_var()))
            })
            .collect()
    }

    fn build_enum(
        &self,
        module: &str,
        name: &str,
        descriptor: &TypeContextDescriptor,
        metadata: Option<usize>,
        stack: &mut Vec<usize>,
    ) -> Result<TypeDescriptor> {
        let full_name = format!("{module}.{name}");
        let info = EnumDescriptor::read(self.memory.as_ref(), descriptor.context.address)?;
        let computed = self.enum_cases(&full_name, descriptor, stack).and_then(|cases| {
            let ty = TypeDescriptor::enumeration(module, name, cases);
            let payloads = ty.cases.iter().filter(|c| c.has_payload()).count();
            if payloads != info.num_payload_cases as usize || ty.cases.len() != info.num_cases() as usize {
                return Err(BridgeError::layout(
                    &full_name,
                    format!(
                        "{} cases in field records but {} in the descriptor",
                        ty.cases.len(),
                        info.num_cases()
                    ),
                ));
            }
            Ok(ty)
        });
        let Some(metadata) = metadata else {
            return computed;
        };
        match computed {
            Ok(ty) => {
                self.verify_layout(&full_name, &ty, metadata)?;
                Ok(ty)
            }
            Err(e @ BridgeError::Layout { .. }) => {
                warn!(ty = %full_name, error = %e, "falling back to runtime layout");
                self.opaque(module, name, TypeKind::Enum, metadata)
            }
            Err(e) => Err(e),
        }
    }

    fn enum_cases(
        &self,
        full_name: &str,
        descriptor: &TypeContextDescriptor,
        stack: &mut Vec<usize>,
    ) -> Result<Vec<CaseSpec>> {
        let records = self.field_records(descriptor)?;
        records
            .records
            .into_iter()
            .map(|record| {
                let Some(mangled) = record.mangled_type_name else {
                    return Ok(CaseSpec::Empty(record.name));
                };
                let name = self.mangled_type(full_name, mangled)?;
                if record.flags.is_indirect_case() {
                    return Ok(CaseSpec::Indirect(record.name, name));
                }
                let ty = self.resolve_type_name_in(full_name, &name, stack)?;
                Ok(CaseSpec::Payload(record.name, ty))
            })
            .collect()
    }

    fn build_class(&self, module: &str, name: &str, descriptor: &TypeContextDescriptor) -> Result<TypeDescriptor> {
        let class = ClassDescriptor::read(self.memory.as_ref(), descriptor)?;
        let methods = class
            .methods
            .iter()
            .filter_map(|m| {
                let address = m.implementation?;
                Some(MethodEntry {
                    kind: m.flags.kind()?,
                    address,
                    symbol: self.symbol_at(address),
                    is_instance: m.flags.is_instance(),
                })
            })
            .collect();
        Ok(TypeDescriptor::class(module, name).with_methods(methods))
    }

    fn opaque(&self, module: &str, name: &str, kind: TypeKind, metadata: usize) -> Result<TypeDescriptor> {
        let vwt = self.read_metadata(&format!("{module}.{name}"), metadata)?
            .value_witnesses(self.memory.as_ref())?;
        Ok(TypeDescriptor::new(kind, module, name, OpaqueLayoutManager::from_witnesses(&vwt)))
    }

    fn read_metadata(&self, full_name: &str, metadata: usize) -> Result<TypeMetadata> {
        TypeMetadata::read(self.memory.as_ref(), metadata)?
            .ok_or_else(|| BridgeError::layout(full_name, format!("invalid metadata at {metadata:#x}")))
    }

    fn verify_layout(&self, full_name: &str, ty: &TypeDescriptor, metadata: usize) -> Result<()> {
        let vwt = self
            .read_metadata(full_name, metadata)?
            .value_witnesses(self.memory.as_ref())?;
        let computed = ty.layout();
        let reported = (vwt.size, vwt.stride, vwt.alignment());
        if (computed.size, computed.stride, computed.alignment) != reported {
            return Err(BridgeError::layout(
                full_name,
                format!(
                    "computed size/stride/alignment {}/{}/{} but the runtime reports {}/{}/{}",
                    computed.size, computed.stride, computed.alignment, reported.0, reported.1, reported.2
                ),
            ));
        }
        Ok(())
    }

    fn verify_field_offsets(
        &self,
        full_name: &str,
        fields: &[Field],
        metadata: usize,
        vector_offset: usize,
    ) -> Result<()> {
        if fields.is_empty() || vector_offset == 0 {
            return Ok(());
        }
        let offsets = self
            .read_metadata(full_name, metadata)?
            .field_offsets(self.memory.as_ref(), vector_offset, fields.len())?;
        for (field, offset) in fields.iter().zip(offsets) {
            if field.offset != offset {
                return Err(BridgeError::layout(
                    full_name,
                    format!(
                        "field {} computed at {} but the runtime places it at {offset}",
                        field.name, field.offset
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Resolves a parsed mangled name appearing in the metadata of `owner`.
    pub fn resolve_mangled(&self, owner: &str, name: &TypeName) -> Result<Arc<TypeDescriptor>> {
        self.resolve_type_name_in(owner, name, &mut vec![])
    }

    fn resolve_type_name_in(
        &self,
        owner: &str,
        name: &TypeName,
        stack: &mut Vec<usize>,
    ) -> Result<Arc<TypeDescriptor>> {
        let unsupported = |what: &str| BridgeError::layout(owner, format!("unsupported {what} {name}"));
        match name {
            TypeName::Context(address) => {
                let context = ContextDescriptor::read(self.memory.as_ref(), *address)?;
                if context.kind() == Some(ContextDescriptorKind::Protocol) {
                    let protocol = self.resolve_protocol(&self.context_full_name(*address)?)?;
                    return Ok(self.existential_type(&ProtocolComposition::new(vec![protocol])));
                }
                self.resolve_descriptor_in(*address, stack)
            }
            TypeName::Nominal {
                module,
                name: short,
                kind,
            } => {
                if module == builtins::STANDARD_MODULE {
                    if let Ok(ty) = self.standard_type(short) {
                        return Ok(ty);
                    }
                }
                if *kind == NominalKind::Protocol {
                    let protocol = self.resolve_protocol(&format!("{module}.{short}"))?;
                    return Ok(self.existential_type(&ProtocolComposition::new(vec![protocol])));
                }
                match self.entry(module, short) {
                    Some(entry) => self.resolve_descriptor_in(entry.descriptor, stack),
                    None => Err(BridgeError::layout(owner, format!("unknown type {name}"))),
                }
            }
            TypeName::Builtin(builtin) => {
                let ty = builtins::builtin(*builtin).ok_or_else(|| unsupported("builtin"))?;
                self.synthetic(ty.full_name(), || Ok(ty))
            }
            TypeName::Tuple(elements) => {
                let elements = elements
                    .iter()
                    .map(|e| self.resolve_type_name_in(owner, e, stack))
                    .collect::<Result<Vec<_>>>()?;
                self.tuple_type(elements)
            }
            TypeName::BoundGeneric { base, arguments } => {
                let TypeName::Nominal { module, name: base, .. } = base.as_ref() else {
                    return Err(unsupported("generic"));
                };
                if module != builtins::STANDARD_MODULE {
                    return Err(unsupported("generic"));
                }
                let arguments = arguments
                    .iter()
                    .map(|a| self.resolve_type_name_in(owner, a, stack))
                    .collect::<Result<Vec<_>>>()?;
                if base == "Optional" && arguments.len() == 1 {
                    return self.optional_type(arguments[0].clone());
                }
                self.standard_generic_type(base, arguments)
                    .map_err(|_| unsupported("generic"))
            }
            TypeName::Existential {
                protocols,
                class_bound,
            } => {
                let protocols = protocols
                    .iter()
                    .map(|p| match p {
                        TypeName::Context(address) => {
                            self.resolve_protocol(&self.context_full_name(*address)?)
                        }
                        TypeName::Nominal { module, name, .. } => {
                            self.resolve_protocol(&format!("{module}.{name}"))
                        }
                        _ => Err(unsupported("protocol")),
                    })
                    .collect::<Result<Vec<_>>>()?;
                let mut composition = ProtocolComposition::new(protocols);
                composition.class_only |= class_bound;
                Ok(self.existential_type(&composition))
            }
            TypeName::Reference { ownership, referent } => {
                // the referent is never stored inline, so it cannot recurse
                let referent = self.resolve_type_name_in(owner, referent, &mut vec![])?;
                let ty = builtins::reference(*ownership, &referent);
                self.synthetic(ty.full_name(), || Ok(ty))
            }
        }
    }

    pub fn layout_of(&self, ty: &TypeDescriptor) -> Layout {
        ty.layout()
    }

    /// Stored properties; for classes, the instance fields including
    /// inherited ones.
    pub fn fields_of(&self, ty: &TypeDescriptor) -> Result<Vec<Field>> {
        if ty.is_class() {
            return Ok(self.class_instance(ty)?.fields.clone());
        }
        Ok(ty.fields.clone())
    }

    pub fn cases_of(&self, ty: &TypeDescriptor) -> Vec<EnumCase> {
        ty.cases.clone()
    }

    pub fn methods_of(&self, ty: &TypeDescriptor) -> Vec<MethodEntry> {
        ty.methods.clone()
    }

    pub fn superclass_of(&self, ty: &TypeDescriptor) -> Result<Option<Arc<TypeDescriptor>>> {
        let Some(address) = ty.descriptor.filter(|_| ty.is_class()) else {
            return Ok(None);
        };
        let memory = self.memory.as_ref();
        let descriptor = TypeContextDescriptor::read(memory, ContextDescriptor::read(memory, address)?)?;
        let class = ClassDescriptor::read(memory, &descriptor)?;
        let Some(superclass) = class.superclass_type else {
            return Ok(None);
        };
        let name = self.mangled_type(&ty.full_name(), superclass)?;
        let superclass = self.resolve_mangled(&ty.full_name(), &name)?;
        if !superclass.is_class() {
            return Err(BridgeError::layout(ty.full_name(), format!("superclass {} is not a class", superclass.full_name())));
        }
        Ok(Some(superclass))
    }

    pub fn class_instance(&self, ty: &TypeDescriptor) -> Result<Arc<ClassInstance>> {
        let full_name = ty.full_name();
        let address = ty
            .descriptor
            .filter(|_| ty.is_class())
            .ok_or_else(|| BridgeError::InvalidValue(format!("{full_name} is not a class")))?;
        if let Some(instance) = self.caches.class_instances.get(&address) {
            return Ok(instance.clone());
        }
        let memory = self.memory.as_ref();
        let descriptor = TypeContextDescriptor::read(memory, ContextDescriptor::read(memory, address)?)?;
        let class = ClassDescriptor::read(memory, &descriptor)?;

        let (mut fields, start, alignment) = match self.superclass_of(ty)? {
            Some(superclass) => {
                let base = self.class_instance(&superclass)?;
                (base.fields.clone(), base.size, base.alignment)
            }
            None => (vec![], HEAP_OBJECT_HEADER_SIZE, POINTER_SIZE),
        };
        let own = self.struct_fields(&full_name, &descriptor, &mut vec![])?;
        let layout = FieldLayoutManager::sequential_from(
            start,
            alignment,
            own.iter().map(|(name, ty, _)| (name.clone(), ty.layout.clone())),
        );
        let runtime_offsets = match ty.metadata {
            Some(metadata) if class.field_offset_vector_offset != 0 => Some(
                self.read_metadata(&full_name, metadata)?.field_offsets(
                    memory,
                    class.field_offset_vector_offset as usize,
                    own.len(),
                )?,
            ),
            _ => None,
        };
        let mut size = layout.total_size;
        for (i, ((name, field_ty, is_var), computed)) in own.into_iter().zip(&layout.fields).enumerate() {
            let offset = runtime_offsets
                .as_ref()
                .and_then(|o| o.get(i).copied())
                .unwrap_or(computed.position);
            size = size.max(offset + field_ty.size());
            fields.push(Field {
                name,
                offset,
                ty: field_ty,
                is_var,
            });
        }
        let instance = Arc::new(ClassInstance {
            fields,
            size,
            alignment: layout.alignment,
        });
        Ok(self
            .caches
            .class_instances
            .entry(address)
            .or_insert(instance)
            .clone())
    }

    /// A view of an instance field of the object held by `object`.
    pub fn instance_field(&self, object: &Value, name: &str) -> Result<Value> {
        let instance = self.class_instance(object.ty())?;
        let field = instance
            .fields
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| {
                BridgeError::not_found(format!("field {name} of {}", object.ty().full_name()))
            })?;
        let address = object.object_address()?;
        Ok(Value::borrowed(
            self.memory.clone(),
            field.ty.clone(),
            address + field.offset,
        ))
    }

    /// A view of the boxed payload of an indirect enum case.
    pub fn project_indirect_payload(&self, ty: &TypeDescriptor, decoded: &DecodedEnum) -> Result<Value> {
        let case = ty
            .case(&decoded.case)
            .ok_or_else(|| BridgeError::not_found(format!("case {} of {}", decoded.case, ty.full_name())))?;
        let (Some(boxed), Some(payload)) = (
            case.payload.as_ref().and_then(|p| p.boxed.as_ref()),
            decoded.payload.as_ref(),
        ) else {
            return Err(BridgeError::InvalidValue(format!("case {} is not indirect", case.name)));
        };
        let boxed = self.resolve_mangled(&ty.full_name(), boxed)?;
        let object = payload.object_address()?;
        let address = object + boxed_value_offset(boxed.layout.alignment());
        Ok(Value::borrowed(self.memory.clone(), boxed, address))
    }

    pub fn witness_table(&self, ty: &TypeDescriptor, protocol: &ProtocolDescriptor) -> Result<usize> {
        let key = protocol.full_name();
        if let Some(conformance) = ty.conformance(&key) {
            return Ok(conformance.witness_table);
        }
        if let Some(conformance) = self
            .conformances_of(&ty.full_name())
            .into_iter()
            .find(|c| c.protocol == key)
        {
            return Ok(conformance.witness_table);
        }
        if let Some(superclass) = self.superclass_of(ty)? {
            return self.witness_table(&superclass, protocol);
        }
        Err(BridgeError::not_found(format!(
            "conformance of {} to {key}",
            ty.full_name()
        )))
    }

    pub fn register_metadata(&self, ty: &Arc<TypeDescriptor>, metadata: usize) {
        self.caches.metadata.insert(ty.full_name(), metadata);
        self.caches.by_metadata.insert(metadata, ty.clone());
    }

    pub fn metadata_of(&self, ty: &TypeDescriptor) -> Result<usize> {
        if let Some(metadata) = ty.metadata {
            return Ok(metadata);
        }
        let full_name = ty.full_name();
        if let Some(metadata) = self.caches.metadata.get(&full_name) {
            return Ok(*metadata);
        }
        let entry = self
            .entry(&ty.module, &ty.name)
            .ok_or_else(|| BridgeError::not_found(format!("metadata of {full_name}")))?;
        let memory = self.memory.as_ref();
        let descriptor = TypeContextDescriptor::read(memory, ContextDescriptor::read(memory, entry.descriptor)?)?;
        self.metadata_for_descriptor(&full_name, &descriptor)
            .ok_or_else(|| BridgeError::not_found(format!("metadata of {full_name}")))
    }

    pub fn type_for_metadata(&self, metadata: usize) -> Result<Arc<TypeDescriptor>> {
        if let Some(ty) = self.caches.by_metadata.get(&metadata) {
            return Ok(ty.clone());
        }
        let parsed = TypeMetadata::read(self.memory.as_ref(), metadata)?
            .ok_or_else(|| BridgeError::InvalidValue(format!("invalid metadata at {metadata:#x}")))?;
        let descriptor = parsed
            .description(self.memory.as_ref())?
            .ok_or_else(|| BridgeError::not_found(format!("type of metadata {metadata:#x}")))?;
        let ty = self.resolve_descriptor(descriptor)?;
        self.caches.metadata.entry(ty.full_name()).or_insert(metadata);
        Ok(self.caches.by_metadata.entry(metadata).or_insert(ty).clone())
    }

    /// The dynamic type of a heap object, from its isa pointer.
    pub fn type_for_object(&self, object: usize) -> Result<Arc<TypeDescriptor>> {
        let metadata = self.memory.read_pointer(object)?;
        self.type_for_metadata(metadata)
    }

    pub fn symbol_at(&self, address: usize) -> Option<String> {
        self.symbols.get(&address).map(|s| s.value().clone())
    }

    pub fn symbol_address(&self, name: &str) -> Option<usize> {
        self.symbol_addresses.get(name).map(|a| *a)
    }

    pub fn image_of(&self, address: usize) -> Option<ModuleImage> {
        self.images
            .iter()
            .find(|i| i.contains(address))
            .map(|i| i.value().clone())
    }
}
