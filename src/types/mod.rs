use crate::{
    metadata::{mangling::TypeName, values::ContextDescriptorKind},
    value::layout::{
        EnumLayoutManager, FieldLayoutManager, HasLayout, Layout, LayoutManager, Scalar,
    },
};
use std::{
    collections::BTreeMap,
    fmt::{Debug, Display, Formatter},
    hash::{Hash, Hasher},
    sync::Arc,
};

pub mod builtins;
pub mod members;
pub mod protocols;

use members::{CasePayload, EnumCase, Field, MethodEntry};
use protocols::ProtocolComposition;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TypeKind {
    Class,
    Struct,
    Enum,
    Protocol,
}

impl TypeKind {
    pub fn from_context(kind: ContextDescriptorKind) -> Option<Self> {
        match kind {
            ContextDescriptorKind::Class => Some(Self::Class),
            ContextDescriptorKind::Struct => Some(Self::Struct),
            ContextDescriptorKind::Enum => Some(Self::Enum),
            ContextDescriptorKind::Protocol => Some(Self::Protocol),
            _ => None,
        }
    }
}

impl Display for TypeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TypeKind::Class => "class",
            TypeKind::Struct => "struct",
            TypeKind::Enum => "enum",
            TypeKind::Protocol => "protocol",
        })
    }
}

/// A protocol conformance of a concrete type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Conformance {
    pub protocol: String,
    pub witness_table: usize,
}

/// One case of an enum under construction, in declaration order.
#[derive(Clone, Debug)]
pub enum CaseSpec {
    Empty(String),
    Payload(String, Arc<TypeDescriptor>),
    /// An `indirect` case; the payload lives in a heap box.
    Indirect(String, TypeName),
}

/// Everything known about a resolved Swift type.
///
/// Identity is the (kind, module, name, descriptor) tuple: two descriptors
/// resolved separately for the same type compare equal.
#[derive(Clone)]
pub struct TypeDescriptor {
    pub kind: TypeKind,
    pub name: String,
    pub module: String,
    /// Address of the nominal context descriptor; `None` for synthesized types.
    pub descriptor: Option<usize>,
    pub metadata: Option<usize>,
    /// Layout of a value of this type. For classes, that is the reference.
    pub layout: Arc<LayoutManager>,
    /// Stored properties of structs. Class instance fields are resolved on
    /// demand by the catalog.
    pub fields: Vec<Field>,
    pub cases: Vec<EnumCase>,
    pub methods: Vec<MethodEntry>,
    pub conformances: BTreeMap<String, Conformance>,
    pub existential: Option<ProtocolComposition>,
    pub num_witness_requirements: usize,
}

impl Debug for TypeDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.full_name())
    }
}

impl PartialEq for TypeDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.descriptor == other.descriptor
            && self.module == other.module
            && self.name == other.name
    }
}

impl Eq for TypeDescriptor {}

impl Hash for TypeDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.descriptor.hash(state);
        self.module.hash(state);
        self.name.hash(state);
    }
}

impl TypeDescriptor {
    pub fn new(
        kind: TypeKind,
        module: impl Into<String>,
        name: impl Into<String>,
        layout: impl Into<LayoutManager>,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            module: module.into(),
            descriptor: None,
            metadata: None,
            layout: Arc::new(layout.into()),
            fields: vec![],
            cases: vec![],
            methods: vec![],
            conformances: BTreeMap::new(),
            existential: None,
            num_witness_requirements: 0,
        }
    }

    /// A struct (or tuple) with its fields laid out in order.
    pub fn structure(
        module: impl Into<String>,
        name: impl Into<String>,
        fields: Vec<(String, Arc<TypeDescriptor>)>,
    ) -> Self {
        let layout = FieldLayoutManager::sequential(
            fields.iter().map(|(n, t)| (n.clone(), t.layout.clone())),
        );
        let fields = layout
            .fields
            .iter()
            .zip(fields)
            .map(|(l, (name, ty))| Field {
                name,
                offset: l.position,
                ty,
                is_var: true,
            })
            .collect();
        Self {
            fields,
            ..Self::new(TypeKind::Struct, module, name, layout)
        }
    }

    /// An enum with tags assigned payload cases first, then empty cases, each
    /// group in declaration order.
    pub fn enumeration(module: impl Into<String>, name: impl Into<String>, cases: Vec<CaseSpec>) -> Self {
        let reference = Arc::new(builtins::native_object());
        let mut payload_layouts = vec![];
        let mut payload_cases = vec![];
        let mut empty_cases = vec![];
        for (index, case) in cases.into_iter().enumerate() {
            match case {
                CaseSpec::Empty(name) => empty_cases.push((index, name)),
                CaseSpec::Payload(name, ty) => {
                    payload_layouts.push(ty.layout.clone());
                    payload_cases.push((
                        index,
                        name,
                        CasePayload {
                            ty,
                            indirect: false,
                            boxed: None,
                        },
                    ));
                }
                CaseSpec::Indirect(name, boxed) => {
                    payload_layouts.push(reference.layout.clone());
                    payload_cases.push((
                        index,
                        name,
                        CasePayload {
                            ty: reference.clone(),
                            indirect: true,
                            boxed: Some(boxed),
                        },
                    ));
                }
            }
        }
        let layout = EnumLayoutManager::new(payload_layouts, empty_cases.len());
        let num_payload = payload_cases.len() as u32;
        let mut ordered: Vec<(usize, EnumCase)> = payload_cases
            .into_iter()
            .enumerate()
            .map(|(tag, (index, name, payload))| {
                (
                    index,
                    EnumCase {
                        name,
                        tag: tag as u32,
                        payload: Some(payload),
                    },
                )
            })
            .chain(empty_cases.into_iter().enumerate().map(|(i, (index, name))| {
                (
                    index,
                    EnumCase {
                        name,
                        tag: num_payload + i as u32,
                        payload: None,
                    },
                )
            }))
            .collect();
        ordered.sort_by_key(|(index, _)| *index);
        Self {
            cases: ordered.into_iter().map(|(_, c)| c).collect(),
            ..Self::new(TypeKind::Enum, module, name, layout)
        }
    }

    /// A class type; its values are object references.
    pub fn class(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(TypeKind::Class, module, name, Scalar::Reference)
    }

    pub fn existential(composition: ProtocolComposition) -> Self {
        let module = match composition.protocols.as_slice() {
            [only] => only.module.clone(),
            _ => String::new(),
        };
        let name = match composition.protocols.as_slice() {
            [only] => only.name.clone(),
            _ => composition.name(),
        };
        Self {
            num_witness_requirements: composition
                .protocols
                .iter()
                .map(|p| p.num_requirements)
                .sum(),
            descriptor: match composition.protocols.as_slice() {
                [only] => only.descriptor,
                _ => None,
            },
            existential: Some(composition.clone()),
            ..Self::new(TypeKind::Protocol, module, name, composition.layout())
        }
    }

    pub fn with_descriptor(mut self, descriptor: usize) -> Self {
        self.descriptor = Some(descriptor);
        self
    }

    pub fn with_metadata(mut self, metadata: usize) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_conformance(mut self, protocol: impl Into<String>, witness_table: usize) -> Self {
        let protocol = protocol.into();
        self.conformances.insert(
            protocol.clone(),
            Conformance {
                protocol,
                witness_table,
            },
        );
        self
    }

    pub fn with_methods(mut self, methods: Vec<MethodEntry>) -> Self {
        self.methods = methods;
        self
    }

    pub fn full_name(&self) -> String {
        if self.module.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.module, self.name)
        }
    }

    pub fn layout(&self) -> Layout {
        self.layout.summary()
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }

    pub fn stride(&self) -> usize {
        self.layout.stride()
    }

    pub fn is_class(&self) -> bool {
        self.kind == TypeKind::Class
    }

    pub fn is_existential(&self) -> bool {
        self.existential.is_some()
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn case(&self, name: &str) -> Option<&EnumCase> {
        self.cases.iter().find(|c| c.name == name)
    }

    pub fn case_by_tag(&self, tag: u32) -> Option<&EnumCase> {
        self.cases.iter().find(|c| c.tag == tag)
    }

    pub fn enum_layout(&self) -> Option<&EnumLayoutManager> {
        match self.layout.as_ref() {
            LayoutManager::EnumLayoutManager(e) => Some(e),
            _ => None,
        }
    }

    pub fn conformance(&self, protocol: &str) -> Option<&Conformance> {
        self.conformances.get(protocol)
    }

    pub fn initializers(&self) -> impl Iterator<Item = &MethodEntry> {
        self.methods.iter().filter(|m| m.is_initializer())
    }
}
