use super::TypeDescriptor;
use crate::metadata::{mangling::TypeName, values::MethodDescriptorKind};
use std::{
    fmt::{Debug, Formatter},
    hash::{Hash, Hasher},
    sync::Arc,
};

#[derive(Clone)]
pub struct Field {
    pub name: String,
    pub offset: usize,
    pub ty: Arc<TypeDescriptor>,
    pub is_var: bool,
}

impl Debug for Field {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}: {} @ {:#x}",
            if self.is_var { "var" } else { "let" },
            self.name,
            self.ty.full_name(),
            self.offset
        )
    }
}

impl PartialEq for Field {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.offset == other.offset && self.ty == other.ty
    }
}

impl Eq for Field {}

impl Hash for Field {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.offset.hash(state);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CasePayload {
    pub ty: Arc<TypeDescriptor>,
    /// Stored behind a heap box; `ty` is then the box reference.
    pub indirect: bool,
    /// The boxed payload type of an indirect case, resolved on demand.
    pub boxed: Option<TypeName>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct EnumCase {
    pub name: String,
    pub tag: u32,
    pub payload: Option<CasePayload>,
}

impl Debug for EnumCase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "case {} = {}", self.name, self.tag)?;
        match &self.payload {
            Some(CasePayload {
                boxed: Some(boxed), ..
            }) => write!(f, " (indirect {boxed})"),
            Some(payload) => write!(f, " ({})", payload.ty.full_name()),
            None => Ok(()),
        }
    }
}

impl EnumCase {
    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }
}

/// A vtable entry of a class.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct MethodEntry {
    pub kind: MethodDescriptorKind,
    pub address: usize,
    pub symbol: Option<String>,
    pub is_instance: bool,
}

impl Debug for MethodEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} {:#x}", self.kind, self.address)?;
        if let Some(symbol) = &self.symbol {
            write!(f, " {symbol}")?;
        }
        Ok(())
    }
}

impl MethodEntry {
    pub fn is_initializer(&self) -> bool {
        self.kind == MethodDescriptorKind::Init
    }
}
