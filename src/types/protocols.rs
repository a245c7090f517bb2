use crate::{
    memory::POINTER_SIZE,
    value::layout::{ExistentialLayoutManager, HasLayout},
};
use std::{
    fmt::{Debug, Formatter},
    sync::Arc,
};

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ProtocolDescriptor {
    pub name: String,
    pub module: String,
    pub descriptor: Option<usize>,
    pub num_requirements: usize,
    /// Conforming types must be classes.
    pub class_only: bool,
}

impl Debug for ProtocolDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "protocol {}", self.full_name())?;
        if self.class_only {
            write!(f, ": AnyObject")?;
        }
        Ok(())
    }
}

impl ProtocolDescriptor {
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.module, self.name)
    }
}

/// An ordered protocol composition such as `P & Q`. `Any` is the empty
/// composition and `AnyObject` the empty class-only one.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProtocolComposition {
    pub protocols: Vec<Arc<ProtocolDescriptor>>,
    pub class_only: bool,
}

impl ProtocolComposition {
    pub fn new(protocols: Vec<Arc<ProtocolDescriptor>>) -> Self {
        let class_only = protocols.iter().any(|p| p.class_only);
        Self {
            protocols,
            class_only,
        }
    }

    pub fn any() -> Self {
        Self::new(vec![])
    }

    pub fn any_object() -> Self {
        Self {
            protocols: vec![],
            class_only: true,
        }
    }

    pub fn name(&self) -> String {
        if self.protocols.is_empty() {
            return if self.class_only { "AnyObject" } else { "Any" }.to_string();
        }
        self.protocols
            .iter()
            .map(|p| p.full_name())
            .collect::<Vec<_>>()
            .join(" & ")
    }

    pub fn layout(&self) -> ExistentialLayoutManager {
        ExistentialLayoutManager {
            class_bound: self.class_only,
            witness_tables: self.protocols.len(),
        }
    }

    pub fn container_size(&self) -> usize {
        self.layout().size()
    }

    pub fn container_words(&self) -> usize {
        self.container_size() / POINTER_SIZE
    }

    /// Splits `"A & B"` into its protocol names.
    pub fn split(name: &str) -> Vec<&str> {
        name.split('&')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }
}
