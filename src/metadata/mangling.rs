//! Parser for the mangled type names stored in field records and superclass
//! references.
//!
//! Only the subset of the mangling grammar that appears in reflection metadata
//! for concrete types is understood. Everything else is reported as
//! [`ManglingError::Unsupported`] so the caller can fail the single type that
//! needed it.

use super::descriptors::ContextDescriptor;
use crate::{error::MemoryError, memory::Memory};
use std::fmt::{Display, Formatter};
use thiserror::Error;

const MAX_MANGLED_NAME: usize = 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManglingError {
    #[error("{0}")]
    Memory(#[from] MemoryError),
    #[error("unsupported mangling {mangling:?} at offset {at}")]
    Unsupported { mangling: String, at: usize },
    #[error("malformed mangling {0:?}")]
    Malformed(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NominalKind {
    Class,
    Struct,
    Enum,
    Protocol,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BuiltinType {
    Int(u16),
    Float(u16),
    NativeObject,
    BridgeObject,
    UnknownObject,
    RawPointer,
    Word,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Ownership {
    Weak,
    Unowned,
    Unmanaged,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeName {
    /// Symbolic reference to a context descriptor.
    Context(usize),
    Nominal {
        module: String,
        name: String,
        kind: NominalKind,
    },
    Builtin(BuiltinType),
    Tuple(Vec<TypeName>),
    BoundGeneric {
        base: Box<TypeName>,
        arguments: Vec<TypeName>,
    },
    Existential {
        protocols: Vec<TypeName>,
        class_bound: bool,
    },
    Reference {
        ownership: Ownership,
        referent: Box<TypeName>,
    },
}

impl TypeName {
    pub fn swift(name: &str, kind: NominalKind) -> Self {
        Self::Nominal {
            module: "Swift".to_string(),
            name: name.to_string(),
            kind,
        }
    }

    pub fn optional(wrapped: TypeName) -> Self {
        Self::BoundGeneric {
            base: Box::new(Self::swift("Optional", NominalKind::Enum)),
            arguments: vec![wrapped],
        }
    }
}

impl Display for TypeName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TypeName::Context(address) => write!(f, "<context {address:#x}>"),
            TypeName::Nominal { module, name, .. } => write!(f, "{module}.{name}"),
            TypeName::Builtin(b) => write!(f, "Builtin.{b:?}"),
            TypeName::Tuple(elements) => {
                write!(f, "(")?;
                for (i, e) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{e}")?;
                }
                write!(f, ")")
            }
            TypeName::BoundGeneric { base, arguments } => {
                write!(f, "{base}<")?;
                for (i, a) in arguments.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ">")
            }
            TypeName::Existential { protocols, class_bound } => {
                if protocols.is_empty() {
                    return write!(f, "{}", if *class_bound { "AnyObject" } else { "Any" });
                }
                for (i, p) in protocols.iter().enumerate() {
                    if i > 0 {
                        write!(f, " & ")?;
                    }
                    write!(f, "{p}")?;
                }
                Ok(())
            }
            TypeName::Reference { ownership, referent } => write!(f, "{ownership:?} {referent}"),
        }
    }
}

/// Reads the bytes of a mangled name, keeping embedded symbolic references
/// intact even when their offsets contain zero bytes.
pub fn read_mangled_name(memory: &dyn Memory, address: usize) -> Result<Vec<u8>, MemoryError> {
    let mut bytes = vec![];
    while bytes.len() < MAX_MANGLED_NAME {
        let b = memory.read_u8(address + bytes.len())?;
        match b {
            0 => return Ok(bytes),
            0x01..=0x17 => {
                bytes.push(b);
                bytes.extend(memory.read_bytes(address + bytes.len(), 4)?);
            }
            0x18..=0x1f => {
                bytes.push(b);
                bytes.extend(memory.read_bytes(address + bytes.len(), 8)?);
            }
            _ => bytes.push(b),
        }
    }
    Err(MemoryError::InvalidString(address))
}

pub fn parse_type_name(memory: &dyn Memory, address: usize) -> Result<TypeName, ManglingError> {
    let bytes = read_mangled_name(memory, address)?;
    TypeNameParser::new(memory, address, &bytes).parse()
}

#[derive(Clone, Debug)]
enum Node {
    Identifier(String),
    Module(String),
    Type(TypeName),
    FirstElement,
    EmptyList,
}

pub struct TypeNameParser<'a> {
    memory: &'a dyn Memory,
    base: usize,
    bytes: &'a [u8],
    pos: usize,
    stack: Vec<Node>,
    substitutions: Vec<Node>,
}

impl<'a> TypeNameParser<'a> {
    /// `base` is the address `bytes` were read from; symbolic reference offsets
    /// are relative to it.
    pub fn new(memory: &'a dyn Memory, base: usize, bytes: &'a [u8]) -> Self {
        Self {
            memory,
            base,
            bytes,
            pos: 0,
            stack: vec![],
            substitutions: vec![],
        }
    }

    pub fn parse(mut self) -> Result<TypeName, ManglingError> {
        while self.pos < self.bytes.len() {
            let b = self.next()?;
            match b {
                0x01 | 0x02 => self.symbolic_reference(b)?,
                b'0'..=b'9' => self.identifier(b)?,
                b's' => self.stack.push(Node::Module("Swift".to_string())),
                b'S' => self.standard_substitution()?,
                b'B' => self.builtin()?,
                b'V' => self.nominal(NominalKind::Struct)?,
                b'C' => self.nominal(NominalKind::Class)?,
                b'O' => self.nominal(NominalKind::Enum)?,
                b'P' => self.nominal(NominalKind::Protocol)?,
                b'_' => self.stack.push(Node::FirstElement),
                b'y' => self.stack.push(Node::EmptyList),
                b't' => self.tuple()?,
                b'G' => self.bound_generic()?,
                b'p' => self.existential(false)?,
                b'X' => match self.next()? {
                    b'l' => self.existential(true)?,
                    b'w' => self.reference(Ownership::Weak)?,
                    b'o' => self.reference(Ownership::Unowned)?,
                    b'u' => self.reference(Ownership::Unmanaged)?,
                    _ => return Err(self.unsupported()),
                },
                b'A' => self.substitution()?,
                b'D' if self.pos == self.bytes.len() => {}
                _ => return Err(self.unsupported()),
            }
        }
        match self.stack.as_slice() {
            [Node::Type(_)] => match self.stack.pop() {
                Some(Node::Type(t)) => Ok(t),
                _ => Err(self.malformed()),
            },
            _ => Err(self.malformed()),
        }
    }

    fn next(&mut self) -> Result<u8, ManglingError> {
        let b = *self.bytes.get(self.pos).ok_or_else(|| self.malformed())?;
        self.pos += 1;
        Ok(b)
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn display(&self) -> String {
        self.bytes
            .iter()
            .map(|&b| {
                if b.is_ascii_graphic() {
                    (b as char).to_string()
                } else {
                    format!("\\x{b:02x}")
                }
            })
            .collect()
    }

    fn unsupported(&self) -> ManglingError {
        ManglingError::Unsupported {
            mangling: self.display(),
            at: self.pos.saturating_sub(1),
        }
    }

    fn malformed(&self) -> ManglingError {
        ManglingError::Malformed(self.display())
    }

    fn number(&mut self, first: u8) -> Result<usize, ManglingError> {
        let mut n = (first - b'0') as usize;
        while let Some(d @ b'0'..=b'9') = self.peek() {
            self.pos += 1;
            n = n
                .checked_mul(10)
                .and_then(|n| n.checked_add((d - b'0') as usize))
                .ok_or_else(|| self.malformed())?;
        }
        Ok(n)
    }

    fn push_type(&mut self, t: TypeName) {
        self.stack.push(Node::Type(t));
    }

    fn push_substitutable(&mut self, node: Node) {
        self.substitutions.push(node.clone());
        self.stack.push(node);
    }

    fn pop_type(&mut self) -> Result<TypeName, ManglingError> {
        match self.stack.pop() {
            Some(Node::Type(t)) => Ok(t),
            _ => Err(self.malformed()),
        }
    }

    fn pop_if(&mut self, f: impl Fn(&Node) -> bool) -> Option<Node> {
        if self.stack.last().is_some_and(f) {
            self.stack.pop()
        } else {
            None
        }
    }

    fn symbolic_reference(&mut self, kind: u8) -> Result<(), ManglingError> {
        let at = self.pos;
        let raw: [u8; 4] = self
            .bytes
            .get(at..at + 4)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| self.malformed())?;
        self.pos += 4;
        let target = (self.base + at).wrapping_add_signed(i32::from_le_bytes(raw) as isize);
        let descriptor = if kind == 0x02 {
            self.memory.read_pointer(target)?
        } else {
            target
        };
        self.push_substitutable(Node::Type(TypeName::Context(descriptor)));
        Ok(())
    }

    fn identifier(&mut self, first: u8) -> Result<(), ManglingError> {
        if first == b'0' {
            // word substitutions
            return Err(self.unsupported());
        }
        let len = self.number(first)?;
        let text = self
            .bytes
            .get(self.pos..self.pos + len)
            .ok_or_else(|| self.malformed())?;
        let text = String::from_utf8(text.to_vec()).map_err(|_| self.malformed())?;
        self.pos += len;
        self.push_substitutable(Node::Identifier(text));
        Ok(())
    }

    fn nominal(&mut self, kind: NominalKind) -> Result<(), ManglingError> {
        let name = match self.stack.pop() {
            Some(Node::Identifier(name)) => name,
            _ => return Err(self.malformed()),
        };
        let (module, name) = match self.stack.pop() {
            Some(Node::Identifier(module) | Node::Module(module)) => (module, name),
            Some(Node::Type(TypeName::Nominal {
                module,
                name: parent,
                ..
            })) => (module, format!("{parent}.{name}")),
            Some(Node::Type(TypeName::Context(address))) => {
                let (module, parent) =
                    ContextDescriptor::read(self.memory, address)?.qualified_name(self.memory)?;
                (module, format!("{parent}.{name}"))
            }
            _ => return Err(self.malformed()),
        };
        self.push_substitutable(Node::Type(TypeName::Nominal { module, name, kind }));
        Ok(())
    }

    fn standard_substitution(&mut self) -> Result<(), ManglingError> {
        use NominalKind::*;
        let (name, kind) = match self.next()? {
            b'g' => {
                let wrapped = self.pop_type()?;
                self.push_substitutable(Node::Type(TypeName::optional(wrapped)));
                return Ok(());
            }
            b'a' => ("Array", Struct),
            b'b' => ("Bool", Struct),
            b'D' => ("Dictionary", Struct),
            b'd' => ("Double", Struct),
            b'f' => ("Float", Struct),
            b'h' => ("Set", Struct),
            b'i' => ("Int", Struct),
            b'J' => ("Character", Struct),
            b'N' => ("ClosedRange", Struct),
            b'n' => ("Range", Struct),
            b'O' => ("ObjectIdentifier", Struct),
            b'P' => ("UnsafePointer", Struct),
            b'p' => ("UnsafeMutablePointer", Struct),
            b'q' => ("Optional", Enum),
            b'R' => ("UnsafeBufferPointer", Struct),
            b'r' => ("UnsafeMutableBufferPointer", Struct),
            b'S' => ("String", Struct),
            b's' => ("Substring", Struct),
            b'u' => ("UInt", Struct),
            b'V' => ("UnsafeRawPointer", Struct),
            b'v' => ("UnsafeMutableRawPointer", Struct),
            b'W' => ("UnsafeRawBufferPointer", Struct),
            b'w' => ("UnsafeMutableRawBufferPointer", Struct),
            b'Q' => ("Equatable", Protocol),
            b'H' => ("Hashable", Protocol),
            b'L' => ("Comparable", Protocol),
            b'E' => ("Encodable", Protocol),
            b'e' => ("Decodable", Protocol),
            _ => return Err(self.unsupported()),
        };
        self.push_type(TypeName::swift(name, kind));
        Ok(())
    }

    fn builtin(&mut self) -> Result<(), ManglingError> {
        let builtin = match self.next()? {
            b'b' => BuiltinType::BridgeObject,
            b'o' => BuiltinType::NativeObject,
            b'O' => BuiltinType::UnknownObject,
            b'p' => BuiltinType::RawPointer,
            b'w' => BuiltinType::Word,
            c @ (b'i' | b'f') => {
                let first = self.next()?;
                if !first.is_ascii_digit() {
                    return Err(self.malformed());
                }
                let bits = self.number(first)?;
                if self.next()? != b'_' {
                    return Err(self.malformed());
                }
                let bits = u16::try_from(bits).map_err(|_| self.malformed())?;
                if c == b'i' {
                    BuiltinType::Int(bits)
                } else {
                    BuiltinType::Float(bits)
                }
            }
            _ => return Err(self.unsupported()),
        };
        self.push_type(TypeName::Builtin(builtin));
        Ok(())
    }

    fn tuple(&mut self) -> Result<(), ManglingError> {
        let mut elements = vec![];
        if self.pop_if(|n| matches!(n, Node::EmptyList)).is_none() {
            loop {
                let first = self.pop_if(|n| matches!(n, Node::FirstElement)).is_some();
                // element labels are not part of the layout
                self.pop_if(|n| matches!(n, Node::Identifier(_)));
                elements.push(self.pop_type()?);
                if first {
                    break;
                }
            }
        }
        elements.reverse();
        self.push_type(TypeName::Tuple(elements));
        Ok(())
    }

    fn bound_generic(&mut self) -> Result<(), ManglingError> {
        let mut levels = vec![];
        loop {
            let mut level = vec![];
            while let Some(Node::Type(t)) = self.pop_if(|n| matches!(n, Node::Type(_))) {
                level.push(t);
            }
            level.reverse();
            levels.push(level);
            if self.pop_if(|n| matches!(n, Node::EmptyList)).is_some() {
                break;
            }
            if self.pop_if(|n| matches!(n, Node::FirstElement)).is_none() {
                return Err(self.malformed());
            }
        }
        levels.reverse();
        let base = self.pop_type()?;
        self.push_substitutable(Node::Type(TypeName::BoundGeneric {
            base: Box::new(base),
            arguments: levels.into_iter().flatten().collect(),
        }));
        Ok(())
    }

    fn existential(&mut self, class_bound: bool) -> Result<(), ManglingError> {
        let mut protocols = vec![];
        if self.pop_if(|n| matches!(n, Node::EmptyList)).is_none() {
            loop {
                let first = self.pop_if(|n| matches!(n, Node::FirstElement)).is_some();
                protocols.push(self.pop_type()?);
                if first {
                    break;
                }
            }
        }
        protocols.reverse();
        self.push_type(TypeName::Existential {
            protocols,
            class_bound,
        });
        Ok(())
    }

    fn reference(&mut self, ownership: Ownership) -> Result<(), ManglingError> {
        let referent = self.pop_type()?;
        self.push_type(TypeName::Reference {
            ownership,
            referent: Box::new(referent),
        });
        Ok(())
    }

    fn substitution(&mut self) -> Result<(), ManglingError> {
        match self.peek() {
            Some(b'_') => {
                self.pos += 1;
                self.push_substitution(0)
            }
            Some(d @ b'0'..=b'9') => {
                self.pos += 1;
                let n = self.number(d)?;
                if self.next()? != b'_' {
                    return Err(self.malformed());
                }
                self.push_substitution(n + 1)
            }
            _ => loop {
                match self.next()? {
                    c @ b'a'..=b'z' => self.push_substitution((c - b'a') as usize)?,
                    c @ b'A'..=b'Z' => return self.push_substitution((c - b'A') as usize),
                    _ => return Err(self.malformed()),
                }
            },
        }
    }

    fn push_substitution(&mut self, index: usize) -> Result<(), ManglingError> {
        let node = self
            .substitutions
            .get(index)
            .cloned()
            .ok_or_else(|| self.malformed())?;
        self.stack.push(node);
        Ok(())
    }
}
