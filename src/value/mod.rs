use crate::{
    error::{BridgeError, Result},
    memory::{Memory, POINTER_SIZE},
    types::{TypeDescriptor, TypeKind},
    utils::read_uint,
};
use layout::{LayoutManager, Scalar};
use std::{
    fmt::{Debug, Formatter},
    sync::Arc,
};
use storage::OwnedStorage;

pub mod enums;
pub mod existential;
pub mod layout;
pub mod storage;

/// Where the bytes of a value live.
#[derive(Clone, Debug)]
pub enum Handle {
    /// Memory owned by someone else, usually Swift.
    Borrowed(usize),
    Owned(Arc<OwnedStorage>),
    /// A projection into an owned buffer; keeps the buffer alive.
    Interior {
        owner: Arc<OwnedStorage>,
        offset: usize,
    },
}

/// A typed view of Swift value storage.
#[derive(Clone)]
pub struct Value {
    ty: Arc<TypeDescriptor>,
    handle: Handle,
    memory: Arc<dyn Memory>,
}

impl Debug for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let kind = match self.handle {
            Handle::Borrowed(_) => "borrowed",
            Handle::Owned(_) => "owned",
            Handle::Interior { .. } => "interior",
        };
        write!(f, "Value({} {kind} @ {:#x})", self.ty.full_name(), self.address())
    }
}

impl Value {
    /// Wraps Swift memory after checking the caller vouches for a whole
    /// stride of it.
    pub fn from_raw(
        memory: Arc<dyn Memory>,
        ty: Arc<TypeDescriptor>,
        address: usize,
        len: usize,
    ) -> Result<Self> {
        if address == 0 {
            return Err(BridgeError::InvalidValue(format!(
                "null pointer for {}",
                ty.full_name()
            )));
        }
        let required = ty.stride();
        if len < required {
            return Err(BridgeError::InvalidBuffer {
                required,
                actual: len,
            });
        }
        Ok(Self::borrowed(memory, ty, address))
    }

    /// Wraps a pointer received from Swift without any checks.
    pub fn borrowed(memory: Arc<dyn Memory>, ty: Arc<TypeDescriptor>, address: usize) -> Self {
        Self {
            ty,
            handle: Handle::Borrowed(address),
            memory,
        }
    }

    /// Copies `bytes` into a fresh owned buffer of the type's stride.
    pub fn from_bytes(memory: Arc<dyn Memory>, ty: Arc<TypeDescriptor>, bytes: &[u8]) -> Result<Self> {
        let size = ty.size();
        if bytes.len() < size {
            return Err(BridgeError::InvalidBuffer {
                required: size,
                actual: bytes.len(),
            });
        }
        let storage = OwnedStorage::zeroed(ty.stride());
        storage.write_from(0, &bytes[..size])?;
        Ok(Self::owned(memory, ty, Arc::new(storage)))
    }

    /// A zero-filled owned value.
    pub fn empty(memory: Arc<dyn Memory>, ty: Arc<TypeDescriptor>) -> Self {
        let storage = OwnedStorage::zeroed(ty.stride());
        Self::owned(memory, ty, Arc::new(storage))
    }

    pub fn owned(memory: Arc<dyn Memory>, ty: Arc<TypeDescriptor>, storage: Arc<OwnedStorage>) -> Self {
        Self {
            ty,
            handle: Handle::Owned(storage),
            memory,
        }
    }

    pub fn ty(&self) -> &Arc<TypeDescriptor> {
        &self.ty
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn memory(&self) -> &Arc<dyn Memory> {
        &self.memory
    }

    pub fn is_owned(&self) -> bool {
        !matches!(self.handle, Handle::Borrowed(_))
    }

    pub fn address(&self) -> usize {
        match &self.handle {
            Handle::Borrowed(address) => *address,
            Handle::Owned(storage) => storage.address(),
            Handle::Interior { owner, offset } => owner.address() + offset,
        }
    }

    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        match &self.handle {
            Handle::Borrowed(address) => self.memory.read(address + offset, buf)?,
            Handle::Owned(storage) => storage.read_into(offset, buf)?,
            Handle::Interior { owner, offset: base } => owner.read_into(base + offset, buf)?,
        }
        Ok(())
    }

    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        match &self.handle {
            Handle::Borrowed(address) => self.memory.write(address + offset, bytes)?,
            Handle::Owned(storage) => storage.write_from(offset, bytes)?,
            Handle::Interior { owner, offset: base } => owner.write_from(base + offset, bytes)?,
        }
        Ok(())
    }

    /// The `size` bytes of the value.
    pub fn bytes(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0; self.ty.size()];
        self.read(0, &mut buf)?;
        Ok(buf)
    }

    pub fn read_word(&self, offset: usize) -> Result<u64> {
        let mut buf = [0; POINTER_SIZE];
        self.read(offset, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn to_owned_copy(&self) -> Result<Self> {
        Self::from_bytes(self.memory.clone(), self.ty.clone(), &self.bytes()?)
    }

    /// A view of `ty` at `offset` inside this value, sharing its storage.
    pub fn project(&self, ty: Arc<TypeDescriptor>, offset: usize) -> Self {
        let handle = match &self.handle {
            Handle::Borrowed(address) => Handle::Borrowed(address + offset),
            Handle::Owned(owner) => Handle::Interior {
                owner: owner.clone(),
                offset,
            },
            Handle::Interior { owner, offset: base } => Handle::Interior {
                owner: owner.clone(),
                offset: base + offset,
            },
        };
        Self {
            ty,
            handle,
            memory: self.memory.clone(),
        }
    }

    pub fn field(&self, name: &str) -> Result<Self> {
        let field = self.ty.field(name).ok_or_else(|| {
            BridgeError::not_found(format!("field {name} of {}", self.ty.full_name()))
        })?;
        Ok(self.project(field.ty.clone(), field.offset))
    }

    pub fn set_field(&self, name: &str, value: &Value) -> Result<()> {
        let target = self.field(name)?;
        if target.ty != value.ty {
            return Err(BridgeError::InvalidValue(format!(
                "field {name} has type {}, got {}",
                target.ty.full_name(),
                value.ty.full_name()
            )));
        }
        target.write(0, &value.bytes()?)
    }

    /// The object pointer held by a class value.
    pub fn object_address(&self) -> Result<usize> {
        if !self.ty.is_class() && !self.ty.layout.is_reference() {
            return Err(BridgeError::InvalidValue(format!(
                "{} is not a reference type",
                self.ty.full_name()
            )));
        }
        Ok(self.read_word(0)? as usize)
    }

    fn equals(&self, other: &Value) -> Result<bool> {
        if self.ty != other.ty {
            return Ok(false);
        }
        if self.ty.kind == TypeKind::Class || self.ty.is_existential() {
            return Ok(self.bytes()? == other.bytes()?);
        }
        // enums laid out by the runtime alone compare by bytes
        if self.ty.kind == TypeKind::Enum && self.ty.enum_layout().is_some() {
            let (a, b) = (enums::decode(self)?, enums::decode(other)?);
            return Ok(a.tag == b.tag
                && match (a.payload, b.payload) {
                    (Some(a), Some(b)) => a.equals(&b)?,
                    (None, None) => true,
                    _ => false,
                });
        }
        if !self.ty.fields.is_empty() {
            for field in &self.ty.fields {
                if !self.field(&field.name)?.equals(&other.field(&field.name)?)? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }
        let (a, b) = (self.bytes()?, other.bytes()?);
        Ok(match self.ty.layout.as_ref() {
            LayoutManager::Scalar(Scalar::Float32) => {
                f32::from_bits(read_uint(&a, 0, 4) as u32) == f32::from_bits(read_uint(&b, 0, 4) as u32)
            }
            LayoutManager::Scalar(Scalar::Float64) => {
                f64::from_bits(read_uint(&a, 0, 8)) == f64::from_bits(read_uint(&b, 0, 8))
            }
            _ => a == b,
        })
    }
}

/// Structural equality: unreadable values compare unequal.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::LocalMemory,
        types::builtins::{optional, standard},
    };
    use pretty_assertions::assert_eq;

    fn memory() -> Arc<dyn Memory> {
        Arc::new(LocalMemory)
    }

    fn int() -> Arc<TypeDescriptor> {
        Arc::new(standard("Int").unwrap())
    }

    fn point() -> Arc<TypeDescriptor> {
        let double = Arc::new(standard("Double").unwrap());
        Arc::new(TypeDescriptor::structure(
            "main",
            "Point",
            vec![("x".into(), double.clone()), ("y".into(), double)],
        ))
    }

    #[test]
    fn test_from_raw_checks_stride() {
        let words = [1u64, 2];
        let address = words.as_ptr() as usize;
        let err = Value::from_raw(memory(), point(), address, 8).unwrap_err();
        assert_eq!(err, BridgeError::InvalidBuffer { required: 16, actual: 8 });
        let value = Value::from_raw(memory(), int(), address, 8).unwrap();
        assert_eq!(value.read_word(0).unwrap(), 1);
        assert!(!value.is_owned());
    }

    #[test]
    fn test_field_projection_shares_storage() {
        let value = Value::empty(memory(), point());
        let y = value.field("y").unwrap();
        y.write(0, &2.5f64.to_le_bytes()).unwrap();
        assert_eq!(&value.bytes().unwrap()[8..], &2.5f64.to_le_bytes());
        assert!(matches!(y.handle(), Handle::Interior { offset: 8, .. }));
        assert!(value.field("z").unwrap_err().is_not_found());
    }

    #[test]
    fn test_set_field_type_checked() {
        let value = Value::empty(memory(), point());
        let x = Value::from_bytes(memory(), value.field("x").unwrap().ty().clone(), &1.0f64.to_le_bytes()).unwrap();
        value.set_field("x", &x).unwrap();
        assert_eq!(value.field("x").unwrap(), x);
        let wrong = Value::from_bytes(memory(), int(), &[0; 8]).unwrap();
        assert!(matches!(value.set_field("x", &wrong), Err(BridgeError::InvalidValue(_))));
    }

    #[test]
    fn test_structural_equality() {
        let a = Value::from_bytes(memory(), point(), &[0; 16]).unwrap();
        let mut negative_zero = vec![0; 8];
        negative_zero.extend_from_slice(&(-0.0f64).to_le_bytes());
        let b = Value::from_bytes(memory(), point(), &negative_zero).unwrap();
        assert_eq!(a, b);

        let nan = f64::NAN.to_le_bytes().repeat(2);
        let c = Value::from_bytes(memory(), point(), &nan).unwrap();
        assert_ne!(c, c.to_owned_copy().unwrap());
    }

    #[test]
    fn test_enum_equality_ignores_dead_payload_bytes() {
        let ty = Arc::new(optional(int()));
        // only the low four bytes of the payload area carry the case index
        let none_a = [0, 0, 0, 0, 0xaa, 0xaa, 0xaa, 0xaa, 1];
        let none_b = [0, 0, 0, 0, 0x55, 0x55, 0x55, 0x55, 1];
        let a = Value::from_bytes(memory(), ty.clone(), &none_a).unwrap();
        let b = Value::from_bytes(memory(), ty.clone(), &none_b).unwrap();
        assert_eq!(a, b);
        let some = Value::from_bytes(memory(), ty, &[0; 9]).unwrap();
        assert_ne!(a, some);
    }

    #[test]
    fn test_runtime_laid_out_enum_equality() {
        let layout = layout::OpaqueLayoutManager {
            size: 8,
            alignment: 8,
            extra_inhabitants: 0,
            pod: true,
            bitwise_takable: true,
        };
        let ty = Arc::new(TypeDescriptor::new(TypeKind::Enum, "main", "Resilient", layout));
        let a = Value::from_bytes(memory(), ty.clone(), &7u64.to_le_bytes()).unwrap();
        assert_eq!(a, a.to_owned_copy().unwrap());
        let b = Value::from_bytes(memory(), ty, &8u64.to_le_bytes()).unwrap();
        assert_ne!(a, b);
    }
}
