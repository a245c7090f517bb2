//! Readers for context descriptors found in the `swift5` metadata sections.
//!
//! Offsets follow the stable Swift 5 ABI for 64-bit targets.

use super::{
    relative::{RelativeDirectPointer, RelativeIndirectablePointer},
    values::*,
};
use crate::{error::MemoryError, memory::Memory};

const PARENT_OFFSET: usize = 0x4;
const NAME_OFFSET: usize = 0x8;
const ACCESS_FUNCTION_OFFSET: usize = 0xc;
const FIELDS_OFFSET: usize = 0x10;

const MAX_PARENT_DEPTH: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextDescriptor {
    pub address: usize,
    pub flags: ContextDescriptorFlags,
}

impl ContextDescriptor {
    pub fn read(memory: &dyn Memory, address: usize) -> Result<Self, MemoryError> {
        Ok(Self {
            address,
            flags: ContextDescriptorFlags(memory.read_u32(address)?),
        })
    }

    pub fn kind(&self) -> Option<ContextDescriptorKind> {
        self.flags.kind()
    }

    pub fn parent(&self, memory: &dyn Memory) -> Result<Option<ContextDescriptor>, MemoryError> {
        match RelativeIndirectablePointer::resolve(memory, self.address + PARENT_OFFSET)? {
            Some(parent) => Ok(Some(Self::read(memory, parent)?)),
            None => Ok(None),
        }
    }

    /// Name of module, type and protocol descriptors. Extensions and anonymous
    /// contexts have none.
    pub fn name(&self, memory: &dyn Memory) -> Result<Option<String>, MemoryError> {
        match self.kind() {
            Some(
                ContextDescriptorKind::Module
                | ContextDescriptorKind::Protocol
                | ContextDescriptorKind::Class
                | ContextDescriptorKind::Struct
                | ContextDescriptorKind::Enum,
            ) => {}
            _ => return Ok(None),
        }
        match RelativeDirectPointer::resolve(memory, self.address + NAME_OFFSET)? {
            Some(name) => Ok(Some(memory.read_c_string(name)?)),
            None => Ok(None),
        }
    }

    /// Walks the parent chain and returns the module name together with the
    /// dotted name of this context inside it (`Outer.Inner`).
    pub fn qualified_name(&self, memory: &dyn Memory) -> Result<(String, String), MemoryError> {
        let mut names = vec![self.name(memory)?.unwrap_or_default()];
        let mut current = self.parent(memory)?;
        for _ in 0..MAX_PARENT_DEPTH {
            let Some(context) = current else { break };
            match context.kind() {
                Some(ContextDescriptorKind::Module) => {
                    names.reverse();
                    return Ok((context.name(memory)?.unwrap_or_default(), names.join(".")));
                }
                Some(kind) if kind.is_type() || kind == ContextDescriptorKind::Protocol => {
                    names.push(context.name(memory)?.unwrap_or_default());
                }
                _ => {}
            }
            current = context.parent(memory)?;
        }
        names.reverse();
        Ok((String::new(), names.join(".")))
    }
}

/// Common prefix of class, struct and enum descriptors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TypeContextDescriptor {
    pub context: ContextDescriptor,
    pub access_function: Option<usize>,
    pub fields: Option<usize>,
}

impl TypeContextDescriptor {
    pub fn read(memory: &dyn Memory, context: ContextDescriptor) -> Result<Self, MemoryError> {
        let address = context.address;
        Ok(Self {
            context,
            access_function: RelativeDirectPointer::resolve(
                memory,
                address + ACCESS_FUNCTION_OFFSET,
            )?,
            fields: RelativeDirectPointer::resolve(memory, address + FIELDS_OFFSET)?,
        })
    }

    pub fn flags(&self) -> TypeContextDescriptorFlags {
        TypeContextDescriptorFlags(self.context.flags.kind_specific_flags())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StructDescriptor {
    pub num_fields: u32,
    pub field_offset_vector_offset: u32,
}

impl StructDescriptor {
    pub fn read(memory: &dyn Memory, address: usize) -> Result<Self, MemoryError> {
        Ok(Self {
            num_fields: memory.read_u32(address + 0x14)?,
            field_offset_vector_offset: memory.read_u32(address + 0x18)?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnumDescriptor {
    pub num_payload_cases: u32,
    pub payload_size_offset: u32,
    pub num_empty_cases: u32,
}

impl EnumDescriptor {
    pub fn read(memory: &dyn Memory, address: usize) -> Result<Self, MemoryError> {
        let packed = memory.read_u32(address + 0x14)?;
        Ok(Self {
            num_payload_cases: packed & 0x00ff_ffff,
            payload_size_offset: (packed >> 24) & 0xff,
            num_empty_cases: memory.read_u32(address + 0x18)?,
        })
    }

    pub fn num_cases(&self) -> u32 {
        self.num_payload_cases + self.num_empty_cases
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub flags: MethodDescriptorFlags,
    pub implementation: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassDescriptor {
    pub superclass_type: Option<usize>,
    pub num_immediate_members: u32,
    pub num_fields: u32,
    pub field_offset_vector_offset: u32,
    pub methods: Vec<MethodDescriptor>,
}

impl ClassDescriptor {
    const VTABLE_HEADER_OFFSET: usize = 0x2c;
    const METHODS_OFFSET: usize = 0x34;
    const METHOD_DESCRIPTOR_SIZE: usize = 8;

    pub fn read(memory: &dyn Memory, ty: &TypeContextDescriptor) -> Result<Self, MemoryError> {
        let address = ty.context.address;
        let flags = ty.flags();
        let mut methods = vec![];
        // the vtable header only sits at a fixed offset when no generic or
        // metadata initialization trailing objects precede it
        if flags.class_has_vtable()
            && !flags.class_has_resilient_superclass()
            && flags.metadata_initialization() == 0
            && !ty.context.flags.is_generic()
        {
            let size = memory.read_u32(address + Self::VTABLE_HEADER_OFFSET + 4)? as usize;
            for i in 0..size {
                let at = address + Self::METHODS_OFFSET + i * Self::METHOD_DESCRIPTOR_SIZE;
                methods.push(MethodDescriptor {
                    flags: MethodDescriptorFlags(memory.read_u32(at)?),
                    implementation: RelativeDirectPointer::resolve(memory, at + 4)?,
                });
            }
        }
        Ok(Self {
            superclass_type: RelativeDirectPointer::resolve(memory, address + 0x14)?,
            num_immediate_members: memory.read_u32(address + 0x20)?,
            num_fields: memory.read_u32(address + 0x24)?,
            field_offset_vector_offset: memory.read_u32(address + 0x28)?,
            methods,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtocolRecord {
    pub context: ContextDescriptor,
    pub num_requirements: u32,
    pub class_constrained: bool,
}

impl ProtocolRecord {
    pub fn read(memory: &dyn Memory, context: ContextDescriptor) -> Result<Self, MemoryError> {
        let flags = ProtocolContextDescriptorFlags(context.flags.kind_specific_flags());
        Ok(Self {
            num_requirements: memory.read_u32(context.address + 0x10)?,
            class_constrained: flags.is_class_constrained(),
            context,
        })
    }
}

/// A protocol conformance record from `__swift5_proto`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConformanceRecord {
    pub protocol: Option<usize>,
    pub type_descriptor: Option<usize>,
    pub witness_table: Option<usize>,
    pub flags: ConformanceFlags,
}

impl ConformanceRecord {
    pub fn read(memory: &dyn Memory, address: usize) -> Result<Self, MemoryError> {
        let flags = ConformanceFlags(memory.read_u32(address + 0xc)?);
        let type_descriptor = match flags.type_reference_kind() {
            Some(TypeReferenceKind::DirectTypeDescriptor) => {
                RelativeDirectPointer::resolve(memory, address + 0x4)?
            }
            Some(TypeReferenceKind::IndirectTypeDescriptor) => {
                match RelativeDirectPointer::resolve(memory, address + 0x4)? {
                    Some(slot) => Some(memory.read_pointer(slot)?).filter(|&p| p != 0),
                    None => None,
                }
            }
            // ObjC classes have no Swift type descriptor to bind to
            _ => None,
        };
        Ok(Self {
            protocol: RelativeIndirectablePointer::resolve(memory, address)?,
            type_descriptor,
            witness_table: RelativeDirectPointer::resolve(memory, address + 0x8)?,
            flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::LocalMemory;

    fn put_u32(buf: &mut [u8], at: usize, value: u32) {
        buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn put_rel(buf: &mut [u8], at: usize, target: usize) {
        put_u32(buf, at, (target as i32 - at as i32) as u32);
    }

    #[test]
    fn test_qualified_name() {
        let mut image = vec![0u8; 256].into_boxed_slice();
        // module at 0x00, outer struct at 0x20, inner enum at 0x40, strings from 0x80
        put_u32(&mut image, 0x00, 0);
        put_rel(&mut image, 0x08, 0x80);
        put_u32(&mut image, 0x20, 17);
        put_rel(&mut image, 0x24, 0x00);
        put_rel(&mut image, 0x28, 0x88);
        put_u32(&mut image, 0x40, 18);
        put_rel(&mut image, 0x44, 0x20);
        put_rel(&mut image, 0x48, 0x90);
        image[0x80..0x85].copy_from_slice(b"main\0");
        image[0x88..0x8e].copy_from_slice(b"Outer\0");
        image[0x90..0x96].copy_from_slice(b"Inner\0");

        let base = image.as_mut_ptr() as usize;
        let inner = ContextDescriptor::read(&LocalMemory, base + 0x40).unwrap();
        assert_eq!(inner.kind(), Some(ContextDescriptorKind::Enum));
        assert_eq!(
            inner.qualified_name(&LocalMemory).unwrap(),
            ("main".to_string(), "Outer.Inner".to_string())
        );
    }

    #[test]
    fn test_enum_descriptor_counts() {
        let mut image = vec![0u8; 32].into_boxed_slice();
        put_u32(&mut image, 0x14, 0x0500_0003);
        put_u32(&mut image, 0x18, 2);
        let base = image.as_mut_ptr() as usize;
        let descriptor = EnumDescriptor::read(&LocalMemory, base).unwrap();
        assert_eq!(descriptor.num_payload_cases, 3);
        assert_eq!(descriptor.payload_size_offset, 5);
        assert_eq!(descriptor.num_cases(), 5);
    }
}
