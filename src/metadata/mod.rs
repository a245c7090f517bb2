pub mod descriptors;
pub mod mangling;
pub mod records;
pub mod relative;
pub mod values;

use crate::{error::MemoryError, memory::{Memory, POINTER_SIZE}};
use values::{MetadataKind, ValueWitnessFlags};

/// Word offset of the nominal type descriptor inside class metadata.
#[cfg(target_vendor = "apple")]
pub const CLASS_DESCRIPTION_WORD: usize = 8;
#[cfg(not(target_vendor = "apple"))]
pub const CLASS_DESCRIPTION_WORD: usize = 5;

/// Full type metadata: the value witness table pointer sits one word before the
/// metadata address point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TypeMetadata {
    pub address: usize,
    pub kind: MetadataKind,
}

impl TypeMetadata {
    pub fn read(memory: &dyn Memory, address: usize) -> Result<Option<Self>, MemoryError> {
        let raw = memory.read_u64(address)?;
        Ok(MetadataKind::from_raw(raw).map(|kind| Self { address, kind }))
    }

    pub fn is_class(&self) -> bool {
        self.kind == MetadataKind::Class
    }

    /// Address of the nominal type descriptor, if this is a nominal type.
    pub fn description(&self, memory: &dyn Memory) -> Result<Option<usize>, MemoryError> {
        let word = match self.kind {
            MetadataKind::Class => CLASS_DESCRIPTION_WORD,
            MetadataKind::Struct | MetadataKind::Enum | MetadataKind::Optional => 1,
            _ => return Ok(None),
        };
        match memory.read_pointer(self.address + word * POINTER_SIZE)? {
            0 => Ok(None),
            address => Ok(Some(address)),
        }
    }

    pub fn value_witnesses(&self, memory: &dyn Memory) -> Result<ValueWitnessTable, MemoryError> {
        let table = memory.read_pointer(self.address - POINTER_SIZE)?;
        ValueWitnessTable::read(memory, table)
    }

    /// Reads `count` entries of a field offset vector starting `vector_offset`
    /// words into the metadata. Structs store 32-bit offsets, classes words.
    pub fn field_offsets(
        &self,
        memory: &dyn Memory,
        vector_offset: usize,
        count: usize,
    ) -> Result<Vec<usize>, MemoryError> {
        let base = self.address + vector_offset * POINTER_SIZE;
        (0..count)
            .map(|i| {
                if self.is_class() {
                    memory.read_pointer(base + i * POINTER_SIZE)
                } else {
                    memory.read_u32(base + i * 4).map(|o| o as usize)
                }
            })
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValueWitnessTable {
    pub address: usize,
    pub initialize_with_copy: usize,
    pub size: usize,
    pub stride: usize,
    pub flags: ValueWitnessFlags,
    pub extra_inhabitant_count: u32,
}

impl ValueWitnessTable {
    pub const INITIALIZE_WITH_COPY: usize = 0x10;
    pub const SIZE: usize = 0x40;
    pub const STRIDE: usize = 0x48;
    pub const FLAGS: usize = 0x50;
    pub const EXTRA_INHABITANT_COUNT: usize = 0x54;
    pub const GET_ENUM_TAG: usize = 0x58;
    pub const DESTRUCTIVE_INJECT_ENUM_TAG: usize = 0x68;

    pub fn read(memory: &dyn Memory, address: usize) -> Result<Self, MemoryError> {
        Ok(Self {
            address,
            initialize_with_copy: memory.read_pointer(address + Self::INITIALIZE_WITH_COPY)?,
            size: memory.read_pointer(address + Self::SIZE)?,
            stride: memory.read_pointer(address + Self::STRIDE)?,
            flags: ValueWitnessFlags(memory.read_u32(address + Self::FLAGS)?),
            extra_inhabitant_count: memory.read_u32(address + Self::EXTRA_INHABITANT_COUNT)?,
        })
    }

    pub fn alignment(&self) -> usize {
        self.flags.alignment()
    }
}
