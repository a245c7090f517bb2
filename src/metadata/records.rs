//! Reflection field records from `__swift5_fieldmd`.

use super::{relative::RelativeDirectPointer, values::FieldRecordFlags};
use crate::{error::MemoryError, memory::Memory};

const HEADER_SIZE: usize = 0x10;
const RECORD_SIZE: usize = 0xc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldRecord {
    pub flags: FieldRecordFlags,
    /// Address of the mangled type name; absent for enum cases without payload.
    pub mangled_type_name: Option<usize>,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub address: usize,
    pub records: Vec<FieldRecord>,
}

impl FieldDescriptor {
    pub fn read(memory: &dyn Memory, address: usize) -> Result<Self, MemoryError> {
        let count = memory.read_u32(address + 0xc)? as usize;
        let mut records = Vec::with_capacity(count);
        for i in 0..count {
            let at = address + HEADER_SIZE + i * RECORD_SIZE;
            let name = match RelativeDirectPointer::resolve(memory, at + 8)? {
                Some(name) => memory.read_c_string(name)?,
                None => String::new(),
            };
            records.push(FieldRecord {
                flags: FieldRecordFlags(memory.read_u32(at)?),
                mangled_type_name: RelativeDirectPointer::resolve(memory, at + 4)?,
                name,
            });
        }
        Ok(Self { address, records })
    }
}
