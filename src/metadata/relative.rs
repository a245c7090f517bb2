//! Self-relative pointers as emitted by the Swift compiler into metadata sections.

use crate::{error::MemoryError, memory::Memory};

/// A 32-bit signed offset from the address of the field itself. Zero encodes null.
pub struct RelativeDirectPointer;

impl RelativeDirectPointer {
    pub fn resolve(memory: &dyn Memory, at: usize) -> Result<Option<usize>, MemoryError> {
        let offset = memory.read_i32(at)?;
        if offset == 0 {
            return Ok(None);
        }
        Ok(Some(at.wrapping_add_signed(offset as isize)))
    }
}

/// Like [`RelativeDirectPointer`], but a set low bit means the target is a
/// pointer-sized slot holding the real address (typically a GOT entry).
pub struct RelativeIndirectablePointer;

impl RelativeIndirectablePointer {
    pub fn resolve(memory: &dyn Memory, at: usize) -> Result<Option<usize>, MemoryError> {
        let raw = memory.read_i32(at)?;
        if raw == 0 {
            return Ok(None);
        }
        let target = at.wrapping_add_signed((raw & !1) as isize);
        if raw & 1 == 0 {
            return Ok(Some(target));
        }
        match memory.read_pointer(target)? {
            0 => Ok(None),
            address => Ok(Some(address)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::LocalMemory;

    #[test]
    fn test_direct_pointer() {
        let mut words = vec![0u32; 4].into_boxed_slice();
        let base = words.as_mut_ptr() as usize;
        LocalMemory.write(base, &8i32.to_le_bytes()).unwrap();
        assert_eq!(
            RelativeDirectPointer::resolve(&LocalMemory, base).unwrap(),
            Some(base + 8)
        );
        assert_eq!(
            RelativeDirectPointer::resolve(&LocalMemory, base + 4).unwrap(),
            None
        );
    }

    #[test]
    fn test_negative_offset() {
        let mut words = vec![0u32; 4].into_boxed_slice();
        let base = words.as_mut_ptr() as usize;
        LocalMemory.write(base + 12, &(-12i32).to_le_bytes()).unwrap();
        assert_eq!(
            RelativeDirectPointer::resolve(&LocalMemory, base + 12).unwrap(),
            Some(base)
        );
    }

    #[test]
    fn test_indirectable_pointer() {
        let mut slots = vec![0u64; 4].into_boxed_slice();
        let base = slots.as_mut_ptr() as usize;
        LocalMemory.write_pointer(base + 16, 0x1234_5678).unwrap();
        LocalMemory.write(base, &(16i32 | 1).to_le_bytes()).unwrap();
        assert_eq!(
            RelativeIndirectablePointer::resolve(&LocalMemory, base).unwrap(),
            Some(0x1234_5678)
        );

        LocalMemory.write(base + 4, &12i32.to_le_bytes()).unwrap();
        assert_eq!(
            RelativeIndirectablePointer::resolve(&LocalMemory, base + 4).unwrap(),
            Some(base + 16)
        );
    }
}
