use crate::error::MemoryError;
use parking_lot::RwLock;
use std::fmt::{Debug, Formatter};

/// A zeroed, word-aligned heap buffer owned by the bridge.
///
/// The buffer never moves, so its address can be handed to Swift code (as an
/// indirect argument or result) while the bridge keeps reading it through the
/// lock.
pub struct OwnedStorage {
    words: RwLock<Box<[u64]>>,
    address: usize,
    len: usize,
}

impl Debug for OwnedStorage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "OwnedStorage({:#x}, {} bytes)", self.address, self.len)
    }
}

impl OwnedStorage {
    pub fn zeroed(len: usize) -> Self {
        let words = vec![0u64; len.div_ceil(8).max(1)].into_boxed_slice();
        let address = words.as_ptr() as usize;
        Self {
            words: RwLock::new(words),
            address,
            len,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let storage = Self::zeroed(bytes.len());
        storage.with_bytes_mut(|b| b.copy_from_slice(bytes));
        storage
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let words = self.words.read();
        // SAFETY: the buffer holds at least `len` bytes and u8 has no alignment
        let bytes = unsafe { std::slice::from_raw_parts(words.as_ptr() as *const u8, self.len) };
        f(bytes)
    }

    fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut words = self.words.write();
        // SAFETY: as above, and the write guard gives exclusive access
        let bytes =
            unsafe { std::slice::from_raw_parts_mut(words.as_mut_ptr() as *mut u8, self.len) };
        f(bytes)
    }

    pub fn read_into(&self, offset: usize, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.with_bytes(|bytes| {
            let src = offset
                .checked_add(buf.len())
                .and_then(|end| bytes.get(offset..end))
                .ok_or(MemoryError::AccessViolation(self.address + offset))?;
            buf.copy_from_slice(src);
            Ok(())
        })
    }

    pub fn write_from(&self, offset: usize, src: &[u8]) -> Result<(), MemoryError> {
        let address = self.address;
        self.with_bytes_mut(|bytes| {
            let dst = offset
                .checked_add(src.len())
                .and_then(|end| bytes.get_mut(offset..end))
                .ok_or(MemoryError::AccessViolation(address + offset))?;
            dst.copy_from_slice(src);
            Ok(())
        })
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.with_bytes(|b| b.to_vec())
    }
}
