use crate::error::MemoryError;
use std::alloc::{alloc_zeroed, Layout};

pub const POINTER_SIZE: usize = 8;

const MAX_C_STRING: usize = 4096;

/// Raw access to the memory of the process hosting the Swift runtime.
///
/// All multi-byte reads are little-endian.
pub trait Memory: Send + Sync {
    fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), MemoryError>;
    fn write(&self, address: usize, bytes: &[u8]) -> Result<(), MemoryError>;
    /// Returns zeroed memory that stays valid for the lifetime of the process.
    fn allocate(&self, size: usize, align: usize) -> Result<usize, MemoryError>;

    fn read_bytes(&self, address: usize, len: usize) -> Result<Vec<u8>, MemoryError> {
        let mut buf = vec![0; len];
        self.read(address, &mut buf)?;
        Ok(buf)
    }

    fn read_u8(&self, address: usize) -> Result<u8, MemoryError> {
        let mut buf = [0; 1];
        self.read(address, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&self, address: usize) -> Result<u16, MemoryError> {
        let mut buf = [0; 2];
        self.read(address, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, address: usize) -> Result<u32, MemoryError> {
        let mut buf = [0; 4];
        self.read(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_i32(&self, address: usize) -> Result<i32, MemoryError> {
        let mut buf = [0; 4];
        self.read(address, &mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    fn read_u64(&self, address: usize) -> Result<u64, MemoryError> {
        let mut buf = [0; 8];
        self.read(address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_pointer(&self, address: usize) -> Result<usize, MemoryError> {
        Ok(self.read_u64(address)? as usize)
    }

    fn write_u64(&self, address: usize, value: u64) -> Result<(), MemoryError> {
        self.write(address, &value.to_le_bytes())
    }

    fn write_pointer(&self, address: usize, value: usize) -> Result<(), MemoryError> {
        self.write_u64(address, value as u64)
    }

    fn read_c_string(&self, address: usize) -> Result<String, MemoryError> {
        let mut bytes = Vec::new();
        loop {
            if bytes.len() >= MAX_C_STRING {
                return Err(MemoryError::InvalidString(address));
            }
            match self.read_u8(address + bytes.len())? {
                0 => break,
                b => bytes.push(b),
            }
        }
        String::from_utf8(bytes).map_err(|_| MemoryError::InvalidString(address))
    }
}

/// Memory of the current process, accessed through raw pointers.
///
/// Null and overflowing ranges are rejected; any other address is trusted, the
/// same way the Swift runtime trusts the pointers it publishes.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalMemory;

impl LocalMemory {
    fn check(address: usize, len: usize) -> Result<(), MemoryError> {
        if address == 0 || address.checked_add(len).is_none() {
            return Err(MemoryError::AccessViolation(address));
        }
        Ok(())
    }
}

impl Memory for LocalMemory {
    fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), MemoryError> {
        if buf.is_empty() {
            return Ok(());
        }
        Self::check(address, buf.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(address as *const u8, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    fn write(&self, address: usize, bytes: &[u8]) -> Result<(), MemoryError> {
        if bytes.is_empty() {
            return Ok(());
        }
        Self::check(address, bytes.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
        }
        Ok(())
    }

    fn allocate(&self, size: usize, align: usize) -> Result<usize, MemoryError> {
        let layout = Layout::from_size_align(size.max(1), align.max(1))
            .map_err(|_| MemoryError::OutOfMemory(size))?;
        // handed to Swift code, never reclaimed here
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(MemoryError::OutOfMemory(size));
        }
        Ok(ptr as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_round_trip() {
        let memory = LocalMemory;
        let buf = memory.allocate(32, 8).unwrap();
        memory.write_u64(buf + 8, 0xdead_beef).unwrap();
        assert_eq!(memory.read_u64(buf + 8).unwrap(), 0xdead_beef);
        assert_eq!(memory.read_u32(buf + 8).unwrap(), 0xdead_beef);
        assert_eq!(memory.read_u64(buf).unwrap(), 0);
    }

    #[test]
    fn test_null_is_rejected() {
        assert_eq!(
            LocalMemory.read_u8(0),
            Err(MemoryError::AccessViolation(0))
        );
    }

    #[test]
    fn test_c_string() {
        let text = b"SomeStruct\0";
        let address = text.as_ptr() as usize;
        assert_eq!(LocalMemory.read_c_string(address).unwrap(), "SomeStruct");
    }
}
