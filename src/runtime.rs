//! Optional entry points of `libswiftCore`.

use crate::{
    abi::invoke::{CallBackend, RegisterFrame},
    error::{BridgeError, Result},
    memory::{Memory, POINTER_SIZE},
    value::{existential::boxed_value_offset, layout::Layout},
};
use libloading::{Library, Symbol};
use std::{
    ffi::{c_char, CStr},
    path::Path,
    sync::Arc,
};
use tracing::{debug, trace};

#[cfg(target_vendor = "apple")]
pub const DEFAULT_LIBRARY: &str = "libswiftCore.dylib";
#[cfg(not(target_vendor = "apple"))]
pub const DEFAULT_LIBRARY: &str = "libswiftCore.so";

const DEMANGLE_BUFFER: usize = 4096;

type DemangleFn = unsafe extern "C" fn(*const c_char, usize, *mut c_char, *mut usize, u32) -> *mut c_char;

/// Turns mangled symbol names into readable signatures.
pub trait Demangler: Send + Sync {
    fn demangle(&self, symbol: &str) -> Option<String>;
}

/// Provides heap boxes for existential values too large to store inline.
pub trait BoxAllocator: Send + Sync {
    /// Returns the box object and the address of its value.
    fn allocate_box(&self, memory: &dyn Memory, metadata: usize, layout: &Layout) -> Result<(usize, usize)>;
}

/// Boxes carved out of plain memory, with the metadata pointer in the header.
///
/// The reference count word stays zero, so these boxes must never reach the
/// Swift runtime's retain and release paths.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapBoxAllocator;

impl BoxAllocator for HeapBoxAllocator {
    fn allocate_box(&self, memory: &dyn Memory, metadata: usize, layout: &Layout) -> Result<(usize, usize)> {
        let offset = boxed_value_offset(layout.alignment);
        let object = memory.allocate(offset + layout.size, layout.alignment.max(POINTER_SIZE))?;
        memory.write_pointer(object, metadata)?;
        trace!(object, offset, "allocated heap box");
        Ok((object, object + offset))
    }
}

/// Boxes from `swift_allocBox`, called through a [`CallBackend`].
pub struct RuntimeBoxAllocator {
    address: usize,
    backend: Arc<dyn CallBackend>,
}

impl RuntimeBoxAllocator {
    pub fn new(address: usize, backend: Arc<dyn CallBackend>) -> Self {
        Self { address, backend }
    }
}

impl BoxAllocator for RuntimeBoxAllocator {
    fn allocate_box(&self, _memory: &dyn Memory, metadata: usize, _layout: &Layout) -> Result<(usize, usize)> {
        let mut frame = RegisterFrame {
            target: self.address as u64,
            ..Default::default()
        };
        frame.gpr[0] = metadata as u64;
        unsafe { self.backend.call(&mut frame, &[])? };
        let (object, address) = (frame.ret[0] as usize, frame.ret[1] as usize);
        if object == 0 {
            return Err(BridgeError::Runtime("swift_allocBox returned null".into()));
        }
        Ok((object, address))
    }
}

/// A loaded Swift runtime library.
pub struct SwiftRuntime {
    // keeps the copied function pointers valid
    _library: Library,
    demangle: Option<DemangleFn>,
    alloc_box: Option<usize>,
}

impl SwiftRuntime {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let library = unsafe { Library::new(path) }
            .map_err(|e| BridgeError::Runtime(format!("{}: {e}", path.display())))?;

        let demangle = unsafe { library.get::<DemangleFn>(b"swift_demangle") }
            .ok()
            .map(|s: Symbol<DemangleFn>| *s);
        let alloc_box = unsafe { library.get::<unsafe extern "C" fn()>(b"swift_allocBox") }
            .ok()
            .map(|s: Symbol<unsafe extern "C" fn()>| *s as usize);
        debug!(
            path = %path.display(),
            demangle = demangle.is_some(),
            alloc_box = alloc_box.is_some(),
            "opened Swift runtime"
        );

        Ok(Self {
            _library: library,
            demangle,
            alloc_box,
        })
    }

    pub fn open_default() -> Result<Self> {
        Self::open(DEFAULT_LIBRARY)
    }

    pub fn alloc_box_address(&self) -> Option<usize> {
        self.alloc_box
    }

    /// A box allocator backed by `swift_allocBox`, if the runtime exports it.
    pub fn box_allocator(&self, backend: Arc<dyn CallBackend>) -> Option<RuntimeBoxAllocator> {
        self.alloc_box
            .map(|address| RuntimeBoxAllocator::new(address, backend))
    }
}

impl Demangler for SwiftRuntime {
    fn demangle(&self, symbol: &str) -> Option<String> {
        let demangle = self.demangle?;
        let mut buf = vec![0u8; DEMANGLE_BUFFER];
        let mut len = buf.len();
        let result = unsafe {
            demangle(
                symbol.as_ptr().cast(),
                symbol.len(),
                buf.as_mut_ptr().cast(),
                &mut len,
                0,
            )
        };
        if result.is_null() {
            return None;
        }
        // the runtime NUL-terminates within the buffer it was given
        buf[DEMANGLE_BUFFER - 1] = 0;
        let text = CStr::from_bytes_until_nul(&buf).ok()?;
        Some(text.to_string_lossy().into_owned())
    }
}

/// Looks names up in a fixed table.
#[derive(Debug, Default, Clone)]
pub struct StaticDemangler(pub std::collections::HashMap<String, String>);

impl Demangler for StaticDemangler {
    fn demangle(&self, symbol: &str) -> Option<String> {
        self.0.get(symbol).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::LocalMemory;
    use pretty_assertions::assert_eq;

    struct AllocBox;

    impl CallBackend for AllocBox {
        unsafe fn call(&self, frame: &mut RegisterFrame, stack: &[u64]) -> Result<()> {
            assert!(stack.is_empty());
            assert_eq!(frame.target, 0x5000);
            frame.ret[0] = 0xb000;
            frame.ret[1] = 0xb000 + 16 + frame.gpr[0];
            Ok(())
        }
    }

    #[test]
    fn test_heap_box_layout() {
        let layout = Layout {
            size: 40,
            stride: 40,
            alignment: 8,
            extra_inhabitants: 0,
        };
        let (object, address) = HeapBoxAllocator.allocate_box(&LocalMemory, 0x1234, &layout).unwrap();
        assert_eq!(address, object + 16);
        assert_eq!(LocalMemory.read_pointer(object).unwrap(), 0x1234);
        assert_eq!(LocalMemory.read_bytes(address, 40).unwrap(), vec![0; 40]);
    }

    #[test]
    fn test_runtime_box_allocator() {
        let allocator = RuntimeBoxAllocator::new(0x5000, Arc::new(AllocBox));
        let layout = Layout {
            size: 8,
            stride: 8,
            alignment: 8,
            extra_inhabitants: 0,
        };
        assert_eq!(
            allocator.allocate_box(&LocalMemory, 4, &layout).unwrap(),
            (0xb000, 0xb014)
        );
    }

    #[test]
    fn test_missing_library() {
        assert!(matches!(
            SwiftRuntime::open("/nonexistent/libswiftCore.so"),
            Err(BridgeError::Runtime(_))
        ));
    }
}
