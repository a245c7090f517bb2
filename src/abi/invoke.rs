//! Calling Swift functions through a register frame.

use super::{ArgumentClass, CallSignature, ReturnClass, WordLocation, MAX_ARGUMENT_REGISTERS, MAX_RESULT_WORDS};
use crate::{
    error::{BridgeError, Result},
    memory::{Memory, POINTER_SIZE},
    resolve::MetadataAccessor,
    utils::{bytes_from_words, words_from_bytes},
    value::{storage::OwnedStorage, Value},
};
use std::sync::Arc;
use tracing::trace;

/// Register state handed to and filled by a [`CallBackend`]. The layout is
/// fixed: the native backend addresses fields by offset.
#[repr(C)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisterFrame {
    /// x0-x7, or rdi, rsi, rdx, rcx, r8, r9 (the last two unused).
    pub gpr: [u64; MAX_ARGUMENT_REGISTERS],
    /// x20 / r13
    pub context: u64,
    /// x8 / rax
    pub indirect_result: u64,
    pub stack_ptr: u64,
    pub stack_bytes: u64,
    pub target: u64,
    /// x0-x3, or rax, rdx, rcx, r8.
    pub ret: [u64; MAX_RESULT_WORDS],
    /// x21 / r12, in and out.
    pub error: u64,
}

/// Executes a prepared frame.
pub trait CallBackend: Send + Sync {
    /// # Safety
    /// `frame.target` must be a function that can be called with the
    /// registers and stack in the frame.
    unsafe fn call(&self, frame: &mut RegisterFrame, stack: &[u64]) -> Result<()>;
}

/// Calls on the current thread with inline assembly.
#[derive(Clone, Copy, Debug, Default)]
pub struct NativeBackend;

impl CallBackend for NativeBackend {
    unsafe fn call(&self, frame: &mut RegisterFrame, stack: &[u64]) -> Result<()> {
        if stack.len() % 2 != 0 {
            return Err(BridgeError::UnsupportedSignature(format!(
                "{} stack words break 16-byte alignment",
                stack.len()
            )));
        }
        frame.stack_ptr = stack.as_ptr() as u64;
        frame.stack_bytes = (stack.len() * POINTER_SIZE) as u64;
        native_call(frame)
    }
}

#[cfg(target_arch = "aarch64")]
unsafe fn native_call(frame: &mut RegisterFrame) -> Result<()> {
    core::arch::asm!(
        "mov x23, sp",
        // step over the red zone
        "sub sp, sp, #128",
        "ldr x10, [x22, #88]",
        "sub sp, sp, x10",
        "ldr x11, [x22, #80]",
        "mov x12, sp",
        "cbz x10, 2f",
        "1:",
        "ldr x13, [x11], #8",
        "str x13, [x12], #8",
        "subs x10, x10, #8",
        "b.ne 1b",
        "2:",
        "ldp x0, x1, [x22, #0]",
        "ldp x2, x3, [x22, #16]",
        "ldp x4, x5, [x22, #32]",
        "ldp x6, x7, [x22, #48]",
        "ldr x20, [x22, #64]",
        "ldr x8, [x22, #72]",
        "ldr x21, [x22, #136]",
        "ldr x9, [x22, #96]",
        "blr x9",
        "mov sp, x23",
        "stp x0, x1, [x22, #104]",
        "stp x2, x3, [x22, #120]",
        "str x21, [x22, #136]",
        inout("x22") frame as *mut RegisterFrame => _,
        out("x20") _,
        out("x21") _,
        out("x23") _,
        clobber_abi("C"),
    );
    Ok(())
}

#[cfg(target_arch = "x86_64")]
unsafe fn native_call(frame: &mut RegisterFrame) -> Result<()> {
    core::arch::asm!(
        "mov r14, rsp",
        "sub rsp, 128",
        "mov rcx, [r15 + 88]",
        "sub rsp, rcx",
        "and rsp, -16",
        "mov rsi, [r15 + 80]",
        "mov rdi, rsp",
        "cld",
        "rep movsb",
        "mov rdi, [r15 + 0]",
        "mov rsi, [r15 + 8]",
        "mov rdx, [r15 + 16]",
        "mov rcx, [r15 + 24]",
        "mov r8, [r15 + 32]",
        "mov r9, [r15 + 40]",
        "mov r13, [r15 + 64]",
        "mov rax, [r15 + 72]",
        "mov r12, [r15 + 136]",
        "call qword ptr [r15 + 96]",
        "mov rsp, r14",
        "mov [r15 + 104], rax",
        "mov [r15 + 112], rdx",
        "mov [r15 + 120], rcx",
        "mov [r15 + 128], r8",
        "mov [r15 + 136], r12",
        inout("r15") frame as *mut RegisterFrame => _,
        out("r12") _,
        out("r13") _,
        out("r14") _,
        clobber_abi("C"),
    );
    Ok(())
}

#[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
unsafe fn native_call(_frame: &mut RegisterFrame) -> Result<()> {
    Err(BridgeError::UnsupportedSignature(
        "native calls need aarch64 or x86_64".to_string(),
    ))
}

/// A prepared call: the frame, the outgoing stack and the indirect result
/// buffer, if any.
pub struct PreparedCall {
    pub frame: RegisterFrame,
    pub stack: Vec<u64>,
    pub result: Option<Arc<OwnedStorage>>,
}

pub struct Invoker {
    memory: Arc<dyn Memory>,
    backend: Arc<dyn CallBackend>,
}

impl Invoker {
    pub fn new(memory: Arc<dyn Memory>, backend: Arc<dyn CallBackend>) -> Self {
        Self { memory, backend }
    }

    pub fn native(memory: Arc<dyn Memory>) -> Self {
        Self::new(memory, Arc::new(NativeBackend))
    }

    pub fn memory(&self) -> &Arc<dyn Memory> {
        &self.memory
    }

    pub fn build_frame(
        &self,
        signature: &CallSignature,
        target: usize,
        context: Option<usize>,
        args: &[Value],
    ) -> Result<PreparedCall> {
        if args.len() != signature.arguments.len() {
            return Err(BridgeError::InvalidValue(format!(
                "expected {} arguments, got {}",
                signature.arguments.len(),
                args.len()
            )));
        }
        if signature.has_context != context.is_some() {
            return Err(BridgeError::InvalidValue(if signature.has_context {
                "call requires a context".to_string()
            } else {
                "call takes no context".to_string()
            }));
        }

        let mut frame = RegisterFrame {
            target: target as u64,
            context: context.unwrap_or(0) as u64,
            ..Default::default()
        };
        let mut stack = vec![0u8; signature.stack_size];

        for (index, (slot, arg)) in signature.arguments.iter().zip(args).enumerate() {
            if slot.ty != *arg.ty() {
                return Err(BridgeError::InvalidValue(format!(
                    "argument {index} must be {}, got {}",
                    slot.ty.full_name(),
                    arg.ty().full_name()
                )));
            }
            match slot.class {
                ArgumentClass::DirectRegister { first, count } => {
                    let words = words_from_bytes(&arg.bytes()?);
                    for (i, word) in words.into_iter().take(count).enumerate() {
                        frame.gpr[first + i] = word;
                    }
                }
                ArgumentClass::IndirectPointer(WordLocation::Register(r)) => {
                    frame.gpr[r] = arg.address() as u64;
                }
                ArgumentClass::IndirectPointer(WordLocation::Stack(offset)) => {
                    stack[offset..offset + POINTER_SIZE].copy_from_slice(&(arg.address() as u64).to_le_bytes());
                }
                ArgumentClass::Stack { offset, size } => {
                    let bytes = arg.bytes()?;
                    let len = size.min(bytes.len());
                    stack[offset..offset + len].copy_from_slice(&bytes[..len]);
                }
            }
        }

        let result = match (&signature.result.class, &signature.result.ty) {
            (ReturnClass::Indirect, Some(ty)) => {
                let storage = Arc::new(OwnedStorage::zeroed(ty.stride()));
                frame.indirect_result = storage.address() as u64;
                Some(storage)
            }
            _ => None,
        };
        trace!(target, ?frame, stack = stack.len(), "built frame");
        Ok(PreparedCall {
            frame,
            stack: words_from_bytes(&stack),
            result,
        })
    }

    /// Calls `target` and returns its result as an owned value.
    ///
    /// # Safety
    /// `target` must be a function of exactly `signature`.
    pub unsafe fn invoke(
        &self,
        signature: &CallSignature,
        target: usize,
        context: Option<usize>,
        args: &[Value],
    ) -> Result<Option<Value>> {
        let PreparedCall {
            mut frame,
            stack,
            result,
        } = self.build_frame(signature, target, context, args)?;
        self.backend.call(&mut frame, &stack)?;
        trace!(target, ret = ?frame.ret, error = frame.error, "returned");
        self.finish(signature, &frame, result)
    }

    fn finish(
        &self,
        signature: &CallSignature,
        frame: &RegisterFrame,
        result: Option<Arc<OwnedStorage>>,
    ) -> Result<Option<Value>> {
        if signature.throws && frame.error != 0 {
            return Err(BridgeError::Thrown(frame.error as usize));
        }
        let Some(ty) = signature.result.ty.clone() else {
            return Ok(None);
        };
        match (signature.result.class, result) {
            (ReturnClass::Direct { words }, _) => {
                let bytes = bytes_from_words(&frame.ret[..words]);
                Value::from_bytes(self.memory.clone(), ty, &bytes).map(Some)
            }
            (ReturnClass::Indirect, Some(storage)) => {
                Ok(Some(Value::owned(self.memory.clone(), ty, storage)))
            }
            _ => Ok(None),
        }
    }
}

impl MetadataAccessor for Invoker {
    fn access_metadata(&self, access_function: usize) -> Result<usize> {
        // request 0: complete metadata, blocking
        let mut frame = RegisterFrame {
            target: access_function as u64,
            ..Default::default()
        };
        unsafe { self.backend.call(&mut frame, &[])? };
        Ok(frame.ret[0] as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        abi::{Abi, CallSignature},
        memory::LocalMemory,
        types::{builtins::standard, TypeDescriptor},
    };
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    /// Records the frame and answers with canned registers.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(RegisterFrame, Vec<u64>)>>,
        ret: [u64; 4],
        error: u64,
    }

    impl CallBackend for Recorder {
        unsafe fn call(&self, frame: &mut RegisterFrame, stack: &[u64]) -> Result<()> {
            self.seen.lock().push((frame.clone(), stack.to_vec()));
            frame.ret = self.ret;
            frame.error = self.error;
            if frame.indirect_result != 0 {
                for i in 0..5u64 {
                    *((frame.indirect_result as *mut u64).add(i as usize)) = i + 1;
                }
            }
            Ok(())
        }
    }

    fn memory() -> Arc<dyn Memory> {
        Arc::new(LocalMemory)
    }

    fn int() -> Arc<TypeDescriptor> {
        Arc::new(standard("Int").unwrap())
    }

    fn int_value(v: i64) -> Value {
        Value::from_bytes(memory(), int(), &v.to_le_bytes()).unwrap()
    }

    fn words(n: usize) -> Arc<TypeDescriptor> {
        Arc::new(TypeDescriptor::structure(
            "main",
            format!("Words{n}"),
            (0..n).map(|i| (format!("w{i}"), int())).collect(),
        ))
    }

    #[test]
    fn test_frame_layout() {
        assert_eq!(std::mem::size_of::<RegisterFrame>(), 144);
        assert_eq!(std::mem::offset_of!(RegisterFrame, context), 64);
        assert_eq!(std::mem::offset_of!(RegisterFrame, target), 96);
        assert_eq!(std::mem::offset_of!(RegisterFrame, ret), 104);
        assert_eq!(std::mem::offset_of!(RegisterFrame, error), 136);
    }

    #[test]
    fn test_build_frame() {
        let invoker = Invoker::new(memory(), Arc::new(Recorder::default()));
        let pair = words(2);
        let big = words(5);
        let sig = CallSignature::new(
            Abi::X86_64,
            None,
            vec![pair.clone(), big.clone(), words(4), int()],
            true,
            false,
        )
        .unwrap();
        let pair_value = Value::from_bytes(memory(), pair, &bytes_from_words(&[7, 8])).unwrap();
        let big_value = Value::empty(memory(), big);
        let quad = Value::from_bytes(memory(), words(4), &bytes_from_words(&[1, 2, 3, 4])).unwrap();
        let call = invoker
            .build_frame(&sig, 0x1000, Some(0xc0), &[pair_value, big_value.clone(), quad, int_value(9)])
            .unwrap();
        assert_eq!(&call.frame.gpr[..3], &[7, 8, big_value.address() as u64]);
        assert_eq!(call.frame.context, 0xc0);
        assert_eq!(call.stack, vec![1, 2, 3, 4, 9, 0]);
        assert!(call.result.is_none());
    }

    #[test]
    fn test_argument_checks() {
        let invoker = Invoker::new(memory(), Arc::new(Recorder::default()));
        let sig = CallSignature::new(Abi::ARM64, None, vec![int()], false, false).unwrap();
        assert!(matches!(
            invoker.build_frame(&sig, 0x1000, None, &[]),
            Err(BridgeError::InvalidValue(_))
        ));
        let wrong = Value::empty(memory(), words(1));
        assert!(matches!(
            invoker.build_frame(&sig, 0x1000, None, &[wrong]),
            Err(BridgeError::InvalidValue(_))
        ));
        assert!(matches!(
            invoker.build_frame(&sig, 0x1000, Some(1), &[int_value(1)]),
            Err(BridgeError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_indirect_result() {
        let invoker = Invoker::new(memory(), Arc::new(Recorder::default()));
        let sig = CallSignature::new(Abi::ARM64, Some(words(5)), vec![], false, false).unwrap();
        let value = unsafe { invoker.invoke(&sig, 0x1000, None, &[]) }.unwrap().unwrap();
        assert!(value.is_owned());
        assert_eq!(value.read_word(0).unwrap(), 1);
        assert_eq!(value.read_word(32).unwrap(), 5);
    }

    #[test]
    fn test_direct_result_and_throw() {
        let recorder = Recorder {
            ret: [3, 4, 0, 0],
            ..Default::default()
        };
        let invoker = Invoker::new(memory(), Arc::new(recorder));
        let sig = CallSignature::new(Abi::ARM64, Some(words(2)), vec![], false, true).unwrap();
        let value = unsafe { invoker.invoke(&sig, 0x1000, None, &[]) }.unwrap().unwrap();
        assert_eq!(value.bytes().unwrap(), bytes_from_words(&[3, 4]));

        let thrower = Recorder {
            error: 0xe0,
            ..Default::default()
        };
        let invoker = Invoker::new(memory(), Arc::new(thrower));
        assert_eq!(
            unsafe { invoker.invoke(&sig, 0x1000, None, &[]) }.unwrap_err(),
            BridgeError::Thrown(0xe0)
        );
    }
}
