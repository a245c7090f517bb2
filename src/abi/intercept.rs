//! Rebuilding arguments and results of intercepted calls.
//!
//! The trampoline that captures registers lives outside this crate, behind
//! [`Interposer`]. Parsing here only reads the snapshots it delivers.

use super::{
    invoke::RegisterFrame, ArgumentClass, CallSignature, ReturnClass, WordLocation, MAX_ARGUMENT_REGISTERS,
    MAX_RESULT_WORDS,
};
use crate::{
    error::{BridgeError, Result},
    memory::Memory,
    utils::bytes_from_words,
    value::Value,
};
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::Arc;
use tracing::{debug, trace};

/// Integer registers as seen by a trampoline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegisterSnapshot {
    pub gpr: [u64; MAX_ARGUMENT_REGISTERS],
    pub context: u64,
    pub indirect_result: u64,
    pub ret: [u64; MAX_RESULT_WORDS],
    pub error: u64,
}

impl From<&RegisterFrame> for RegisterSnapshot {
    fn from(frame: &RegisterFrame) -> Self {
        Self {
            gpr: frame.gpr,
            context: frame.context,
            indirect_result: frame.indirect_result,
            ret: frame.ret,
            error: frame.error,
        }
    }
}

/// The incoming stack argument area.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StackSnapshot {
    pub base: usize,
}

fn read_word(memory: &dyn Memory, registers: &RegisterSnapshot, stack: &StackSnapshot, location: WordLocation) -> Result<u64> {
    match location {
        WordLocation::Register(r) => Ok(registers.gpr[r]),
        WordLocation::Stack(offset) => Ok(memory.read_u64(stack.base + offset)?),
    }
}

/// Rebuilds the arguments of a call at entry. Direct and stack arguments are
/// copied; indirect ones are borrowed from the caller.
pub fn parse_arguments(
    memory: &Arc<dyn Memory>,
    signature: &CallSignature,
    registers: &RegisterSnapshot,
    stack: &StackSnapshot,
) -> Result<Vec<Value>> {
    signature
        .arguments
        .iter()
        .map(|slot| {
            let ty = slot.ty.clone();
            match slot.class {
                ArgumentClass::DirectRegister { first, count } => {
                    let bytes = bytes_from_words(&registers.gpr[first..first + count]);
                    Value::from_bytes(memory.clone(), ty, &bytes)
                }
                ArgumentClass::IndirectPointer(location) => {
                    let address = read_word(memory.as_ref(), registers, stack, location)? as usize;
                    Value::from_raw(memory.clone(), ty.clone(), address, ty.stride())
                }
                ArgumentClass::Stack { offset, size } => {
                    let bytes = memory.read_bytes(stack.base + offset, size)?;
                    Value::from_bytes(memory.clone(), ty, &bytes)
                }
            }
        })
        .collect()
}

/// Rebuilds the result at exit. `registers.indirect_result` must hold the
/// value the register had at entry.
pub fn parse_return(
    memory: &Arc<dyn Memory>,
    signature: &CallSignature,
    registers: &RegisterSnapshot,
) -> Result<Option<Value>> {
    if signature.throws && registers.error != 0 {
        return Err(BridgeError::Thrown(registers.error as usize));
    }
    let Some(ty) = signature.result.ty.clone() else {
        return Ok(None);
    };
    match signature.result.class {
        ReturnClass::Void => Ok(None),
        ReturnClass::Direct { words } => {
            let bytes = bytes_from_words(&registers.ret[..words]);
            Value::from_bytes(memory.clone(), ty, &bytes).map(Some)
        }
        ReturnClass::Indirect => {
            let address = registers.indirect_result as usize;
            Value::from_raw(memory.clone(), ty.clone(), address, ty.stride()).map(Some)
        }
    }
}

pub type EnterHandler = Box<dyn Fn(&[Value]) + Send + Sync>;
pub type LeaveHandler = Box<dyn Fn(Result<Option<Value>>) + Send + Sync>;

/// State carried from entry to exit of one intercepted call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub indirect_result: u64,
}

/// A hook record handed to the trampoline.
pub struct SwiftHook {
    memory: Arc<dyn Memory>,
    signature: Arc<CallSignature>,
    on_enter: Option<EnterHandler>,
    on_leave: Option<LeaveHandler>,
}

impl SwiftHook {
    pub fn new(memory: Arc<dyn Memory>, signature: Arc<CallSignature>) -> Self {
        Self {
            memory,
            signature,
            on_enter: None,
            on_leave: None,
        }
    }

    pub fn on_enter(mut self, handler: impl Fn(&[Value]) + Send + Sync + 'static) -> Self {
        self.on_enter = Some(Box::new(handler));
        self
    }

    pub fn on_leave(mut self, handler: impl Fn(Result<Option<Value>>) + Send + Sync + 'static) -> Self {
        self.on_leave = Some(Box::new(handler));
        self
    }

    pub fn signature(&self) -> &Arc<CallSignature> {
        &self.signature
    }

    /// Called by the trampoline at entry.
    pub fn enter(&self, registers: &RegisterSnapshot, stack: &StackSnapshot) -> Result<Invocation> {
        if let Some(handler) = &self.on_enter {
            let args = parse_arguments(&self.memory, &self.signature, registers, stack)?;
            trace!(args = args.len(), "enter");
            handler(&args);
        }
        Ok(Invocation {
            indirect_result: registers.indirect_result,
        })
    }

    /// Called by the trampoline at exit.
    pub fn leave(&self, invocation: &Invocation, registers: &RegisterSnapshot) {
        if let Some(handler) = &self.on_leave {
            let registers = RegisterSnapshot {
                indirect_result: invocation.indirect_result,
                ..*registers
            };
            let result = parse_return(&self.memory, &self.signature, &registers);
            trace!(ok = result.is_ok(), "leave");
            handler(result);
        }
    }
}

/// Installs trampolines that call [`SwiftHook::enter`] and [`SwiftHook::leave`].
pub trait Interposer: Send + Sync {
    fn attach(&self, target: usize, hook: Arc<SwiftHook>) -> Result<()>;
    fn detach(&self, target: usize) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookId(pub usize);

/// One hook per address.
pub struct Interceptor {
    interposer: Arc<dyn Interposer>,
    hooks: DashMap<usize, Arc<SwiftHook>>,
}

impl Interceptor {
    pub fn new(interposer: Arc<dyn Interposer>) -> Self {
        Self {
            interposer,
            hooks: DashMap::new(),
        }
    }

    /// Attaches `hook` to `target`, replacing any previous hook there. When
    /// the interposer refuses the new hook the previous one is reattached.
    pub fn attach(&self, target: usize, hook: SwiftHook) -> Result<HookId> {
        let hook = Arc::new(hook);
        match self.hooks.entry(target) {
            Entry::Occupied(mut entry) => {
                self.interposer.detach(target)?;
                if let Err(e) = self.interposer.attach(target, hook.clone()) {
                    self.interposer.attach(target, entry.get().clone())?;
                    return Err(e);
                }
                entry.insert(hook);
                debug!(target, "replaced");
            }
            Entry::Vacant(entry) => {
                self.interposer.attach(target, hook.clone())?;
                entry.insert(hook);
                debug!(target, "attached");
            }
        }
        Ok(HookId(target))
    }

    /// Returns whether a hook was attached.
    pub fn detach(&self, id: HookId) -> Result<bool> {
        let Entry::Occupied(entry) = self.hooks.entry(id.0) else {
            return Ok(false);
        };
        self.interposer.detach(id.0)?;
        entry.remove();
        debug!(target = id.0, "detached");
        Ok(true)
    }

    /// Detaches every hook whose target satisfies `predicate`.
    pub fn detach_where(&self, predicate: impl Fn(usize) -> bool) -> Result<usize> {
        let targets: Vec<usize> = self
            .hooks
            .iter()
            .map(|h| *h.key())
            .filter(|&t| predicate(t))
            .collect();
        for &target in &targets {
            self.detach(HookId(target))?;
        }
        Ok(targets.len())
    }

    pub fn hooks(&self) -> Vec<HookId> {
        let mut hooks: Vec<_> = self.hooks.iter().map(|h| HookId(*h.key())).collect();
        hooks.sort();
        hooks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        abi::Abi,
        memory::LocalMemory,
        types::{builtins::standard, TypeDescriptor},
    };
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    fn memory() -> Arc<dyn Memory> {
        Arc::new(LocalMemory)
    }

    fn int() -> Arc<TypeDescriptor> {
        Arc::new(standard("Int").unwrap())
    }

    fn words(n: usize) -> Arc<TypeDescriptor> {
        Arc::new(TypeDescriptor::structure(
            "main",
            format!("Words{n}"),
            (0..n).map(|i| (format!("w{i}"), int())).collect(),
        ))
    }

    #[derive(Default)]
    struct Trampolines(Mutex<Vec<(bool, usize)>>);

    impl Interposer for Trampolines {
        fn attach(&self, target: usize, _hook: Arc<SwiftHook>) -> Result<()> {
            self.0.lock().push((true, target));
            Ok(())
        }

        fn detach(&self, target: usize) -> Result<()> {
            self.0.lock().push((false, target));
            Ok(())
        }
    }

    #[test]
    fn test_parse_arguments_with_stack() {
        let sig = CallSignature::new(
            Abi::X86_64,
            Some(words(5)),
            vec![words(4), words(4), int()],
            false,
            false,
        )
        .unwrap();
        let stack = [5u64, 6, 7, 8, 9, 0];
        let registers = RegisterSnapshot {
            gpr: [1, 2, 3, 4, 0, 0, 0, 0],
            ..Default::default()
        };
        let args = parse_arguments(
            &memory(),
            &sig,
            &registers,
            &StackSnapshot {
                base: stack.as_ptr() as usize,
            },
        )
        .unwrap();
        assert_eq!(args.len(), 3);
        assert_eq!(args[0].bytes().unwrap(), bytes_from_words(&[1, 2, 3, 4]));
        assert_eq!(args[1].bytes().unwrap(), bytes_from_words(&[5, 6, 7, 8]));
        assert_eq!(args[2].read_word(0).unwrap(), 9);
        assert!(args.iter().all(Value::is_owned));
    }

    #[test]
    fn test_leave_uses_entry_indirect_result() {
        let result = [1u64, 2, 3, 4, 5];
        let sig = Arc::new(CallSignature::new(Abi::ARM64, Some(words(5)), vec![], false, false).unwrap());
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let hook = SwiftHook::new(memory(), sig).on_leave(move |r| {
            *sink.lock() = Some(r.unwrap().unwrap().read_word(32).unwrap());
        });
        let invocation = hook
            .enter(
                &RegisterSnapshot {
                    indirect_result: result.as_ptr() as u64,
                    ..Default::default()
                },
                &StackSnapshot::default(),
            )
            .unwrap();
        hook.leave(&invocation, &RegisterSnapshot::default());
        assert_eq!(*seen.lock(), Some(5));
    }

    #[test]
    fn test_parse_return_throws() {
        let sig = CallSignature::new(Abi::ARM64, Some(int()), vec![], false, true).unwrap();
        let registers = RegisterSnapshot {
            ret: [42, 0, 0, 0],
            ..Default::default()
        };
        let value = parse_return(&memory(), &sig, &registers).unwrap().unwrap();
        assert_eq!(value.read_word(0).unwrap(), 42);
        let thrown = RegisterSnapshot {
            error: 0xbad0,
            ..registers
        };
        assert_eq!(parse_return(&memory(), &sig, &thrown).unwrap_err(), BridgeError::Thrown(0xbad0));
    }

    /// Refuses new hooks once `refuse` is set.
    #[derive(Default)]
    struct Strict {
        attached: Mutex<Vec<(usize, Arc<SwiftHook>)>>,
        refuse: Mutex<bool>,
    }

    impl Interposer for Strict {
        fn attach(&self, target: usize, hook: Arc<SwiftHook>) -> Result<()> {
            let mut refuse = self.refuse.lock();
            if *refuse {
                *refuse = false;
                return Err(BridgeError::Runtime(format!("cannot hook {target:#x}")));
            }
            self.attached.lock().push((target, hook));
            Ok(())
        }

        fn detach(&self, target: usize) -> Result<()> {
            self.attached.lock().retain(|(t, _)| *t != target);
            Ok(())
        }
    }

    #[test]
    fn test_failed_replacement_keeps_previous_hook() {
        let strict = Arc::new(Strict::default());
        let interceptor = Interceptor::new(strict.clone());
        let sig = Arc::new(CallSignature::new(Abi::ARM64, None, vec![], false, false).unwrap());
        interceptor.attach(0x10, SwiftHook::new(memory(), sig.clone())).unwrap();
        let previous = strict.attached.lock()[0].1.clone();

        *strict.refuse.lock() = true;
        assert!(matches!(
            interceptor.attach(0x10, SwiftHook::new(memory(), sig)),
            Err(BridgeError::Runtime(_))
        ));
        assert_eq!(interceptor.hooks(), vec![HookId(0x10)]);
        let attached = strict.attached.lock();
        assert_eq!(attached.len(), 1);
        assert!(Arc::ptr_eq(&attached[0].1, &previous));
        assert!(Arc::ptr_eq(interceptor.hooks.get(&0x10).unwrap().value(), &previous));
    }

    #[test]
    fn test_interceptor_replaces_hooks() {
        let trampolines = Arc::new(Trampolines::default());
        let interceptor = Interceptor::new(trampolines.clone());
        let sig = Arc::new(CallSignature::new(Abi::ARM64, None, vec![], false, false).unwrap());
        interceptor.attach(0x10, SwiftHook::new(memory(), sig.clone())).unwrap();
        interceptor.attach(0x10, SwiftHook::new(memory(), sig.clone())).unwrap();
        interceptor.attach(0x20, SwiftHook::new(memory(), sig)).unwrap();
        assert_eq!(interceptor.hooks(), vec![HookId(0x10), HookId(0x20)]);
        assert_eq!(interceptor.detach_where(|t| t < 0x18).unwrap(), 1);
        assert!(!interceptor.detach(HookId(0x10)).unwrap());
        assert_eq!(
            *trampolines.0.lock(),
            vec![(true, 0x10), (false, 0x10), (true, 0x10), (true, 0x20), (false, 0x10)]
        );
    }
}
