#![cfg(any(target_arch = "aarch64", target_arch = "x86_64"))]

mod common;

use common::main_module;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use swift_rs::{utils::bytes_from_words, Bridge, BridgeError, TypeDescriptor, Value};

/// Leaf functions following the Swift calling convention.
#[cfg(target_arch = "x86_64")]
mod fixtures {
    use core::arch::naked_asm;

    #[unsafe(naked)]
    pub extern "C" fn sum3() {
        naked_asm!("lea rax, [rdi + rsi]", "add rax, rdx", "ret")
    }

    #[unsafe(naked)]
    pub extern "C" fn add_context() {
        naked_asm!("lea rax, [r13 + rdi]", "ret")
    }

    #[unsafe(naked)]
    pub extern "C" fn five_words() {
        naked_asm!(
            "mov qword ptr [rax], 1",
            "mov qword ptr [rax + 8], 2",
            "mov qword ptr [rax + 16], 3",
            "mov qword ptr [rax + 24], 4",
            "mov qword ptr [rax + 32], 5",
            "ret"
        )
    }

    #[unsafe(naked)]
    pub extern "C" fn throws() {
        naked_asm!("mov r12, 0xe0", "xor eax, eax", "ret")
    }

    /// Last word of the register struct, last word of the stack struct and
    /// the trailing integer.
    #[unsafe(naked)]
    pub extern "C" fn spill() {
        naked_asm!("mov rax, [rsp + 32]", "add rax, [rsp + 40]", "add rax, rcx", "ret")
    }
}

#[cfg(target_arch = "aarch64")]
mod fixtures {
    use core::arch::naked_asm;

    #[unsafe(naked)]
    pub extern "C" fn sum3() {
        naked_asm!("add x0, x0, x1", "add x0, x0, x2", "ret")
    }

    #[unsafe(naked)]
    pub extern "C" fn add_context() {
        naked_asm!("add x0, x20, x0", "ret")
    }

    #[unsafe(naked)]
    pub extern "C" fn five_words() {
        naked_asm!(
            "mov x9, #1",
            "str x9, [x8]",
            "mov x9, #2",
            "str x9, [x8, #8]",
            "mov x9, #3",
            "str x9, [x8, #16]",
            "mov x9, #4",
            "str x9, [x8, #24]",
            "mov x9, #5",
            "str x9, [x8, #32]",
            "ret"
        )
    }

    #[unsafe(naked)]
    pub extern "C" fn throws() {
        naked_asm!("mov x21, #0xe0", "mov x0, #0", "ret")
    }

    /// Last word of each register struct and the integer spilled to the stack.
    #[unsafe(naked)]
    pub extern "C" fn spill() {
        naked_asm!("ldr x9, [sp]", "add x0, x3, x7", "add x0, x0, x9", "ret")
    }
}

fn address(f: extern "C" fn()) -> usize {
    f as usize
}

struct Harness {
    bridge: Bridge,
    int: Arc<TypeDescriptor>,
}

impl Harness {
    fn new() -> Self {
        let bridge = Bridge::builder().build().unwrap();
        let int = bridge.type_named("Swift.Int").unwrap();
        Self { bridge, int }
    }

    fn int(&self, v: i64) -> Value {
        Value::from_bytes(self.bridge.memory().clone(), self.int.clone(), &v.to_le_bytes()).unwrap()
    }
}

#[test]
fn test_direct_arguments() {
    let h = Harness::new();
    let sum3 = h
        .bridge
        .native_function(
            address(fixtures::sum3),
            Some(h.int.clone()),
            vec![h.int.clone(), h.int.clone(), h.int.clone()],
            false,
            false,
        )
        .unwrap();
    let result = unsafe { sum3.call(&[h.int(1), h.int(20), h.int(300)]) }.unwrap();
    assert_eq!(result, Some(h.int(321)));
}

#[test]
fn test_context_register() {
    let h = Harness::new();
    let add = h
        .bridge
        .native_function(
            address(fixtures::add_context),
            Some(h.int.clone()),
            vec![h.int.clone()],
            true,
            false,
        )
        .unwrap();
    assert!(matches!(
        unsafe { add.call(&[h.int(1)]) },
        Err(BridgeError::InvalidValue(_))
    ));
    let add = add.with_context(40);
    assert_eq!(unsafe { add.call(&[h.int(2)]) }.unwrap(), Some(h.int(42)));
}

#[test]
fn test_indirect_result() {
    let h = Harness::new();
    let five = h
        .bridge
        .type_named("(Swift.Int, Swift.Int, Swift.Int, Swift.Int, Swift.Int)")
        .unwrap();
    let function = h
        .bridge
        .native_function(address(fixtures::five_words), Some(five.clone()), vec![], false, false)
        .unwrap();
    let result = unsafe { function.call(&[]) }.unwrap().unwrap();
    assert!(result.is_owned());
    assert_eq!(result.bytes().unwrap(), bytes_from_words(&[1, 2, 3, 4, 5]));
}

#[test]
fn test_thrown_error() {
    let h = Harness::new();
    let thrower = h
        .bridge
        .native_function(address(fixtures::throws), Some(h.int.clone()), vec![], false, true)
        .unwrap();
    assert_eq!(unsafe { thrower.call(&[]) }.unwrap_err(), BridgeError::Thrown(0xe0));

    // the error register stays clear when nothing is thrown
    let sum3 = h
        .bridge
        .native_function(
            address(fixtures::sum3),
            Some(h.int.clone()),
            vec![h.int.clone(), h.int.clone(), h.int.clone()],
            false,
            true,
        )
        .unwrap();
    assert_eq!(unsafe { sum3.call(&[h.int(1), h.int(2), h.int(3)]) }.unwrap(), Some(h.int(6)));
}

#[test]
fn test_stack_arguments() {
    let main = main_module();
    let bridge = Bridge::builder()
        .source(Arc::new(main.image.source()))
        .build()
        .unwrap();
    let int = bridge.type_named("Swift.Int").unwrap();
    let line = bridge.structs().get("main.Line").unwrap();
    let memory = bridge.memory().clone();

    let first = Value::from_bytes(memory.clone(), line.clone(), &bytes_from_words(&[1, 2, 3, 4])).unwrap();
    let second = Value::from_bytes(memory.clone(), line.clone(), &bytes_from_words(&[5, 6, 7, 8])).unwrap();
    let nine = Value::from_bytes(memory, int.clone(), &9i64.to_le_bytes()).unwrap();

    let spill = bridge
        .native_function(
            address(fixtures::spill),
            Some(int.clone()),
            vec![line.clone(), line, int.clone()],
            false,
            false,
        )
        .unwrap();
    assert!(spill.signature().stack_size > 0);
    let result = unsafe { spill.call(&[first, second, nine]) }.unwrap().unwrap();
    assert_eq!(result.read_word(0).unwrap(), 4 + 8 + 9);
}
