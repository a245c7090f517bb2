//! Placement of arguments and results under the Swift calling convention.

use crate::{
    error::{BridgeError, Result},
    memory::POINTER_SIZE,
    types::TypeDescriptor,
    value::layout::{align_up, HasLayout},
};
use std::{
    fmt::{Debug, Formatter},
    sync::Arc,
};
use tracing::trace;

pub mod intercept;
pub mod invoke;

/// Largest value passed or returned in registers.
pub const MAX_DIRECT_SIZE: usize = 4 * POINTER_SIZE;
/// Argument registers a [`invoke::RegisterFrame`] can hold.
pub const MAX_ARGUMENT_REGISTERS: usize = 8;
/// Result registers a [`invoke::RegisterFrame`] can hold.
pub const MAX_RESULT_WORDS: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Abi {
    pub name: &'static str,
    /// Integer registers available to arguments.
    pub argument_registers: usize,
    /// Integer registers available to a direct result.
    pub direct_result_words: usize,
}

impl Abi {
    pub const ARM64: Abi = Abi {
        name: "arm64",
        argument_registers: 8,
        direct_result_words: 4,
    };
    pub const X86_64: Abi = Abi {
        name: "x86_64",
        argument_registers: 6,
        direct_result_words: 4,
    };

    #[cfg(target_arch = "x86_64")]
    pub const fn host() -> Abi {
        Self::X86_64
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub const fn host() -> Abi {
        Self::ARM64
    }
}

/// How a value travels through a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lowering {
    /// As this many integer words.
    Direct(usize),
    /// As a pointer to a copy owned by the caller.
    Indirect,
}

pub fn lower(ty: &TypeDescriptor) -> Result<Lowering> {
    if ty.is_class() || ty.layout.is_reference() {
        return Ok(Lowering::Direct(1));
    }
    if let Some(composition) = &ty.existential {
        let words = composition.container_words();
        return Ok(if words * POINTER_SIZE <= MAX_DIRECT_SIZE {
            Lowering::Direct(words)
        } else {
            Lowering::Indirect
        });
    }
    let layout = &ty.layout;
    if layout.alignment() > POINTER_SIZE {
        return Err(BridgeError::UnsupportedSignature(format!(
            "{} is aligned to {} bytes",
            ty.full_name(),
            layout.alignment()
        )));
    }
    if layout.size() > MAX_DIRECT_SIZE || !layout.is_bitwise_takable() {
        return Ok(Lowering::Indirect);
    }
    if layout.contains_floats() {
        return Err(BridgeError::UnsupportedSignature(format!(
            "{} would be passed in floating-point registers",
            ty.full_name()
        )));
    }
    Ok(Lowering::Direct(layout.size().div_ceil(POINTER_SIZE)))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WordLocation {
    Register(usize),
    /// Byte offset into the outgoing argument area.
    Stack(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArgumentClass {
    DirectRegister { first: usize, count: usize },
    IndirectPointer(WordLocation),
    Stack { offset: usize, size: usize },
}

#[derive(Clone, PartialEq, Eq)]
pub struct ArgumentSlot {
    pub ty: Arc<TypeDescriptor>,
    pub class: ArgumentClass,
}

impl Debug for ArgumentSlot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {:?}", self.ty.full_name(), self.class)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReturnClass {
    Void,
    Direct { words: usize },
    /// Written through the indirect result register.
    Indirect,
}

#[derive(Clone, PartialEq, Eq)]
pub struct ReturnSlot {
    pub ty: Option<Arc<TypeDescriptor>>,
    pub class: ReturnClass,
}

impl Debug for ReturnSlot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.ty {
            Some(ty) => write!(f, "{}: {:?}", ty.full_name(), self.class),
            None => write!(f, "()"),
        }
    }
}

/// Where every argument and the result of one function live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallSignature {
    pub arguments: Vec<ArgumentSlot>,
    pub result: ReturnSlot,
    pub has_context: bool,
    pub throws: bool,
    /// Bytes of outgoing stack arguments, 16-byte aligned.
    pub stack_size: usize,
    pub abi: Abi,
}

impl CallSignature {
    /// Places `arguments` left to right. The first argument that does not fit
    /// the remaining registers sends itself and every later argument to the
    /// stack; swiftc would instead split exploded scalars between the last
    /// register and the stack, so such signatures differ from native code.
    pub fn new(
        abi: Abi,
        result: Option<Arc<TypeDescriptor>>,
        arguments: Vec<Arc<TypeDescriptor>>,
        has_context: bool,
        throws: bool,
    ) -> Result<Self> {
        if abi.argument_registers > MAX_ARGUMENT_REGISTERS || abi.direct_result_words > MAX_RESULT_WORDS {
            return Err(BridgeError::UnsupportedSignature(format!(
                "{} uses {} argument and {} result registers, at most {MAX_ARGUMENT_REGISTERS} and {MAX_RESULT_WORDS} are supported",
                abi.name, abi.argument_registers, abi.direct_result_words
            )));
        }
        let result = match result {
            None => ReturnSlot {
                ty: None,
                class: ReturnClass::Void,
            },
            Some(ty) => {
                let class = match lower(&ty)? {
                    Lowering::Direct(words) if words <= abi.direct_result_words => {
                        ReturnClass::Direct { words }
                    }
                    _ => ReturnClass::Indirect,
                };
                ReturnSlot { ty: Some(ty), class }
            }
        };

        let mut next_register = 0;
        let mut registers_open = true;
        let mut stack_offset = 0;

        let arguments = arguments
            .into_iter()
            .map(|ty| {
                let lowering = lower(&ty)?;
                let words = match lowering {
                    Lowering::Direct(words) => words,
                    Lowering::Indirect => 1,
                };
                let fits = registers_open && next_register + words <= abi.argument_registers;
                if !fits {
                    // later arguments never backfill registers
                    registers_open = false;
                }
                let class = match (lowering, fits) {
                    (Lowering::Direct(count), true) => {
                        let first = next_register;
                        next_register += count;
                        ArgumentClass::DirectRegister { first, count }
                    }
                    (Lowering::Indirect, true) => {
                        next_register += 1;
                        ArgumentClass::IndirectPointer(WordLocation::Register(next_register - 1))
                    }
                    (Lowering::Direct(_), false) => {
                        let size = ty.size();
                        ArgumentClass::Stack {
                            offset: stack_word(&mut stack_offset, size, ty.layout.alignment()),
                            size,
                        }
                    }
                    (Lowering::Indirect, false) => ArgumentClass::IndirectPointer(WordLocation::Stack(
                        stack_word(&mut stack_offset, POINTER_SIZE, POINTER_SIZE),
                    )),
                };
                Ok(ArgumentSlot { ty, class })
            })
            .collect::<Result<Vec<_>>>()?;

        let signature = Self {
            arguments,
            result,
            has_context,
            throws,
            stack_size: align_up(stack_offset, 16),
            abi,
        };
        trace!(?signature, "placed");
        Ok(signature)
    }

    pub fn argument_types(&self) -> impl Iterator<Item = &Arc<TypeDescriptor>> {
        self.arguments.iter().map(|a| &a.ty)
    }

    pub fn result_type(&self) -> Option<&Arc<TypeDescriptor>> {
        self.result.ty.as_ref()
    }
}

/// Reserves a stack slot of at least one word at its natural alignment.
fn stack_word(stack_offset: &mut usize, size: usize, align: usize) -> usize {
    let offset = align_up(*stack_offset, align.max(POINTER_SIZE));
    *stack_offset = offset + align_up(size.max(1), POINTER_SIZE);
    offset
}

/// Places a signature for the host architecture.
pub fn resolve_signature(
    result: Option<Arc<TypeDescriptor>>,
    arguments: Vec<Arc<TypeDescriptor>>,
    has_context: bool,
    throws: bool,
) -> Result<CallSignature> {
    CallSignature::new(Abi::host(), result, arguments, has_context, throws)
}
