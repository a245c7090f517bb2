use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Layout error in {type_name}: {reason}")]
    Layout { type_name: String, reason: String },

    #[error("Invalid buffer: {actual} bytes supplied but {required} are required")]
    InvalidBuffer { required: usize, actual: usize },

    #[error("Unsupported signature: {0}")]
    UnsupportedSignature(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Swift error thrown: {0:#x}")]
    Thrown(usize),

    #[error("Swift runtime unavailable: {0}")]
    Runtime(String),

    #[error("Invalid image: {0}")]
    Image(String),

    #[error("Memory access failed: {0}")]
    Memory(#[from] MemoryError),
}

impl BridgeError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn layout(type_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Layout {
            type_name: type_name.into(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Access violation at {0:#x}")]
    AccessViolation(usize),
    #[error("Write to read-only image at {0:#x}")]
    ReadOnly(usize),
    #[error("Out of memory allocating {0} bytes")]
    OutOfMemory(usize),
    #[error("Invalid string at {0:#x}")]
    InvalidString(usize),
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
