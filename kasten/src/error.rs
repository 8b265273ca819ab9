use thiserror::Error;

pub type Result<T, E = BoxError> = std::result::Result<T, E>;

/// Everything the runtime can report back to a caller.
///
/// Registration errors are logic errors of the host and are expected at
/// startup only. `TypeMismatch` is the one steady-state outcome callers are
/// supposed to handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BoxError {
    #[error("type `{name}` is already registered with a different layout")]
    DuplicateConflict { name: String },

    #[error("capability `{name}` is already declared with a different slot list")]
    CapabilityRedefinition { name: String },

    #[error(
        "type `{type_name}` does not implement `{capability}`{}",
        missing_suffix(.missing)
    )]
    CapabilityNotImplemented {
        capability: String,
        type_name: String,
        missing: Option<String>,
    },

    #[error("unknown capability id {0}")]
    UnknownCapability(u32),

    #[error("`{owner}` has no method `{method}`")]
    UnknownMethod { owner: String, method: String },

    #[error("invalid layout for `{name}`: {reason}")]
    InvalidLayout { name: String, reason: &'static str },

    #[error("`{name}` is {expected} bytes, got {actual}")]
    SizeMismatch {
        name: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("type mismatch: expected `{expected}`, found `{found}`")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("out of memory allocating {size} bytes (align {align})")]
    OutOfMemory { size: usize, align: usize },

    #[error("slot {slot} out of range for a table with {slots} slots")]
    SlotOutOfRange { slot: usize, slots: usize },
}

fn missing_suffix(missing: &Option<String>) -> String {
    match missing {
        Some(method) => format!(" (missing `{method}`)"),
        None => String::new(),
    }
}
