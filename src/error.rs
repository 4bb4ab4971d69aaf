//! Error types for the exposition layer.

use sqrew_vm::{CompileError, VmError};
use thiserror::Error;

use crate::marshal::ConversionError;

/// Result type for host-side exposition and context operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported to the host while binding types or driving a context.
///
/// Script-side failures raised inside trampolines never surface here; they
/// travel through the VM's own error channel as a [`VmError`].
#[derive(Debug, Error)]
pub enum Error {
    /// The context was used before [`Context::initialize`](crate::Context::initialize).
    #[error("context is not initialized")]
    NotInitialized,

    /// The VM is already borrowed, e.g. from inside a running script call.
    #[error("context is busy executing a script")]
    ContextBusy,

    #[error("class '{class}' already has a constructor")]
    ConstructorAlreadySet { class: String },

    /// Another value already occupies the fully-qualified class name.
    #[error("'{name}' is already defined")]
    ClassAlreadyExists { name: String },

    /// The class name, or its last path component, is empty.
    #[error("invalid class name '{name}'")]
    InvalidClassName { name: String },

    /// The native type was already exposed under another name.
    #[error("native type of '{name}' is already exposed")]
    TypeAlreadyExposed { name: String },

    /// A path component exists but is not a table.
    #[error("cannot create '{path}': '{component}' is not a table")]
    PathConflict { path: String, component: String },

    /// Operation on a table handle that did not resolve.
    #[error("invalid table")]
    InvalidTable,

    #[error("slot '{0}' does not exist")]
    MissingSlot(String),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error("script error: {0}")]
    Vm(#[from] VmError),

    #[error("compile error: {0}")]
    Compile(#[from] CompileError),
}
