//! Error types for the sandboxed matcher.

use std::fmt;

use thiserror::Error;

/// Main error type for the sandboxed matcher.
#[derive(Error, Debug)]
pub enum IgnoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to compile sandbox module: {0}")]
    ModuleCompile(String),

    #[error("Failed to instantiate sandbox module: {0}")]
    Instantiate(String),

    /// The boundary call itself failed. The instance is tainted.
    #[error("{call} call failed: {message}")]
    Transport { call: &'static str, message: String },

    #[error("matcher handle is not valid on this instance")]
    InvalidHandle,

    #[error("argument has a null pointer or negative length")]
    InvalidArgument,

    #[error("text is not valid UTF-8")]
    PathEncoding,

    #[error("matcher handle not found (may have been destroyed)")]
    HandleNotFound,

    #[error("failed to compile patterns")]
    CompileFailed,

    #[error("sandbox allocation of {size} bytes failed")]
    AllocationFailed { size: usize },

    #[error("memory access out of range (ptr={ptr}, len={len}, mem={memory})")]
    OutOfRange { ptr: u32, len: u32, memory: usize },

    #[error("batch_filter: null result descriptor pointer (internal error)")]
    NullResultDescriptor,

    #[error("batch_filter reported {count} kept paths but result buffer is empty")]
    EmptyResult { count: i32 },

    #[error("{call} returned unexpected code: {code}")]
    UnexpectedCode { call: &'static str, code: i32 },

    #[error("parallel filter worker panicked")]
    WorkerPanicked,

    #[error("{}", format_workers(.0))]
    Parallel(Vec<WorkerError>),
}

impl IgnoreError {
    /// Whether this error came from a failed boundary call.
    pub fn is_transport(&self) -> bool {
        matches!(self, IgnoreError::Transport { .. })
    }
}

/// Failure of one parallel filter worker.
#[derive(Debug)]
pub struct WorkerError {
    /// Index of the chunk the worker was processing.
    pub worker: usize,
    pub error: IgnoreError,
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker {}: {}", self.worker, self.error)
    }
}

fn format_workers(errors: &[WorkerError]) -> String {
    let joined = errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    format!("parallel filter failed in {} worker(s): {}", errors.len(), joined)
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// A fault raised inside a sandbox instance while servicing a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trap {
    message: String,
}

impl Trap {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trap: {}", self.message)
    }
}

impl std::error::Error for Trap {}

pub type Result<T> = std::result::Result<T, IgnoreError>;
