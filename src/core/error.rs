// This module defines the error types of the stream compiler using the thiserror crate.
// CompileError covers everything that aborts a pipeline run: malformed input text,
// references to undeclared values or globals, a stage that leaves ops it was supposed to
// lower, invalid options and file I/O. EncodeError is the narrower, per-op failure of the
// tensor encoder; an op that fails to encode is skipped and reported as a diagnostic rather
// than aborting the encoder, and only the post-encoding verifier turns leftover tensor ops
// into a hard CompileError. Structural invariant violations that can only come from a bug
// in a pass (a load that does not truncate, an index vector of the wrong rank) are
// assertions, not errors.

//! Error types for the stream compiler.

use thiserror::Error;

/// Main error type of a pipeline run.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("Parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("Unknown value: %{name}")]
    UnknownValue { name: String },

    #[error("Unknown global: @{name}")]
    UnknownGlobal { name: String },

    #[error("{stage}: {} op(s) were not lowered: {}", ops.len(), ops.join(", "))]
    Unlowered { stage: &'static str, ops: Vec<String> },

    #[error("Verification failed in @{function}: {reason}")]
    Verify { function: String, reason: String },

    #[error("Invalid option: {reason}")]
    InvalidOption { reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Why a single op could not be encoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("unsupported tensor encoding {encoding}")]
    UnsupportedEncoding { encoding: String },

    #[error("unsupported fill pattern width {width} (not a multiple of 8)")]
    UnsupportedPatternWidth { width: u32 },

    #[error("{op} is not handled")]
    NotHandled { op: &'static str },
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;
