// This module gathers the infrastructure shared by every stage of the stream compiler:
// the error types, the read-only pipeline options, the arena-backed compilation session
// with its statistics and encoder diagnostics, and the program-order liveness analyzer.
// None of it knows about a particular stage; stages borrow the session and options and
// build their own analyses on top of the analyzer.

//! Shared compiler infrastructure.

pub mod analyzer;
pub mod error;
pub mod options;
pub mod session;

pub use analyzer::{Analyzer, LivenessInfo};
pub use error::{CompileError, CompileResult, EncodeError};
pub use options::{PipelineOptions, StatisticsFormat};
pub use session::{CompilationSession, Diagnostic, SessionStats};
