//! streamc - resource lowering for tensor programs.
//!
//! streamc takes a program of abstract tensor operations and lowers it in
//! four stages into explicitly scheduled, allocated byte-buffer operations.
//!
//! ```ignore
//! use bumpalo::Bump;
//! use streamc::core::{CompilationSession, PipelineOptions};
//! use streamc::ir::Module;
//! use streamc::pipeline::Pipeline;
//!
//! let mut module = Module::parse(&text)?;
//! let arena = Bump::new();
//! let session = CompilationSession::new(&arena);
//! Pipeline::new(PipelineOptions::default()).run(&mut module, &session)?;
//! println!("{module}");
//! ```
//!
//! # Architecture
//!
//! - [`ir`] - Stream IR: arena functions, ops, text parser and printer
//! - [`encode`] - Tensor Encoder (tensor ops to byte-buffer ops)
//! - [`lifetime`] - Lifetime Scheduler (copy-on-write and storage lifetimes)
//! - [`schedule`] - Concurrency Scheduler (waves and timepoints)
//! - [`allocation`] - Allocation Planner (constant upload, transient arena, ranges)
//! - [`verify`] - Structural checks between stages
//! - [`pipeline`] - Stage driver
//! - [`core`] - Shared infrastructure (session, options, errors, liveness)

pub mod allocation;
pub mod core;
pub mod encode;
pub mod ir;
pub mod lifetime;
pub mod pipeline;
pub mod schedule;
pub mod verify;

pub use core::{CompilationSession, CompileError, CompileResult, PipelineOptions, SessionStats};
pub use ir::Module;
pub use pipeline::{Pipeline, Stage};
