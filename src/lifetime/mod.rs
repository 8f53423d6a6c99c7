// This module implements the Lifetime Scheduler, the second stage of the pipeline. It makes
// aliasing explicit and then removes the redundant work that doing so introduced. First,
// copy-on-write materialization gives every in-place mutator a private copy of its target
// unless the target has no other reference and is not immutable storage; this repeats until
// a fixed point. Second, copy elision drops every clone whose source has no reads after the
// copy point and whose earlier reads cannot observe a later mutation. Finally, usage
// refinement groups values that share storage through tied mutators and classifies each
// group as constant, transient, variable (global state) or external, retyping the
// resources so the allocation planner knows which storage it owns. The stage only visits
// host functions; the module's initializers must already be combined into one.

//! Lifetime Scheduler.

pub mod cow;
pub mod usage;

pub use cow::{elide_copies, materialize_copy_on_write};
pub(crate) use cow::{is_pinned, observes_later_mutation};
pub use usage::{analyze_usage, refine_usage, StorageGroup, UsageAnalysis};

use crate::core::CompilationSession;
use crate::ir::Module;

/// Materializes copies, elides the redundant ones and refines usage for every host function.
pub fn schedule_lifetimes(module: &mut Module, session: &CompilationSession) {
    for func in module.host_functions_mut() {
        session.set_current_function(&func.name);
        let materialized = materialize_copy_on_write(func, session);
        let elided = elide_copies(func, session);
        refine_usage(func);
        log::debug!("@{}: {materialized} copies materialized, {elided} elided", func.name);
    }
}
