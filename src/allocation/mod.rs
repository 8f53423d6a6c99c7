// This module implements the Allocation Planner, the last stage of the pipeline. It assigns
// physical storage to every resource the program owns without changing what any op does.
// Constant resources with static sizes are concatenated into a single resource.constants
// upload buffer at a fixed alignment. Transient storage groups are packed into one
// resource.alloc arena by greedy first-fit interval packing over program-order liveness, so
// groups whose lifetimes do not overlap reuse the same bytes; groups with dynamic sizes get
// dedicated allocations. External and variable storage stays where it is. Finally, the byte
// range every op touches is rebased onto the storage backing its resource and recorded on
// the op, so later consumers never re-derive offsets.

//! Allocation Planner.

pub mod constants;
pub mod layout;
pub mod transients;

pub use constants::{pack_constants, CONSTANT_ALIGNMENT};
pub use layout::{resolve_ranges, Placements};
pub use transients::{pack_intervals, pack_transients, Interval, TRANSIENT_ALIGNMENT};

use crate::core::CompilationSession;
use crate::ir::Module;
use crate::lifetime::analyze_usage;

/// Packs constants and transients and resolves ranges in every host function.
pub fn allocate_storage(module: &mut Module, session: &CompilationSession) {
    for func in module.host_functions_mut() {
        session.set_current_function(&func.name);
        let usage = analyze_usage(func);
        pack_constants(func, session);
        pack_transients(func, &usage, session);
        resolve_ranges(func, &usage);
    }
}
