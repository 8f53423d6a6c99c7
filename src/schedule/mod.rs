// This module implements the Concurrency Scheduler, the third stage of the pipeline. It
// partitions the async ops of each host function into waves of mutually independent ops and
// then threads timepoints through the result. Dependencies are computed once over the
// unscheduled program order: an op depends on the producers of every value it reads and, if
// it mutates a resource in place, on every earlier reader of that resource, so a reader is
// never overtaken by a write to the storage it reads. Wave formation is a greedy level
// assignment over this graph with a storage conflict check; host ops stay in program order
// and are placed between the waves they depend on and the waves that depend on them. The
// timepoint pass then makes every wave and every host consumer await the waves producing
// what it uses. Iteration always follows the body order, so schedules are reproducible.

//! Concurrency Scheduler.

pub mod timepoints;
pub mod waves;

pub use timepoints::propagate_timepoints;
pub use waves::{form_waves, Schedule};

use hashbrown::HashMap;

use crate::core::CompilationSession;
use crate::ir::{Function, Module, OpId};
use crate::lifetime::analyze_usage;

/// Ops each op must run after, in program order.
pub fn dependencies(func: &Function) -> HashMap<OpId, Vec<OpId>> {
    let order = func.walk();
    let position: HashMap<OpId, usize> = order.iter().enumerate().map(|(i, &op)| (op, i)).collect();
    let mut deps = HashMap::with_capacity(order.len());

    for &op in &order {
        let mut before: Vec<OpId> = Vec::new();
        for value in func.op(op).kind.operands() {
            if let Some(def) = func.def_op(value) {
                if def != op && !before.contains(&def) {
                    before.push(def);
                }
            }
        }
        // Write-after-read on the mutated storage.
        if let Some(target) = func.op(op).kind.tied_target() {
            for &reader in func.uses(target) {
                if reader != op && position[&reader] < position[&op] && !before.contains(&reader) {
                    before.push(reader);
                }
            }
        }
        before.sort_by_key(|dep| position[dep]);
        deps.insert(op, before);
    }
    deps
}

/// Forms waves and propagates timepoints in every host function.
pub fn schedule_concurrency(module: &mut Module, session: &CompilationSession) {
    for func in module.host_functions_mut() {
        session.set_current_function(&func.name);
        let usage = analyze_usage(func);
        let schedule = form_waves(func, &usage, session);
        propagate_timepoints(func, &schedule, session);
        log::debug!("@{}: scheduled into {} wave(s)", func.name, schedule.waves.len());
    }
}
