//! Greedy wave formation.
//!
//! Every async op gets the earliest level after all of its dependencies and
//! after every level holding an op that writes the storage it touches or
//! reads the storage it writes. Such conflicting ops become extra
//! dependencies, so the timepoints order them too. Host ops are not wave
//! members: each one is placed
//! after the last wave it depends on, and host ops never reorder among
//! themselves. The function terminator always closes the schedule.

use hashbrown::HashMap;

use super::dependencies;
use crate::core::CompilationSession;
use crate::ir::{Function, OpId, OpKind, ValueId};
use crate::lifetime::UsageAnalysis;

/// Result of wave formation.
#[derive(Debug, Default)]
pub struct Schedule {
    /// Wave ops in execution order.
    pub waves: Vec<OpId>,
    /// Dependencies computed over the unscheduled program order, plus the
    /// storage conflicts found while forming waves.
    pub deps: HashMap<OpId, Vec<OpId>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

/// Storage touched by the ops placed in one level.
#[derive(Debug, Default)]
struct LevelAccess(HashMap<ValueId, Vec<(OpId, Access)>>);

impl LevelAccess {
    /// Ops of this level that must run before an op with these accesses.
    fn conflicts(&self, reads: &[ValueId], writes: &[ValueId]) -> Vec<OpId> {
        let mut ops = Vec::new();
        let touching = writes.iter().flat_map(|root| self.0.get(root)).flatten();
        let writing = reads.iter().flat_map(|root| self.0.get(root)).flatten().filter(|(_, a)| *a == Access::Write);
        for &(op, _) in touching.chain(writing) {
            if !ops.contains(&op) {
                ops.push(op);
            }
        }
        ops
    }

    fn record(&mut self, op: OpId, reads: &[ValueId], writes: &[ValueId]) {
        for &root in reads {
            self.0.entry(root).or_default().push((op, Access::Read));
        }
        for &root in writes {
            self.0.entry(root).or_default().push((op, Access::Write));
        }
    }
}

fn accesses(func: &Function, usage: &UsageAnalysis, op: OpId) -> (Vec<ValueId>, Vec<ValueId>) {
    let kind = &func.op(op).kind;
    let reads = kind.resource_reads().into_iter().map(|v| usage.storage_root(v)).collect();
    let writes = kind.tied_target().map(|v| usage.storage_root(v)).into_iter().collect();
    (reads, writes)
}

/// Groups the async ops of `func` into waves and reorders its body.
pub fn form_waves(func: &mut Function, usage: &UsageAnalysis, session: &CompilationSession) -> Schedule {
    let mut deps = dependencies(func);
    let order: Vec<OpId> = func.body().to_vec();

    // Async ops map to their level, host ops to the level they follow.
    let mut ready: HashMap<OpId, u32> = HashMap::with_capacity(order.len());
    let mut levels: Vec<LevelAccess> = vec![LevelAccess::default()];
    let mut last_host = 0;

    for &op in &order {
        let after = deps[&op].iter().map(|dep| ready[dep]).max().unwrap_or(0);
        if func.op(op).kind.is_async() {
            let (reads, writes) = accesses(func, usage, op);
            let mut level = after + 1;
            let mut conflicting = Vec::new();
            for (index, placed) in levels.iter().enumerate() {
                let ops = placed.conflicts(&reads, &writes);
                if !ops.is_empty() {
                    log::trace!("@{}: {} conflicts in wave {index}", func.name, func.op(op).name());
                    level = level.max(index as u32 + 1);
                    conflicting.extend(ops);
                }
            }
            if levels.len() <= level as usize {
                levels.resize_with(level as usize + 1, LevelAccess::default);
            }
            levels[level as usize].record(op, &reads, &writes);
            ready.insert(op, level);
            let before = deps.entry(op).or_default();
            for dep in conflicting {
                if !before.contains(&dep) {
                    before.push(dep);
                }
            }
        } else {
            last_host = last_host.max(after);
            ready.insert(op, last_host);
        }
    }

    let max_level = levels.len() as u32 - 1;
    let mut members: Vec<Vec<OpId>> = vec![Vec::new(); max_level as usize + 1];
    let mut hosts: Vec<Vec<OpId>> = vec![Vec::new(); max_level as usize + 1];
    for &op in &order {
        if func.op(op).kind.is_async() {
            members[ready[&op] as usize].push(op);
        } else if matches!(func.op(op).kind, OpKind::Return { .. }) {
            hosts[max_level as usize].push(op);
        } else {
            hosts[ready[&op] as usize].push(op);
        }
    }

    let mut body = std::mem::take(&mut hosts[0]);
    let mut waves = Vec::new();
    for level in 1..=max_level as usize {
        if !members[level].is_empty() {
            let index = waves.len() as u32 + 1;
            let wave = func.create_op(OpKind::Wave { index, members: Vec::new() }, &format!("t{index}"));
            let wave_members = std::mem::take(&mut members[level]);
            for &member in &wave_members {
                log::trace!("@{}: {} -> wave {index}", func.name, func.op(member).name());
            }
            session.record_wave(wave_members.len());
            func.set_wave_members(wave, wave_members);
            body.push(wave);
            waves.push(wave);
        }
        body.append(&mut hosts[level]);
    }
    func.set_body(body);

    Schedule { waves, deps }
}
