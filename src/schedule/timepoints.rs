//! Timepoint propagation.

use hashbrown::HashMap;

use super::Schedule;
use crate::core::CompilationSession;
use crate::ir::{Function, OpId, OpKind};

/// Makes each wave and each host op await the timepoints of the waves it
/// depends on. Awaits already implied by another await are kept.
pub fn propagate_timepoints(func: &mut Function, schedule: &Schedule, session: &CompilationSession) {
    let position: HashMap<OpId, usize> = func.body().iter().enumerate().map(|(i, &op)| (op, i)).collect();

    for op in func.body().to_vec() {
        let dependents: Vec<OpId> = match &func.op(op).kind {
            OpKind::Wave { members, .. } => members.clone(),
            _ => vec![op],
        };
        let mut producers: Vec<OpId> = Vec::new();
        for dependent in dependents {
            for dep in schedule.deps.get(&dependent).into_iter().flatten() {
                if let Some(wave) = func.op(*dep).parent {
                    if wave != op && !producers.contains(&wave) {
                        producers.push(wave);
                    }
                }
            }
        }
        if producers.is_empty() {
            continue;
        }
        producers.sort_by_key(|wave| position[wave]);
        let awaits: Vec<_> = producers.iter().map(|&wave| func.op(wave).result()).collect();
        for _ in &awaits {
            session.record_timepoint_await();
        }
        log::trace!("@{}: {} awaits {} timepoint(s)", func.name, func.op(op).name(), awaits.len());
        func.set_awaits(op, awaits);
    }
}
