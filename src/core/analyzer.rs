// This module implements the liveness Analyzer used by copy elision and transient packing.
// It numbers the top-level ops of a function in program order ("slots") and records, for
// every value, the slot of its definition, the slot of its last use and its reference
// count. Ops nested in a wave share the slot of the wave that owns them: members of one
// wave execute concurrently, so a value used anywhere in a wave is live for the whole wave
// and two values touched by the same wave are always considered simultaneously live.
// Function arguments are defined at slot 0. The analysis is a single linear scan.

use hashbrown::HashMap;

use crate::ir::{Function, OpId, ValueId};

/// Liveness information for a single value.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LivenessInfo {
    /// Slot defining the value.
    pub first: usize,
    /// Last slot the value is used in.
    pub last: usize,
    /// Number of uses including the definition.
    pub ref_count: u32,
}

impl LivenessInfo {
    /// Half-open `[birth, death)` interval over slots.
    pub fn interval(&self) -> (usize, usize) {
        (self.first, self.last + 1)
    }
}

/// Computes program-order liveness for a function.
#[derive(Debug, Default)]
pub struct Analyzer {
    order: Vec<OpId>,
    slots: HashMap<OpId, usize>,
    liveness: Vec<Option<LivenessInfo>>,
}

impl Analyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Top-level ops in slot order.
    pub fn order(&self) -> &[OpId] {
        &self.order
    }

    /// Slot of an op; wave members report the slot of their wave.
    pub fn slot(&self, op: OpId) -> Option<usize> {
        self.slots.get(&op).copied()
    }

    pub fn liveness(&self, value: ValueId) -> Option<&LivenessInfo> {
        self.liveness.get(value.index()).and_then(Option::as_ref)
    }

    /// Rebuild slots and liveness for `func`.
    pub fn switch_func(&mut self, func: &Function) {
        self.order.clear();
        self.slots.clear();
        self.liveness.clear();
        self.liveness.resize(func.value_count(), None);

        for &arg in &func.args {
            self.record(arg, 0);
        }

        for (slot, &top) in func.body().iter().enumerate() {
            self.order.push(top);
            self.slots.insert(top, slot);
        }
        for op_id in func.walk() {
            let op = func.op(op_id);
            let slot = match op.parent {
                Some(wave) => self.slots[&wave],
                None => self.slots[&op_id],
            };
            if op.parent.is_some() {
                self.slots.insert(op_id, slot);
            }
            for &result in &op.results {
                self.record(result, slot);
            }
            for operand in op.operands() {
                self.record(operand, slot);
            }
        }
    }

    fn record(&mut self, value: ValueId, slot: usize) {
        let info = self.liveness[value.index()].get_or_insert(LivenessInfo { first: slot, last: slot, ref_count: 0 });
        info.ref_count += 1;
        info.first = info.first.min(slot);
        info.last = info.last.max(slot);
    }
}
