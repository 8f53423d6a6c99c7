//! Slice layout and subview propagation.
//!
//! Every byte range an op touches is rebased from its resource onto the
//! physical storage backing that resource and recorded on the op itself.

use hashbrown::HashMap;

use crate::encode::layout::element_byte_size;
use crate::ir::{Function, IndexExpr, OpId, OpKind, ResolvedRange, ValueId};
use crate::lifetime::UsageAnalysis;

/// Base storage and offset of every placed storage root.
#[derive(Debug, Default)]
pub struct Placements(HashMap<ValueId, (ValueId, IndexExpr)>);

impl Placements {
    /// Collects the slices of every allocation op in `func`.
    pub fn collect(func: &Function) -> Self {
        let mut placements = HashMap::new();
        for &op in func.body() {
            let slices = match &func.op(op).kind {
                OpKind::ResourceAlloc { slices, .. } | OpKind::ResourceConstants { slices, .. } => slices,
                _ => continue,
            };
            let storage = func.op(op).result();
            for slice in slices {
                placements.insert(slice.value, (storage, slice.offset.clone()));
            }
        }
        Self(placements)
    }

    pub fn get(&self, root: ValueId) -> Option<&(ValueId, IndexExpr)> {
        self.0.get(&root)
    }

    pub fn contains(&self, root: ValueId) -> bool {
        self.0.contains_key(&root)
    }
}

/// Ranges an op touches, relative to the start of each resource.
fn local_ranges(func: &Function, op: OpId) -> Vec<(ValueId, IndexExpr, IndexExpr)> {
    use OpKind::*;
    let op = func.op(op);
    let zero = IndexExpr::ZERO;
    match &op.kind {
        AsyncConstant { size, .. } | AsyncSplat { size, .. } | BuiltinSplatI64 { size, .. } | ResourceImport { size, .. } => {
            vec![(op.result(), zero, size.clone())]
        }
        AsyncClone { source, source_size, result_size } => {
            vec![(*source, zero.clone(), source_size.clone()), (op.result(), zero, result_size.clone())]
        }
        AsyncSlice { source, offset, end, length, .. } => {
            vec![(*source, offset.clone(), end.clone()), (op.result(), zero, length.clone())]
        }
        AsyncFill { target, offset, end, .. } | BuiltinFillI64 { target, offset, end, .. } => {
            vec![(*target, offset.clone(), end.clone())]
        }
        AsyncUpdate { target, offset, end, update, update_size, .. } => {
            vec![(*target, offset.clone(), end.clone()), (*update, zero, update_size.clone())]
        }
        AsyncStore { target, offset, value, .. } => {
            let end = IndexExpr::add(offset.clone(), IndexExpr::Const(element_byte_size(value.ty())));
            vec![(*target, offset.clone(), end)]
        }
        AsyncLoad { source, offset, ty, .. } => {
            let end = IndexExpr::add(offset.clone(), IndexExpr::Const(element_byte_size(*ty)));
            vec![(*source, offset.clone(), end)]
        }
        AsyncDispatch { operands, operand_sizes, result_size, .. } => {
            let mut ranges: Vec<_> =
                operands.iter().zip(operand_sizes).map(|(&v, size)| (v, zero.clone(), size.clone())).collect();
            ranges.push((op.result(), zero, result_size.clone()));
            ranges
        }
        ResourceExport { source, size } => vec![(*source, zero, size.clone())],
        _ => Vec::new(),
    }
}

/// Records resolved ranges on every op that touches resource bytes.
pub fn resolve_ranges(func: &mut Function, usage: &UsageAnalysis) {
    let placements = Placements::collect(func);
    for op in func.walk() {
        let ranges: Vec<ResolvedRange> = local_ranges(func, op)
            .into_iter()
            .map(|(resource, offset, end)| {
                let root = usage.storage_root(resource);
                let (storage, base) = placements.get(root).cloned().unwrap_or((root, IndexExpr::ZERO));
                ResolvedRange {
                    resource,
                    storage,
                    offset: IndexExpr::add(base.clone(), offset),
                    end: IndexExpr::add(base, end),
                }
            })
            .collect();
        if ranges.is_empty() {
            continue;
        }
        log::trace!("@{}: {} touches {} range(s)", func.name, func.op(op).name(), ranges.len());
        func.set_ranges(op, ranges);
    }
}
