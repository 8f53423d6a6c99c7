//! Transient packing.
//!
//! Each transient storage group is live over the union of its members'
//! `[birth, death)` slot intervals. Groups are placed greedily in birth
//! order at the lowest aligned offset that does not overlap any group whose
//! interval overlaps theirs; the arena grows only when nothing fits.

use crate::core::{Analyzer, CompilationSession};
use crate::ir::{Function, IndexExpr, Lifetime, OpId, OpKind, Slice, ValueId};
use crate::lifetime::UsageAnalysis;

use super::constants::align_to;

/// Alignment of every transient inside the arena.
pub const TRANSIENT_ALIGNMENT: u64 = 16;

/// A request for `size` bytes live over `[birth, death)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub size: u64,
    pub birth: usize,
    pub death: usize,
}

impl Interval {
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.birth < other.death && other.birth < self.death
    }
}

/// Packs `requests` into one arena. Returns each request's offset, in input
/// order, and the arena size.
pub fn pack_intervals(requests: &[Interval], alignment: u64) -> (Vec<u64>, u64) {
    let mut order: Vec<usize> = (0..requests.len()).collect();
    order.sort_by_key(|&i| (requests[i].birth, i));

    let mut offsets = vec![0; requests.len()];
    let mut placed: Vec<usize> = Vec::with_capacity(requests.len());
    let mut arena = 0;

    for i in order {
        let request = &requests[i];
        let live: Vec<usize> = placed.iter().copied().filter(|&j| requests[j].overlaps(request)).collect();

        let mut candidates = vec![0];
        candidates.extend(live.iter().map(|&j| align_to(offsets[j] + requests[j].size, alignment)));
        candidates.sort_unstable();

        let fits = |offset: u64| {
            live.iter().all(|&j| {
                let (start, end) = (offsets[j], offsets[j] + requests[j].size);
                offset + request.size <= start || end <= offset || request.size == 0
            })
        };
        // The highest candidate ends past every live block, so one always fits.
        let offset = candidates.into_iter().find(|&c| fits(c)).unwrap_or_default();

        offsets[i] = offset;
        arena = arena.max(align_to(offset + request.size, alignment));
        placed.push(i);
    }
    (offsets, arena)
}

/// Packs the transient storage groups of `func` into a single arena
/// allocation. Groups with dynamic sizes get dedicated allocations.
pub fn pack_transients(func: &mut Function, usage: &UsageAnalysis, session: &CompilationSession) -> Option<OpId> {
    let mut analyzer = Analyzer::new();
    analyzer.switch_func(func);

    let mut roots: Vec<ValueId> = Vec::new();
    let mut requests: Vec<Interval> = Vec::new();
    let mut dedicated: Vec<(ValueId, IndexExpr)> = Vec::new();

    for group in usage.groups().filter(|g| g.lifetime == Lifetime::Transient) {
        let Some(def) = func.def_op(group.root) else {
            continue;
        };
        let Some(size) = func.op(def).kind.result_size().cloned() else {
            log::warn!("@{}: %{} has no known size, leaving it unpacked", func.name, func.value(group.root).name);
            continue;
        };
        let Some(size) = size.constant() else {
            dedicated.push((group.root, size));
            continue;
        };

        let mut span: Option<(usize, usize)> = None;
        for &member in &group.members {
            if let Some(info) = analyzer.liveness(member) {
                let (birth, death) = info.interval();
                span = Some(span.map_or((birth, death), |(b, d)| (b.min(birth), d.max(death))));
            }
        }
        let Some((birth, death)) = span else {
            log::warn!("@{}: lifetime of %{} is unbounded, treating it as external", func.name, func.value(group.root).name);
            continue;
        };
        roots.push(group.root);
        requests.push(Interval { size, birth, death });
    }

    for (root, size) in dedicated {
        log::warn!("@{}: transient %{} has a dynamic size, allocating it separately", func.name, func.value(root).name);
        let def = func.def_op(root).unwrap_or_else(|| panic!("transient %{} has no defining op", func.value(root).name));
        let anchor = func.op(def).parent.unwrap_or(def);
        func.insert_before(
            anchor,
            OpKind::ResourceAlloc {
                size: size.clone(),
                lifetime: Lifetime::Transient,
                slices: vec![Slice { value: root, offset: IndexExpr::ZERO, length: size }],
            },
            "transient_storage",
        );
        session.record_dedicated_allocation();
    }

    if roots.is_empty() {
        return None;
    }

    let (offsets, arena) = pack_intervals(&requests, TRANSIENT_ALIGNMENT);
    let requested: u64 = requests.iter().map(|r| r.size).sum();
    session.record_transient_arena(requested, arena);
    log::debug!("@{}: packed {requested} transient bytes into a {arena} byte arena", func.name);

    let slices = roots
        .iter()
        .zip(&offsets)
        .zip(&requests)
        .map(|((&value, &offset), request)| {
            log::trace!("@{}: %{} at [{offset}, {})", func.name, func.value(value).name, offset + request.size);
            Slice { value, offset: IndexExpr::Const(offset), length: IndexExpr::Const(request.size) }
        })
        .collect();
    let alloc = func.create_op(
        OpKind::ResourceAlloc { size: IndexExpr::Const(arena), lifetime: Lifetime::Transient, slices },
        "transients",
    );
    let leading_constants = func
        .body()
        .iter()
        .take_while(|&&op| matches!(func.op(op).kind, OpKind::ResourceConstants { .. }))
        .count();
    let mut body = func.body().to_vec();
    body.insert(leading_constants, alloc);
    func.set_body(body);
    Some(alloc)
}
