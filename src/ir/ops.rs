//! Operation kinds of the stream IR.
//!
//! The op set is closed: every stage dispatches over [`OpKind`] with a single
//! `match` instead of pattern objects. Ops are grouped into four families:
//!
//! - `tensor.*` ops over logically-shaped resources (input of the encoder),
//! - `resource.*`/`async.*`/`builtin.*` byte-level ops (output of the encoder),
//! - host and device glue (`global.*`, `return`, `binding.*`, `dispatch.*`, `arith.*`),
//! - `wave`, which owns a set of concurrently executable async ops.

use super::expr::{IndexExpr, ScalarExpr};
use super::types::{ElementType, Lifetime, TensorType};
use super::{OpId, ValueId};

/// Logical tensor type plus the runtime values of its dynamic dims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDesc {
    pub ty: TensorType,
    /// One entry per dynamic dim of `ty`, in declaration order.
    pub dims: Vec<IndexExpr>,
}

impl TensorDesc {
    pub fn new(ty: TensorType, dims: Vec<IndexExpr>) -> Self {
        Self { ty, dims }
    }

    pub fn fixed(ty: TensorType) -> Self {
        Self { ty, dims: Vec::new() }
    }
}

/// Element payload of a constant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Elements {
    Splat(u64),
    Dense(Vec<u64>),
}

/// Constant contents: raw element bits of a single element type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantData {
    pub element: ElementType,
    pub elements: Elements,
}

impl ConstantData {
    /// Maps every element through `f`, keeping splats splat.
    pub fn map(&self, element: ElementType, f: impl Fn(u64) -> u64) -> Self {
        let elements = match &self.elements {
            Elements::Splat(v) => Elements::Splat(f(*v)),
            Elements::Dense(values) => Elements::Dense(values.iter().map(|&v| f(v)).collect()),
        };
        Self { element, elements }
    }

    /// Serializes `count` elements little-endian at `byte_size` bytes each.
    pub fn to_bytes(&self, count: u64, byte_size: u64) -> Vec<u8> {
        let mut bytes = Vec::with_capacity((count * byte_size) as usize);
        for i in 0..count {
            let v = match &self.elements {
                Elements::Splat(v) => *v,
                Elements::Dense(values) => values.get(i as usize).copied().unwrap_or_default(),
            };
            bytes.extend_from_slice(&v.to_le_bytes()[..byte_size as usize]);
        }
        bytes
    }
}

/// A sub-region of a base allocation assigned to a resource value.
///
/// The slice value is usually defined after the allocation op, so slices are
/// kept out of the use index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slice {
    pub value: ValueId,
    pub offset: IndexExpr,
    pub length: IndexExpr,
}

/// Byte range an op touches on behalf of one of its resources, resolved
/// against the physical storage backing that resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRange {
    pub resource: ValueId,
    pub storage: ValueId,
    pub offset: IndexExpr,
    pub end: IndexExpr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpKind {
    // tensor.*
    TensorImport { source: ValueId, result: TensorDesc },
    TensorExport { source: ValueId, source_desc: TensorDesc, source_size: IndexExpr },
    TensorSizeOf { desc: TensorDesc },
    TensorConstant { result: TensorDesc, value: ConstantData },
    TensorSplat { result: TensorDesc, result_size: IndexExpr, value: ScalarExpr },
    TensorClone {
        source: ValueId,
        source_desc: TensorDesc,
        source_size: IndexExpr,
        result: TensorDesc,
        result_size: IndexExpr,
    },
    TensorSlice {
        source: ValueId,
        source_desc: TensorDesc,
        source_size: IndexExpr,
        start: Vec<IndexExpr>,
        lengths: Vec<IndexExpr>,
        result: TensorDesc,
        result_size: IndexExpr,
    },
    TensorFill {
        target: ValueId,
        target_desc: TensorDesc,
        target_size: IndexExpr,
        start: Vec<IndexExpr>,
        lengths: Vec<IndexExpr>,
        value: ScalarExpr,
    },
    TensorUpdate {
        target: ValueId,
        target_desc: TensorDesc,
        target_size: IndexExpr,
        start: Vec<IndexExpr>,
        update: ValueId,
        update_desc: TensorDesc,
        update_size: IndexExpr,
    },
    TensorLoad { source: ValueId, source_desc: TensorDesc, source_size: IndexExpr, indices: Vec<IndexExpr> },
    TensorStore {
        target: ValueId,
        target_desc: TensorDesc,
        target_size: IndexExpr,
        indices: Vec<IndexExpr>,
        value: ScalarExpr,
    },
    TensorDispatch {
        entry: String,
        operands: Vec<ValueId>,
        operand_descs: Vec<TensorDesc>,
        operand_sizes: Vec<IndexExpr>,
        result: TensorDesc,
        result_size: IndexExpr,
    },

    // resource.* / async.* / builtin.*
    ResourceImport { source: ValueId, size: IndexExpr },
    ResourceExport { source: ValueId, size: IndexExpr },
    AsyncConstant { value: ConstantData, size: IndexExpr },
    AsyncSplat { pattern: ScalarExpr, size: IndexExpr },
    BuiltinSplatI64 { pattern: ScalarExpr, size: IndexExpr },
    AsyncClone { source: ValueId, source_size: IndexExpr, result_size: IndexExpr },
    AsyncSlice { source: ValueId, source_size: IndexExpr, offset: IndexExpr, end: IndexExpr, length: IndexExpr },
    AsyncFill {
        target: ValueId,
        target_size: IndexExpr,
        offset: IndexExpr,
        end: IndexExpr,
        length: IndexExpr,
        pattern: ScalarExpr,
    },
    BuiltinFillI64 {
        target: ValueId,
        target_size: IndexExpr,
        offset: IndexExpr,
        end: IndexExpr,
        length: IndexExpr,
        pattern: ScalarExpr,
    },
    AsyncUpdate {
        target: ValueId,
        target_size: IndexExpr,
        offset: IndexExpr,
        end: IndexExpr,
        update: ValueId,
        update_size: IndexExpr,
    },
    AsyncLoad { source: ValueId, source_size: IndexExpr, offset: IndexExpr, ty: ElementType },
    AsyncStore { target: ValueId, target_size: IndexExpr, offset: IndexExpr, value: ScalarExpr },
    AsyncDispatch {
        entry: String,
        operands: Vec<ValueId>,
        operand_sizes: Vec<IndexExpr>,
        result_size: IndexExpr,
        /// Operand index to binding slot; empty until bindings are fused.
        bindings: Vec<u32>,
    },
    ResourceAlloc { size: IndexExpr, lifetime: Lifetime, slices: Vec<Slice> },
    ResourceConstants { data: Vec<u8>, slices: Vec<Slice> },

    // host glue
    GlobalLoad { global: String },
    GlobalStore { global: String, value: ValueId },
    Return { values: Vec<ValueId> },

    // device glue
    BindingSubspan { binding: ValueId, offset: IndexExpr, ty: TensorType },
    DispatchLoad { source: ValueId },
    DispatchStore { value: ValueId, target: ValueId },
    DispatchCompute { name: String, inputs: Vec<ValueId>, ty: TensorType },
    TruncI { source: ValueId, to: ElementType },
    ExtUI { source: ValueId, to: ElementType },

    // scheduling
    Wave { index: u32, members: Vec<OpId> },
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        use OpKind::*;
        match self {
            TensorImport { .. } => "tensor.import",
            TensorExport { .. } => "tensor.export",
            TensorSizeOf { .. } => "tensor.sizeof",
            TensorConstant { .. } => "tensor.constant",
            TensorSplat { .. } => "tensor.splat",
            TensorClone { .. } => "tensor.clone",
            TensorSlice { .. } => "tensor.slice",
            TensorFill { .. } => "tensor.fill",
            TensorUpdate { .. } => "tensor.update",
            TensorLoad { .. } => "tensor.load",
            TensorStore { .. } => "tensor.store",
            TensorDispatch { .. } => "tensor.dispatch",
            ResourceImport { .. } => "resource.import",
            ResourceExport { .. } => "resource.export",
            AsyncConstant { .. } => "async.constant",
            AsyncSplat { .. } => "async.splat",
            BuiltinSplatI64 { .. } => "builtin.splat_i64",
            AsyncClone { .. } => "async.clone",
            AsyncSlice { .. } => "async.slice",
            AsyncFill { .. } => "async.fill",
            BuiltinFillI64 { .. } => "builtin.fill_i64",
            AsyncUpdate { .. } => "async.update",
            AsyncLoad { .. } => "async.load",
            AsyncStore { .. } => "async.store",
            AsyncDispatch { .. } => "async.dispatch",
            ResourceAlloc { .. } => "resource.alloc",
            ResourceConstants { .. } => "resource.constants",
            GlobalLoad { .. } => "global.load",
            GlobalStore { .. } => "global.store",
            Return { .. } => "return",
            BindingSubspan { .. } => "binding.subspan",
            DispatchLoad { .. } => "dispatch.load",
            DispatchStore { .. } => "dispatch.store",
            DispatchCompute { .. } => "dispatch.compute",
            TruncI { .. } => "arith.trunci",
            ExtUI { .. } => "arith.extui",
            Wave { .. } => "wave",
        }
    }

    /// Logical tensor ops that the encoder must rewrite.
    pub fn is_tensor_op(&self) -> bool {
        self.name().starts_with("tensor.")
    }

    /// Byte-level ops executed by the asynchronous engine and scheduled into waves.
    pub fn is_async(&self) -> bool {
        use OpKind::*;
        matches!(
            self,
            AsyncConstant { .. }
                | AsyncSplat { .. }
                | BuiltinSplatI64 { .. }
                | AsyncClone { .. }
                | AsyncSlice { .. }
                | AsyncFill { .. }
                | BuiltinFillI64 { .. }
                | AsyncUpdate { .. }
                | AsyncStore { .. }
                | AsyncDispatch { .. }
        )
    }

    /// Target resource mutated in place; the op's result is tied to it.
    pub fn tied_target(&self) -> Option<ValueId> {
        use OpKind::*;
        match self {
            TensorFill { target, .. }
            | TensorUpdate { target, .. }
            | TensorStore { target, .. }
            | AsyncFill { target, .. }
            | BuiltinFillI64 { target, .. }
            | AsyncUpdate { target, .. }
            | AsyncStore { target, .. } => Some(*target),
            _ => None,
        }
    }

    /// Replaces the tied target operand.
    pub fn set_tied_target(&mut self, value: ValueId) {
        use OpKind::*;
        match self {
            TensorFill { target, .. }
            | TensorUpdate { target, .. }
            | TensorStore { target, .. }
            | AsyncFill { target, .. }
            | BuiltinFillI64 { target, .. }
            | AsyncUpdate { target, .. }
            | AsyncStore { target, .. } => *target = value,
            other => panic!("{} has no tied target", other.name()),
        }
    }

    /// Byte size of the resource this op produces, if it produces one.
    pub fn result_size(&self) -> Option<&IndexExpr> {
        use OpKind::*;
        match self {
            TensorSplat { result_size, .. }
            | TensorClone { result_size, .. }
            | TensorSlice { result_size, .. }
            | TensorDispatch { result_size, .. }
            | AsyncClone { result_size, .. }
            | AsyncDispatch { result_size, .. } => Some(result_size),
            TensorFill { target_size, .. }
            | TensorUpdate { target_size, .. }
            | TensorStore { target_size, .. }
            | AsyncFill { target_size, .. }
            | BuiltinFillI64 { target_size, .. }
            | AsyncUpdate { target_size, .. }
            | AsyncStore { target_size, .. } => Some(target_size),
            AsyncConstant { size, .. }
            | AsyncSplat { size, .. }
            | BuiltinSplatI64 { size, .. }
            | ResourceImport { size, .. }
            | ResourceAlloc { size, .. } => Some(size),
            AsyncSlice { length, .. } => Some(length),
            _ => None,
        }
    }

    /// Visits every direct value operand (not values nested in expressions).
    pub fn for_each_value_mut(&mut self, f: &mut dyn FnMut(&mut ValueId)) {
        use OpKind::*;
        match self {
            TensorImport { source, .. }
            | TensorExport { source, .. }
            | TensorClone { source, .. }
            | TensorSlice { source, .. }
            | TensorLoad { source, .. }
            | ResourceImport { source, .. }
            | ResourceExport { source, .. }
            | AsyncClone { source, .. }
            | AsyncSlice { source, .. }
            | AsyncLoad { source, .. }
            | DispatchLoad { source }
            | TruncI { source, .. }
            | ExtUI { source, .. } => f(source),
            TensorFill { target, .. }
            | TensorStore { target, .. }
            | AsyncFill { target, .. }
            | BuiltinFillI64 { target, .. }
            | AsyncStore { target, .. } => f(target),
            TensorUpdate { target, update, .. } | AsyncUpdate { target, update, .. } => {
                f(target);
                f(update);
            }
            TensorDispatch { operands, .. } | AsyncDispatch { operands, .. } => operands.iter_mut().for_each(f),
            GlobalStore { value, .. } => f(value),
            Return { values } => values.iter_mut().for_each(f),
            BindingSubspan { binding, .. } => f(binding),
            DispatchStore { value, target } => {
                f(value);
                f(target);
            }
            DispatchCompute { inputs, .. } => inputs.iter_mut().for_each(f),
            // Slices name the values placed in the allocation; they are
            // placement annotations, not reads.
            TensorSizeOf { .. }
            | ResourceAlloc { .. }
            | ResourceConstants { .. }
            | TensorConstant { .. }
            | TensorSplat { .. }
            | AsyncConstant { .. }
            | AsyncSplat { .. }
            | BuiltinSplatI64 { .. }
            | GlobalLoad { .. }
            | Wave { .. } => {}
        }
    }

    /// Visits every index expression carried by the op.
    pub fn for_each_index_mut(&mut self, f: &mut dyn FnMut(&mut IndexExpr)) {
        use OpKind::*;
        fn desc(d: &mut TensorDesc, f: &mut dyn FnMut(&mut IndexExpr)) {
            for e in &mut d.dims {
                f(e);
            }
        }
        match self {
            TensorImport { result, .. } => desc(result, &mut *f),
            TensorExport { source_desc, source_size, .. } => {
                desc(source_desc, &mut *f);
                f(source_size);
            }
            TensorSizeOf { desc: d } => desc(d, &mut *f),
            TensorConstant { result, .. } => desc(result, &mut *f),
            TensorSplat { result, result_size, .. } => {
                desc(result, &mut *f);
                f(result_size);
            }
            TensorClone { source_desc, source_size, result, result_size, .. } => {
                desc(source_desc, &mut *f);
                f(source_size);
                desc(result, &mut *f);
                f(result_size);
            }
            TensorSlice { source_desc, source_size, start, lengths, result, result_size, .. } => {
                desc(source_desc, &mut *f);
                f(source_size);
                start.iter_mut().for_each(&mut *f);
                lengths.iter_mut().for_each(&mut *f);
                desc(result, &mut *f);
                f(result_size);
            }
            TensorFill { target_desc, target_size, start, lengths, .. } => {
                desc(target_desc, &mut *f);
                f(target_size);
                start.iter_mut().for_each(&mut *f);
                lengths.iter_mut().for_each(&mut *f);
            }
            TensorUpdate { target_desc, target_size, start, update_desc, update_size, .. } => {
                desc(target_desc, &mut *f);
                f(target_size);
                start.iter_mut().for_each(&mut *f);
                desc(update_desc, &mut *f);
                f(update_size);
            }
            TensorLoad { source_desc, source_size, indices, .. } => {
                desc(source_desc, &mut *f);
                f(source_size);
                indices.iter_mut().for_each(&mut *f);
            }
            TensorStore { target_desc, target_size, indices, .. } => {
                desc(target_desc, &mut *f);
                f(target_size);
                indices.iter_mut().for_each(&mut *f);
            }
            TensorDispatch { operand_descs, operand_sizes, result, result_size, .. } => {
                for d in operand_descs {
                    desc(d, &mut *f);
                }
                operand_sizes.iter_mut().for_each(&mut *f);
                desc(result, &mut *f);
                f(result_size);
            }
            ResourceImport { size, .. }
            | ResourceExport { size, .. }
            | AsyncConstant { size, .. }
            | AsyncSplat { size, .. }
            | BuiltinSplatI64 { size, .. } => f(size),
            AsyncClone { source_size, result_size, .. } => {
                f(source_size);
                f(result_size);
            }
            AsyncSlice { source_size, offset, end, length, .. } => {
                f(source_size);
                f(offset);
                f(end);
                f(length);
            }
            AsyncFill { target_size, offset, end, length, .. }
            | BuiltinFillI64 { target_size, offset, end, length, .. } => {
                f(target_size);
                f(offset);
                f(end);
                f(length);
            }
            AsyncUpdate { target_size, offset, end, update_size, .. } => {
                f(target_size);
                f(offset);
                f(end);
                f(update_size);
            }
            AsyncLoad { source_size, offset, .. } => {
                f(source_size);
                f(offset);
            }
            AsyncStore { target_size, offset, .. } => {
                f(target_size);
                f(offset);
            }
            AsyncDispatch { operand_sizes, result_size, .. } => {
                operand_sizes.iter_mut().for_each(&mut *f);
                f(result_size);
            }
            ResourceAlloc { size, slices, .. } => {
                f(size);
                for s in slices {
                    f(&mut s.offset);
                    f(&mut s.length);
                }
            }
            ResourceConstants { slices, .. } => {
                for s in slices {
                    f(&mut s.offset);
                    f(&mut s.length);
                }
            }
            BindingSubspan { offset, .. } => f(offset),
            GlobalLoad { .. }
            | GlobalStore { .. }
            | Return { .. }
            | DispatchLoad { .. }
            | DispatchStore { .. }
            | DispatchCompute { .. }
            | TruncI { .. }
            | ExtUI { .. }
            | Wave { .. } => {}
        }
    }

    /// Visits every scalar expression carried by the op.
    pub fn for_each_scalar_mut(&mut self, f: &mut dyn FnMut(&mut ScalarExpr)) {
        use OpKind::*;
        match self {
            TensorSplat { value, .. } | TensorFill { value, .. } | TensorStore { value, .. } | AsyncStore { value, .. } => {
                f(value)
            }
            AsyncSplat { pattern, .. }
            | BuiltinSplatI64 { pattern, .. }
            | AsyncFill { pattern, .. }
            | BuiltinFillI64 { pattern, .. } => f(pattern),
            _ => {}
        }
    }

    /// All values this op reads, including those nested in expressions.
    pub fn operands(&self) -> Vec<ValueId> {
        let mut out = Vec::new();
        let mut copy = self.clone();
        copy.for_each_value_mut(&mut |v| out.push(*v));
        copy.for_each_index_mut(&mut |e| e.collect_values(&mut out));
        copy.for_each_scalar_mut(&mut |s| s.collect_values(&mut out));
        out
    }

    /// Resource operands read (but not written) by this op.
    pub fn resource_reads(&self) -> Vec<ValueId> {
        use OpKind::*;
        match self {
            TensorExport { source, .. }
            | TensorClone { source, .. }
            | TensorSlice { source, .. }
            | TensorLoad { source, .. }
            | ResourceExport { source, .. }
            | AsyncClone { source, .. }
            | AsyncSlice { source, .. }
            | AsyncLoad { source, .. } => vec![*source],
            TensorUpdate { update, .. } | AsyncUpdate { update, .. } => vec![*update],
            TensorDispatch { operands, .. } | AsyncDispatch { operands, .. } => operands.clone(),
            GlobalStore { value, .. } => vec![*value],
            Return { values } => values.clone(),
            _ => Vec::new(),
        }
    }
}

/// An operation node in a function arena.
#[derive(Debug, Clone, PartialEq)]
pub struct Op {
    pub kind: OpKind,
    pub results: Vec<ValueId>,
    /// Execution context the op is pinned to, if any.
    pub affinity: Option<String>,
    /// Timepoints that must be reached before the op may run.
    pub awaits: Vec<ValueId>,
    /// Byte ranges resolved by the allocation planner.
    pub ranges: Vec<ResolvedRange>,
    /// Wave owning this op.
    pub parent: Option<OpId>,
}

impl Op {
    pub fn new(kind: OpKind) -> Self {
        Self { kind, results: Vec::new(), affinity: None, awaits: Vec::new(), ranges: Vec::new(), parent: None }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn result(&self) -> ValueId {
        self.results[0]
    }

    /// Every value the op reads, including awaited timepoints.
    pub fn operands(&self) -> Vec<ValueId> {
        let mut out = self.kind.operands();
        out.extend(self.awaits.iter().copied());
        out
    }
}
