//! Symbolic index and scalar expressions.
//!
//! Sizes, offsets and indices are carried inline on ops as [`IndexExpr`] trees
//! over compile-time constants and runtime index values. The constructors fold
//! eagerly so fully static shapes never produce arithmetic.

use super::types::ElementType;
use super::ValueId;

/// Symbolic index/byte expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexExpr {
    Const(u64),
    Value(ValueId),
    Add(Box<IndexExpr>, Box<IndexExpr>),
    Mul(Box<IndexExpr>, Box<IndexExpr>),
}

impl IndexExpr {
    pub const ZERO: IndexExpr = IndexExpr::Const(0);

    pub fn constant(&self) -> Option<u64> {
        match self {
            IndexExpr::Const(c) => Some(*c),
            _ => None,
        }
    }

    /// Folding addition. Constants are kept on the right hand side and merged.
    pub fn add(lhs: IndexExpr, rhs: IndexExpr) -> IndexExpr {
        match (lhs, rhs) {
            (IndexExpr::Const(a), IndexExpr::Const(b)) => IndexExpr::Const(a + b),
            (x, IndexExpr::Const(0)) | (IndexExpr::Const(0), x) => x,
            (IndexExpr::Const(c), x) => IndexExpr::add(x, IndexExpr::Const(c)),
            (IndexExpr::Add(x, c1), IndexExpr::Const(c2)) if c1.constant().is_some() => {
                let c1 = c1.constant().unwrap_or_default();
                IndexExpr::Add(x, Box::new(IndexExpr::Const(c1 + c2)))
            }
            (x, y) => IndexExpr::Add(Box::new(x), Box::new(y)),
        }
    }

    /// Folding multiplication.
    pub fn mul(lhs: IndexExpr, rhs: IndexExpr) -> IndexExpr {
        match (lhs, rhs) {
            (IndexExpr::Const(a), IndexExpr::Const(b)) => IndexExpr::Const(a * b),
            (_, IndexExpr::Const(0)) | (IndexExpr::Const(0), _) => IndexExpr::Const(0),
            (x, IndexExpr::Const(1)) | (IndexExpr::Const(1), x) => x,
            (IndexExpr::Const(c), x) => IndexExpr::mul(x, IndexExpr::Const(c)),
            (IndexExpr::Mul(x, c1), IndexExpr::Const(c2)) if c1.constant().is_some() => {
                let c1 = c1.constant().unwrap_or_default();
                IndexExpr::Mul(x, Box::new(IndexExpr::Const(c1 * c2)))
            }
            (x, y) => IndexExpr::Mul(Box::new(x), Box::new(y)),
        }
    }

    /// Runtime values referenced by this expression, in left-to-right order.
    pub fn collect_values(&self, out: &mut Vec<ValueId>) {
        match self {
            IndexExpr::Const(_) => {}
            IndexExpr::Value(v) => out.push(*v),
            IndexExpr::Add(a, b) | IndexExpr::Mul(a, b) => {
                a.collect_values(out);
                b.collect_values(out);
            }
        }
    }

    /// Rebuilds the expression with `value` replaced by `with`, refolding as it goes.
    pub fn substitute(&self, value: ValueId, with: &IndexExpr) -> IndexExpr {
        match self {
            IndexExpr::Value(v) if *v == value => with.clone(),
            IndexExpr::Const(_) | IndexExpr::Value(_) => self.clone(),
            IndexExpr::Add(a, b) => IndexExpr::add(a.substitute(value, with), b.substitute(value, with)),
            IndexExpr::Mul(a, b) => IndexExpr::mul(a.substitute(value, with), b.substitute(value, with)),
        }
    }

    /// Renames every referenced value through `f`.
    pub fn map_values(&self, f: &dyn Fn(ValueId) -> ValueId) -> IndexExpr {
        match self {
            IndexExpr::Const(_) => self.clone(),
            IndexExpr::Value(v) => IndexExpr::Value(f(*v)),
            IndexExpr::Add(a, b) => IndexExpr::Add(Box::new(a.map_values(f)), Box::new(b.map_values(f))),
            IndexExpr::Mul(a, b) => IndexExpr::Mul(Box::new(a.map_values(f)), Box::new(b.map_values(f))),
        }
    }
}

impl From<u64> for IndexExpr {
    fn from(value: u64) -> Self {
        IndexExpr::Const(value)
    }
}

impl From<ValueId> for IndexExpr {
    fn from(value: ValueId) -> Self {
        IndexExpr::Value(value)
    }
}

/// Scalar operand of splat/fill/store ops.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScalarExpr {
    /// Raw bits of a constant, masked to the type width.
    Const { ty: ElementType, bits: u64 },
    Value { id: ValueId, ty: ElementType },
    Bitcast { to: ElementType, inner: Box<ScalarExpr> },
    ExtU { to: ElementType, inner: Box<ScalarExpr> },
    Trunc { to: ElementType, inner: Box<ScalarExpr> },
}

impl ScalarExpr {
    pub fn constant(ty: ElementType, bits: u64) -> Self {
        ScalarExpr::Const { ty, bits: bits & ty.mask() }
    }

    pub fn ty(&self) -> ElementType {
        match self {
            ScalarExpr::Const { ty, .. } | ScalarExpr::Value { ty, .. } => *ty,
            ScalarExpr::Bitcast { to, .. } | ScalarExpr::ExtU { to, .. } | ScalarExpr::Trunc { to, .. } => *to,
        }
    }

    pub fn const_bits(&self) -> Option<u64> {
        match self {
            ScalarExpr::Const { bits, .. } => Some(*bits),
            _ => None,
        }
    }

    /// Reinterprets the bits as another type of the same width.
    pub fn bitcast(self, to: ElementType) -> Self {
        assert_eq!(self.ty().bit_width(), to.bit_width(), "bitcast must preserve width");
        match self {
            s if s.ty() == to => s,
            ScalarExpr::Const { bits, .. } => ScalarExpr::Const { ty: to, bits },
            s => ScalarExpr::Bitcast { to, inner: Box::new(s) },
        }
    }

    /// Zero-extends to a wider type.
    pub fn extu(self, to: ElementType) -> Self {
        assert!(to.bit_width() >= self.ty().bit_width(), "extension must widen: {} -> {to}", self.ty());
        match self {
            s if s.ty() == to => s,
            ScalarExpr::Const { bits, .. } => ScalarExpr::Const { ty: to, bits },
            s => ScalarExpr::ExtU { to, inner: Box::new(s) },
        }
    }

    /// Truncates to a narrower type.
    pub fn trunc(self, to: ElementType) -> Self {
        assert!(to.bit_width() <= self.ty().bit_width(), "truncation must narrow: {} -> {to}", self.ty());
        match self {
            s if s.ty() == to => s,
            ScalarExpr::Const { bits, .. } => ScalarExpr::constant(to, bits),
            s => ScalarExpr::Trunc { to, inner: Box::new(s) },
        }
    }

    pub fn collect_values(&self, out: &mut Vec<ValueId>) {
        match self {
            ScalarExpr::Const { .. } => {}
            ScalarExpr::Value { id, .. } => out.push(*id),
            ScalarExpr::Bitcast { inner, .. } | ScalarExpr::ExtU { inner, .. } | ScalarExpr::Trunc { inner, .. } => {
                inner.collect_values(out)
            }
        }
    }

    pub fn substitute(&self, value: ValueId, with: ValueId) -> ScalarExpr {
        match self {
            ScalarExpr::Value { id, ty } if *id == value => ScalarExpr::Value { id: with, ty: *ty },
            ScalarExpr::Const { .. } | ScalarExpr::Value { .. } => self.clone(),
            ScalarExpr::Bitcast { to, inner } => inner.substitute(value, with).bitcast(*to),
            ScalarExpr::ExtU { to, inner } => inner.substitute(value, with).extu(*to),
            ScalarExpr::Trunc { to, inner } => inner.substitute(value, with).trunc(*to),
        }
    }

    pub fn map_values(&self, f: &dyn Fn(ValueId) -> ValueId) -> ScalarExpr {
        match self {
            ScalarExpr::Const { .. } => self.clone(),
            ScalarExpr::Value { id, ty } => ScalarExpr::Value { id: f(*id), ty: *ty },
            ScalarExpr::Bitcast { to, inner } => ScalarExpr::Bitcast { to: *to, inner: Box::new(inner.map_values(f)) },
            ScalarExpr::ExtU { to, inner } => ScalarExpr::ExtU { to: *to, inner: Box::new(inner.map_values(f)) },
            ScalarExpr::Trunc { to, inner } => ScalarExpr::Trunc { to: *to, inner: Box::new(inner.map_values(f)) },
        }
    }
}
