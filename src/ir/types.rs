//! Element, tensor and value types of the stream IR.

use std::fmt;

/// Integer signedness carried by an integer element encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signedness {
    Signless,
    Signed,
    Unsigned,
}

/// Element encoding: a (bit-width, signedness) pair for integers, or a float width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Int { bits: u32, signedness: Signedness },
    Float { bits: u32 },
}

impl ElementType {
    /// Signless integer of the given width.
    pub const fn int(bits: u32) -> Self {
        ElementType::Int { bits, signedness: Signedness::Signless }
    }

    pub const fn float(bits: u32) -> Self {
        ElementType::Float { bits }
    }

    pub const fn bit_width(self) -> u32 {
        match self {
            ElementType::Int { bits, .. } | ElementType::Float { bits } => bits,
        }
    }

    pub const fn is_int(self) -> bool {
        matches!(self, ElementType::Int { .. })
    }

    pub const fn is_float(self) -> bool {
        matches!(self, ElementType::Float { .. })
    }

    /// Same kind and signedness with a different width.
    pub const fn with_bit_width(self, bits: u32) -> Self {
        match self {
            ElementType::Int { signedness, .. } => ElementType::Int { bits, signedness },
            ElementType::Float { .. } => ElementType::Float { bits },
        }
    }

    /// Mask selecting the low `bit_width` bits of a raw value.
    pub fn mask(self) -> u64 {
        match self.bit_width() {
            w if w >= 64 => u64::MAX,
            w => (1u64 << w) - 1,
        }
    }

    /// Parses `i8`, `si8`, `ui8`, `f32`.
    pub fn parse(s: &str) -> Option<Self> {
        let (signedness, rest) = if let Some(rest) = s.strip_prefix("si") {
            (Signedness::Signed, rest)
        } else if let Some(rest) = s.strip_prefix("ui") {
            (Signedness::Unsigned, rest)
        } else if let Some(rest) = s.strip_prefix('i') {
            (Signedness::Signless, rest)
        } else if let Some(rest) = s.strip_prefix('f') {
            let bits: u32 = rest.parse().ok()?;
            return matches!(bits, 16 | 32 | 64).then_some(ElementType::Float { bits });
        } else {
            return None;
        };
        let bits: u32 = rest.parse().ok()?;
        (1..=64).contains(&bits).then_some(ElementType::Int { bits, signedness })
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementType::Int { bits, signedness: Signedness::Signless } => write!(f, "i{bits}"),
            ElementType::Int { bits, signedness: Signedness::Signed } => write!(f, "si{bits}"),
            ElementType::Int { bits, signedness: Signedness::Unsigned } => write!(f, "ui{bits}"),
            ElementType::Float { bits } => write!(f, "f{bits}"),
        }
    }
}

/// A tensor dimension, either known at compile time or supplied at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dim {
    Static(u64),
    Dynamic,
}

/// Tensor encoding. Only dense tensors can be lowered to bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TensorEncoding {
    Dense,
    /// Packed, sparse or otherwise compressed layout named by the front-end.
    Named(String),
}

/// Logical ranked tensor type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorType {
    pub dims: Vec<Dim>,
    pub element: ElementType,
    pub encoding: TensorEncoding,
}

impl TensorType {
    pub fn new(dims: Vec<Dim>, element: ElementType) -> Self {
        Self { dims, element, encoding: TensorEncoding::Dense }
    }

    /// Static shape helper.
    pub fn of(shape: &[u64], element: ElementType) -> Self {
        Self::new(shape.iter().map(|&d| Dim::Static(d)).collect(), element)
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn is_dynamic_dim(&self, i: usize) -> bool {
        matches!(self.dims[i], Dim::Dynamic)
    }

    pub fn dynamic_dim_count(&self) -> usize {
        self.dims.iter().filter(|d| matches!(d, Dim::Dynamic)).count()
    }

    pub fn is_dense(&self) -> bool {
        matches!(self.encoding, TensorEncoding::Dense)
    }

    /// Product of all static dims if the shape is fully static.
    pub fn static_element_count(&self) -> Option<u64> {
        self.dims.iter().try_fold(1u64, |acc, d| match d {
            Dim::Static(n) => Some(acc * n),
            Dim::Dynamic => None,
        })
    }

    pub fn with_element(&self, element: ElementType) -> Self {
        Self { dims: self.dims.clone(), element, encoding: self.encoding.clone() }
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor<")?;
        for dim in &self.dims {
            match dim {
                Dim::Static(n) => write!(f, "{n}x")?,
                Dim::Dynamic => write!(f, "?x")?,
            }
        }
        write!(f, "{}", self.element)?;
        if let TensorEncoding::Named(name) = &self.encoding {
            write!(f, ", #{name}")?;
        }
        write!(f, ">")
    }
}

/// Resource lifetime class, refined by the lifetime scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Lifetime {
    Unknown,
    /// Visible outside the program (imported, exported or an argument).
    External,
    /// Backs module-level global state.
    Variable,
    /// Produced and consumed within one function.
    Transient,
    /// Immutable content known at compile time.
    Constant,
}

impl Lifetime {
    pub fn name(self) -> &'static str {
        match self {
            Lifetime::Unknown => "*",
            Lifetime::External => "external",
            Lifetime::Variable => "variable",
            Lifetime::Transient => "transient",
            Lifetime::Constant => "constant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "*" => Lifetime::Unknown,
            "external" => Lifetime::External,
            "variable" => Lifetime::Variable,
            "transient" => Lifetime::Transient,
            "constant" => Lifetime::Constant,
            _ => return None,
        })
    }
}

/// Type of an SSA value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Index,
    Scalar(ElementType),
    Resource(Lifetime),
    Timepoint,
    /// Opaque host buffer handle crossing the program boundary.
    External,
    /// Dispatch binding handle inside an executable.
    Binding,
    /// Typed view of a binding.
    View(TensorType),
    /// Device-side tensor value.
    Tensor(TensorType),
}

impl Type {
    pub fn is_resource(&self) -> bool {
        matches!(self, Type::Resource(_))
    }

    pub fn lifetime(&self) -> Option<Lifetime> {
        match self {
            Type::Resource(lifetime) => Some(*lifetime),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Index => write!(f, "index"),
            Type::Scalar(ty) => write!(f, "{ty}"),
            Type::Resource(Lifetime::Unknown) => write!(f, "resource"),
            Type::Resource(lifetime) => write!(f, "resource<{}>", lifetime.name()),
            Type::Timepoint => write!(f, "timepoint"),
            Type::External => write!(f, "external"),
            Type::Binding => write!(f, "binding"),
            Type::View(tensor) => write!(f, "view<{tensor}>"),
            Type::Tensor(tensor) => write!(f, "{tensor}"),
        }
    }
}
