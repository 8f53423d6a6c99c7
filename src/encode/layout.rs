//! Byte layout arithmetic for dense tensors.
//!
//! Every helper builds folded [`IndexExpr`]s, so fully static shapes reduce
//! to constants and dynamic shapes produce the minimal product/sum trees.

use crate::core::error::EncodeError;
use crate::ir::{ElementType, IndexExpr, ScalarExpr, TensorDesc, TensorEncoding, TensorType};

/// Rejects tensor encodings that are not dense.
pub fn check_encoding(ty: &TensorType) -> Result<(), EncodeError> {
    match &ty.encoding {
        TensorEncoding::Dense => Ok(()),
        TensorEncoding::Named(_) => Err(EncodeError::UnsupportedEncoding { encoding: ty.to_string() }),
    }
}

/// Byte size of an element once aligned to a power-of-two byte width.
pub fn element_byte_size(ty: ElementType) -> u64 {
    let bits = ty.bit_width().next_power_of_two().max(8);
    u64::from(bits / 8)
}

/// Aligns an integer element type to a byte-aligned power-of-two width.
///
/// `i1 -> i8`, `i4 -> i8`, `i11 -> i16`, `i33 -> i64`. Floats are already aligned.
pub fn align_element_type(ty: ElementType) -> ElementType {
    if !ty.is_int() {
        return ty;
    }
    let aligned = (element_byte_size(ty) * 8) as u32;
    if aligned == ty.bit_width() {
        ty
    } else {
        ty.with_bit_width(aligned)
    }
}

pub fn align_tensor_type(ty: &TensorType) -> TensorType {
    let aligned = align_element_type(ty.element);
    if aligned == ty.element {
        ty.clone()
    } else {
        ty.with_element(aligned)
    }
}

/// `multiplier * prod(static dims) * prod(dynamic dims)`.
pub fn calculate_element_count(desc: &TensorDesc, multiplier: u64) -> IndexExpr {
    let static_count = desc
        .ty
        .dims
        .iter()
        .filter_map(|d| match d {
            crate::ir::Dim::Static(n) => Some(*n),
            crate::ir::Dim::Dynamic => None,
        })
        .fold(multiplier, |acc, n| acc * n);
    desc.dims.iter().fold(IndexExpr::Const(static_count), |acc, dim| IndexExpr::mul(acc, dim.clone()))
}

/// Size of dim `i`, mapping the absolute dim index to its compact dynamic index.
pub fn make_tensor_dim(desc: &TensorDesc, i: usize) -> IndexExpr {
    match desc.ty.dims[i] {
        crate::ir::Dim::Static(n) => IndexExpr::Const(n),
        crate::ir::Dim::Dynamic => {
            let di = (0..i).filter(|&j| desc.ty.is_dynamic_dim(j)).count();
            desc.dims[di].clone()
        }
    }
}

/// Row-major element offset of `indices`.
pub fn calculate_element_offset(desc: &TensorDesc, indices: &[IndexExpr]) -> IndexExpr {
    assert_eq!(
        indices.len(),
        desc.ty.rank(),
        "index rank does not match {}",
        desc.ty
    );
    let mut offset = IndexExpr::ZERO;
    for (i, index) in indices.iter().enumerate() {
        let mut axis_offset = index.clone();
        for j in i + 1..desc.ty.rank() {
            axis_offset = IndexExpr::mul(axis_offset, make_tensor_dim(desc, j));
        }
        offset = IndexExpr::add(offset, axis_offset);
    }
    offset
}

pub fn calculate_element_byte_offset(desc: &TensorDesc, indices: &[IndexExpr]) -> IndexExpr {
    IndexExpr::mul(calculate_element_offset(desc, indices), IndexExpr::Const(element_byte_size(desc.ty.element)))
}

/// Maps a splat/fill pattern to one of `i8`, `i16`, `i32` or `i64`.
///
/// Floats are bitcast to integers of the same width and `i1` is zero-extended
/// to `i8`. Other widths that are not a multiple of 8 have no encoding policy.
/// Callers route patterns wider than 32 bits to the emulated 64-bit builtins.
pub fn canonicalize_fill_pattern(pattern: ScalarExpr) -> Result<ScalarExpr, EncodeError> {
    let ty = pattern.ty();
    let width = ty.bit_width();
    let pattern = if ty.is_float() { pattern.bitcast(ElementType::int(width)) } else { pattern };
    if width == 1 {
        return Ok(pattern.extu(ElementType::int(8)));
    }
    if width % 8 != 0 {
        return Err(EncodeError::UnsupportedPatternWidth { width });
    }
    Ok(pattern)
}

/// Patterns wider than 32 bits have no native fill.
pub fn needs_i64_emulation(pattern: &ScalarExpr) -> bool {
    pattern.ty().bit_width() > 32
}
