//! Stream IR text printer. Output parses back with [`super::parser`].

use std::fmt::{self, Write};

use super::*;

pub fn print_module(module: &Module, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for global in &module.globals {
        writeln!(f, "global @{} : {}", global.name, global.ty)?;
    }
    for (i, func) in module.functions.iter().enumerate() {
        if i > 0 || !module.globals.is_empty() {
            writeln!(f)?;
        }
        print_function(func, f)?;
    }
    Ok(())
}

pub fn print_function(func: &Function, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} @{}(", func.kind.keyword(), func.name)?;
    for (i, &arg) in func.args.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "%{}: {}", func.value(arg).name, func.value_type(arg))?;
    }
    writeln!(f, ") {{")?;
    for &op in func.body() {
        print_op(func, op, 1, f)?;
    }
    writeln!(f, "}}")
}

/// Renders one op (and the members of a wave) as text.
pub fn op_to_string(func: &Function, op: OpId) -> String {
    struct Adapter<'a>(&'a Function, OpId);
    impl fmt::Display for Adapter<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            print_op(self.0, self.1, 0, f)
        }
    }
    Adapter(func, op).to_string().trim_end().to_string()
}

fn name(func: &Function, value: ValueId) -> String {
    format!("%{}", func.value(value).name)
}

fn value_list(func: &Function, values: &[ValueId]) -> String {
    values.iter().map(|&v| name(func, v)).collect::<Vec<_>>().join(", ")
}

pub fn index(func: &Function, expr: &IndexExpr) -> String {
    match expr {
        IndexExpr::Const(c) => c.to_string(),
        IndexExpr::Value(v) => name(func, *v),
        IndexExpr::Add(a, b) => format!("({} + {})", index(func, a), index(func, b)),
        IndexExpr::Mul(a, b) => format!("({} * {})", index(func, a), index(func, b)),
    }
}

fn index_list(func: &Function, list: &[IndexExpr]) -> String {
    format!("[{}]", list.iter().map(|e| index(func, e)).collect::<Vec<_>>().join(", "))
}

fn desc(func: &Function, d: &TensorDesc) -> String {
    if d.dims.is_empty() {
        d.ty.to_string()
    } else {
        format!("{}{{{}}}", d.ty, d.dims.iter().map(|e| index(func, e)).collect::<Vec<_>>().join(", "))
    }
}

/// Literal text of raw `bits` interpreted as `ty`.
pub fn literal(bits: u64, ty: ElementType) -> String {
    match ty {
        ElementType::Float { bits: 32 } => format!("{:?}", f32::from_bits(bits as u32)),
        ElementType::Float { bits: 64 } => format!("{:?}", f64::from_bits(bits)),
        ElementType::Float { .. } => format!("0x{bits:04x}"),
        ElementType::Int { .. } => bits.to_string(),
    }
}

pub fn scalar(func: &Function, s: &ScalarExpr) -> String {
    match s {
        ScalarExpr::Const { ty, bits } => format!("{} : {ty}", literal(*bits, *ty)),
        ScalarExpr::Value { id, .. } => name(func, *id),
        ScalarExpr::Bitcast { to, inner } => format!("bitcast<{to}>({})", scalar(func, inner)),
        ScalarExpr::ExtU { to, inner } => format!("extui<{to}>({})", scalar(func, inner)),
        ScalarExpr::Trunc { to, inner } => format!("trunci<{to}>({})", scalar(func, inner)),
    }
}

fn constant(c: &ConstantData) -> String {
    match &c.elements {
        Elements::Splat(v) => format!("dense<{}> : {}", literal(*v, c.element), c.element),
        Elements::Dense(values) => format!(
            "dense<[{}]> : {}",
            values.iter().map(|&v| literal(v, c.element)).collect::<Vec<_>>().join(", "),
            c.element
        ),
    }
}

fn slices(func: &Function, slices: &[Slice]) -> String {
    let entries: Vec<String> = slices
        .iter()
        .map(|s| format!("{} at {} len {}", name(func, s.value), index(func, &s.offset), index(func, &s.length)))
        .collect();
    format!("[{}]", entries.join(", "))
}

fn ranges(func: &Function, ranges: &[ResolvedRange]) -> String {
    let entries: Vec<String> = ranges
        .iter()
        .map(|r| {
            format!(
                "{} in {}[{}, {})",
                name(func, r.resource),
                name(func, r.storage),
                index(func, &r.offset),
                index(func, &r.end)
            )
        })
        .collect();
    format!("[{}]", entries.join(", "))
}

/// Attributes of an op in print order.
fn attributes(func: &Function, kind: &OpKind) -> Vec<(&'static str, String)> {
    use OpKind::*;
    let i = |e: &IndexExpr| index(func, e);
    let d = |t: &TensorDesc| desc(func, t);
    let s = |e: &ScalarExpr| scalar(func, e);
    let l = |v: &[IndexExpr]| index_list(func, v);
    match kind {
        TensorImport { result, .. } => vec![("result", d(result))],
        TensorExport { source_desc, source_size, .. } => vec![("source", d(source_desc)), ("source_size", i(source_size))],
        TensorSizeOf { desc } => vec![("desc", d(desc))],
        TensorConstant { result, value } => vec![("result", d(result)), ("value", constant(value))],
        TensorSplat { result, result_size, value } => {
            vec![("result", d(result)), ("result_size", i(result_size)), ("value", s(value))]
        }
        TensorClone { source_desc, source_size, result, result_size, .. } => vec![
            ("source", d(source_desc)),
            ("source_size", i(source_size)),
            ("result", d(result)),
            ("result_size", i(result_size)),
        ],
        TensorSlice { source_desc, source_size, start, lengths, result, result_size, .. } => vec![
            ("source", d(source_desc)),
            ("source_size", i(source_size)),
            ("start", l(start)),
            ("lengths", l(lengths)),
            ("result", d(result)),
            ("result_size", i(result_size)),
        ],
        TensorFill { target_desc, target_size, start, lengths, value, .. } => vec![
            ("target", d(target_desc)),
            ("target_size", i(target_size)),
            ("start", l(start)),
            ("lengths", l(lengths)),
            ("value", s(value)),
        ],
        TensorUpdate { target_desc, target_size, start, update_desc, update_size, .. } => vec![
            ("target", d(target_desc)),
            ("target_size", i(target_size)),
            ("start", l(start)),
            ("update", d(update_desc)),
            ("update_size", i(update_size)),
        ],
        TensorLoad { source_desc, source_size, indices, .. } => {
            vec![("source", d(source_desc)), ("source_size", i(source_size)), ("indices", l(indices))]
        }
        TensorStore { target_desc, target_size, indices, value, .. } => vec![
            ("target", d(target_desc)),
            ("target_size", i(target_size)),
            ("indices", l(indices)),
            ("value", s(value)),
        ],
        TensorDispatch { entry, operand_descs, operand_sizes, result, result_size, .. } => vec![
            ("entry", format!("@{entry}")),
            ("operands", format!("[{}]", operand_descs.iter().map(d).collect::<Vec<_>>().join(", "))),
            ("operand_sizes", l(operand_sizes)),
            ("result", d(result)),
            ("result_size", i(result_size)),
        ],
        ResourceImport { size, .. } | ResourceExport { size, .. } => vec![("size", i(size))],
        AsyncConstant { value, size } => vec![("value", constant(value)), ("size", i(size))],
        AsyncSplat { pattern, size } | BuiltinSplatI64 { pattern, size } => {
            vec![("pattern", s(pattern)), ("size", i(size))]
        }
        AsyncClone { source_size, result_size, .. } => {
            vec![("source_size", i(source_size)), ("result_size", i(result_size))]
        }
        AsyncSlice { source_size, offset, end, length, .. } => vec![
            ("source_size", i(source_size)),
            ("offset", i(offset)),
            ("end", i(end)),
            ("length", i(length)),
        ],
        AsyncFill { target_size, offset, end, length, pattern, .. }
        | BuiltinFillI64 { target_size, offset, end, length, pattern, .. } => vec![
            ("target_size", i(target_size)),
            ("offset", i(offset)),
            ("end", i(end)),
            ("length", i(length)),
            ("pattern", s(pattern)),
        ],
        AsyncUpdate { target_size, offset, end, update_size, .. } => vec![
            ("target_size", i(target_size)),
            ("offset", i(offset)),
            ("end", i(end)),
            ("update_size", i(update_size)),
        ],
        AsyncLoad { source_size, offset, ty, .. } => {
            vec![("source_size", i(source_size)), ("offset", i(offset)), ("type", ty.to_string())]
        }
        AsyncStore { target_size, offset, value, .. } => {
            vec![("target_size", i(target_size)), ("offset", i(offset)), ("value", s(value))]
        }
        AsyncDispatch { entry, operand_sizes, result_size, bindings, .. } => {
            let mut attrs = vec![
                ("entry", format!("@{entry}")),
                ("operand_sizes", l(operand_sizes)),
                ("result_size", i(result_size)),
            ];
            if !bindings.is_empty() {
                let list: Vec<String> = bindings.iter().map(u32::to_string).collect();
                attrs.push(("bindings", format!("[{}]", list.join(", "))));
            }
            attrs
        }
        ResourceAlloc { size, lifetime, slices: placed } => vec![
            ("size", i(size)),
            ("lifetime", lifetime.name().to_string()),
            ("slices", slices(func, placed)),
        ],
        ResourceConstants { data, slices: placed } => {
            let mut hex = String::with_capacity(data.len() * 2);
            for byte in data {
                let _ = write!(hex, "{byte:02x}");
            }
            vec![("data", format!("\"{hex}\"")), ("slices", slices(func, placed))]
        }
        GlobalLoad { global } | GlobalStore { global, .. } => vec![("global", format!("@{global}"))],
        BindingSubspan { offset, ty, .. } => vec![("offset", i(offset)), ("type", ty.to_string())],
        DispatchCompute { name, ty, .. } => vec![("name", format!("\"{name}\"")), ("type", ty.to_string())],
        TruncI { to, .. } | ExtUI { to, .. } => vec![("to", to.to_string())],
        Return { .. } | DispatchLoad { .. } | DispatchStore { .. } | Wave { .. } => Vec::new(),
    }
}

fn print_op(func: &Function, id: OpId, depth: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let op = func.op(id);
    let indent = "  ".repeat(depth);
    write!(f, "{indent}")?;
    if let Some(&result) = op.results.first() {
        write!(f, "{} = ", name(func, result))?;
    }

    if let OpKind::Wave { index, members } = &op.kind {
        write!(f, "wave {index}")?;
        if !op.awaits.is_empty() {
            write!(f, " await({})", value_list(func, &op.awaits))?;
        }
        writeln!(f, " {{")?;
        for &member in members {
            print_op(func, member, depth + 1, f)?;
        }
        return writeln!(f, "{indent}}}");
    }

    write!(f, "{}", op.name())?;
    let mut positional = Vec::new();
    op.kind.clone().for_each_value_mut(&mut |v| positional.push(*v));
    if !positional.is_empty() || matches!(
        op.kind,
        OpKind::TensorDispatch { .. } | OpKind::AsyncDispatch { .. } | OpKind::DispatchCompute { .. }
    ) {
        write!(f, "({})", value_list(func, &positional))?;
    }
    if !op.awaits.is_empty() {
        write!(f, " await({})", value_list(func, &op.awaits))?;
    }

    let mut attrs = attributes(func, &op.kind);
    if let Some(affinity) = &op.affinity {
        attrs.push(("affinity", format!("\"{affinity}\"")));
    }
    if !op.ranges.is_empty() {
        attrs.push(("ranges", ranges(func, &op.ranges)));
    }
    if !attrs.is_empty() {
        let rendered: Vec<String> = attrs.into_iter().map(|(k, v)| format!("{k} = {v}")).collect();
        write!(f, " {{{}}}", rendered.join(", "))?;
    }
    writeln!(f)
}
