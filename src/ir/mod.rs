//! Stream IR: the program substrate every stage reads and rewrites.
//!
//! Values and ops live in per-function arenas and are addressed by index.
//! Each function keeps an ordered body of top-level ops and a reverse-use
//! index that every rewrite helper keeps current, so passes never patch
//! pointers in place.
//!
//! # Text format
//!
//! ```text
//! ; Comments start with semicolon
//! global @state : resource
//!
//! func @main(%n: index, %in: external) {
//!   %size = tensor.sizeof {desc = tensor<?x4xi8>{%n}}
//!   %a = tensor.import(%in) {result = tensor<?x4xi8>{%n}}
//!   %b = tensor.fill(%a) {target = tensor<?x4xi8>{%n}, target_size = %size,
//!                         start = [0, 0], lengths = [1, 4], value = 7 : i8}
//!   %out = tensor.export(%b) {source = tensor<?x4xi8>{%n}, source_size = %size}
//!   return(%out)
//! }
//! ```

use std::fmt;

use hashbrown::{HashMap, HashSet};

pub mod check;
pub mod expr;
pub mod ops;
pub mod parser;
pub mod printer;
pub mod types;

pub use expr::{IndexExpr, ScalarExpr};
pub use ops::{ConstantData, Elements, Op, OpKind, ResolvedRange, Slice, TensorDesc};
pub use types::{Dim, ElementType, Lifetime, Signedness, TensorEncoding, TensorType, Type};

/// Index of a value in its function arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

/// Index of an op in its function arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub u32);

impl ValueId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl OpId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Where a value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueDef {
    Arg(u32),
    Op(OpId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValueData {
    pub name: String,
    pub ty: Type,
    pub def: ValueDef,
}

/// Function flavor. Host encoders run on `Func` and `Initializer`, device
/// encoders on `Executable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncKind {
    Func,
    Initializer,
    Executable,
}

impl FuncKind {
    pub fn keyword(self) -> &'static str {
        match self {
            FuncKind::Func => "func",
            FuncKind::Initializer => "initializer",
            FuncKind::Executable => "executable",
        }
    }

    pub fn is_host(self) -> bool {
        !matches!(self, FuncKind::Executable)
    }
}

/// A function or initializer body with its own value/op arenas.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub kind: FuncKind,
    pub args: Vec<ValueId>,
    values: Vec<ValueData>,
    ops: Vec<Op>,
    body: Vec<OpId>,
    uses: Vec<Vec<OpId>>,
    live_names: HashSet<String>,
}

impl Function {
    pub fn new(name: impl Into<String>, kind: FuncKind) -> Self {
        Self {
            name: name.into(),
            kind,
            args: Vec::new(),
            values: Vec::new(),
            ops: Vec::new(),
            body: Vec::new(),
            uses: Vec::new(),
            live_names: HashSet::new(),
        }
    }

    pub fn add_arg(&mut self, name: &str, ty: Type) -> ValueId {
        let idx = self.args.len() as u32;
        let id = self.new_value(name, ty, ValueDef::Arg(idx));
        self.args.push(id);
        id
    }

    fn new_value(&mut self, name: &str, ty: Type, def: ValueDef) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        let name = self.unique_name(name);
        self.values.push(ValueData { name, ty, def });
        self.uses.push(Vec::new());
        id
    }

    fn unique_name(&mut self, base: &str) -> String {
        let base = if base.is_empty() { "v" } else { base };
        let mut name = base.to_string();
        let mut n = 0;
        while self.live_names.contains(&name) {
            n += 1;
            name = format!("{base}_{n}");
        }
        self.live_names.insert(name.clone());
        name
    }

    pub fn value(&self, id: ValueId) -> &ValueData {
        &self.values[id.index()]
    }

    pub fn value_type(&self, id: ValueId) -> &Type {
        &self.values[id.index()].ty
    }

    pub fn set_value_type(&mut self, id: ValueId, ty: Type) {
        self.values[id.index()].ty = ty;
    }

    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    pub fn op(&self, id: OpId) -> &Op {
        &self.ops[id.index()]
    }

    /// Replaces the timepoints an op awaits.
    pub fn set_awaits(&mut self, id: OpId, awaits: Vec<ValueId>) {
        self.drop_uses(id);
        self.ops[id.index()].awaits = awaits;
        self.add_uses(id);
    }

    pub fn set_ranges(&mut self, id: OpId, ranges: Vec<ResolvedRange>) {
        self.ops[id.index()].ranges = ranges;
    }

    pub fn set_affinity(&mut self, id: OpId, affinity: Option<String>) {
        self.ops[id.index()].affinity = affinity;
    }

    /// Op defining `value`, if it is not an argument.
    pub fn def_op(&self, value: ValueId) -> Option<OpId> {
        match self.values[value.index()].def {
            ValueDef::Op(op) => Some(op),
            ValueDef::Arg(_) => None,
        }
    }

    /// Ops using `value`, deduplicated, in creation order.
    pub fn uses(&self, value: ValueId) -> &[OpId] {
        &self.uses[value.index()]
    }

    pub fn has_uses(&self, value: ValueId) -> bool {
        !self.uses[value.index()].is_empty()
    }

    /// Top-level ops in program order.
    pub fn body(&self) -> &[OpId] {
        &self.body
    }

    /// All live ops in program order, wave members expanded in place.
    pub fn walk(&self) -> Vec<OpId> {
        let mut out = Vec::with_capacity(self.body.len());
        for &id in &self.body {
            out.push(id);
            if let OpKind::Wave { members, .. } = &self.ops[id.index()].kind {
                out.extend(members.iter().copied());
            }
        }
        out
    }

    /// Creates an op and its results without placing it in the body.
    pub fn create_op(&mut self, kind: OpKind, result_name: &str) -> OpId {
        let id = OpId(self.ops.len() as u32);
        let result_types = self.result_types(&kind);
        self.ops.push(Op::new(kind));
        let mut results = Vec::with_capacity(result_types.len());
        for ty in result_types {
            results.push(self.new_value(result_name, ty, ValueDef::Op(id)));
        }
        self.ops[id.index()].results = results;
        self.add_uses(id);
        id
    }

    /// Creates an op at the end of the body.
    pub fn append(&mut self, kind: OpKind, result_name: &str) -> OpId {
        let id = self.create_op(kind, result_name);
        self.body.push(id);
        id
    }

    /// Creates an op immediately before `anchor` (top-level or wave member).
    pub fn insert_before(&mut self, anchor: OpId, kind: OpKind, result_name: &str) -> OpId {
        let id = self.create_op(kind, result_name);
        self.place_relative(anchor, id, 0);
        id
    }

    /// Creates an op immediately after `anchor`.
    pub fn insert_after(&mut self, anchor: OpId, kind: OpKind, result_name: &str) -> OpId {
        let id = self.create_op(kind, result_name);
        self.place_relative(anchor, id, 1);
        id
    }

    fn place_relative(&mut self, anchor: OpId, id: OpId, delta: usize) {
        match self.ops[anchor.index()].parent {
            Some(wave) => {
                self.ops[id.index()].parent = Some(wave);
                if let OpKind::Wave { members, .. } = &mut self.ops[wave.index()].kind {
                    let pos = members.iter().position(|&m| m == anchor).expect("member in parent wave");
                    members.insert(pos + delta, id);
                }
            }
            None => {
                let pos = self.position(anchor).expect("anchor op in body");
                self.body.insert(pos + delta, id);
            }
        }
    }

    /// Position of a top-level op in the body.
    pub fn position(&self, id: OpId) -> Option<usize> {
        self.body.iter().position(|&b| b == id)
    }

    /// Replaces the body order wholesale. Ops not listed become detached.
    pub fn set_body(&mut self, body: Vec<OpId>) {
        self.body = body;
    }

    /// Moves `members` out of the body into a new wave op producing a timepoint.
    pub fn set_wave_members(&mut self, wave: OpId, members: Vec<OpId>) {
        for &m in &members {
            self.ops[m.index()].parent = Some(wave);
        }
        match &mut self.ops[wave.index()].kind {
            OpKind::Wave { members: slot, .. } => *slot = members,
            other => panic!("{} is not a wave", other.name()),
        }
    }

    /// Rewrites the kind of an existing op, keeping its results.
    pub fn set_kind(&mut self, id: OpId, kind: OpKind) {
        self.drop_uses(id);
        self.ops[id.index()].kind = kind;
        self.add_uses(id);
    }

    /// Replaces `old` with a new op of `kind` at the same position. Results are
    /// rewired one-to-one and the old op is erased.
    pub fn replace_op(&mut self, old: OpId, kind: OpKind) -> OpId {
        let old_results = self.ops[old.index()].results.clone();
        let name = old_results.first().map(|&r| self.values[r.index()].name.clone()).unwrap_or_default();
        let affinity = self.ops[old.index()].affinity.clone();
        let new = self.insert_before(old, kind, &name);
        self.ops[new.index()].affinity = affinity;
        let new_results = self.ops[new.index()].results.clone();
        assert_eq!(
            old_results.len(),
            new_results.len(),
            "replacing {} with {} changes the result count",
            self.ops[old.index()].name(),
            self.ops[new.index()].name()
        );
        for (&from, &to) in old_results.iter().zip(&new_results) {
            self.replace_all_uses(from, to);
            self.transfer_name(from, to);
        }
        self.erase_op(old);
        new
    }

    /// Appends a copy of `op` from another function, renaming its operands
    /// through `map` and recording its results there. Operands missing from
    /// `map` are a bug in the caller.
    pub fn append_cloned(&mut self, src: &Function, op: OpId, map: &mut HashMap<ValueId, ValueId>) -> OpId {
        let source = src.op(op);
        let mut kind = source.kind.clone();
        {
            let rename = |v: ValueId| *map.get(&v).unwrap_or_else(|| panic!("value %{} cloned before its definition", src.value(v).name));
            kind.for_each_value_mut(&mut |v| *v = rename(*v));
            kind.for_each_index_mut(&mut |e| *e = e.map_values(&rename));
            kind.for_each_scalar_mut(&mut |s| *s = s.map_values(&rename));
        }
        let name = source.results.first().map(|&r| src.value(r).name.as_str()).unwrap_or("v");
        let id = self.append(kind, name);
        self.ops[id.index()].affinity = source.affinity.clone();
        for (&from, &to) in source.results.iter().zip(&self.ops[id.index()].results) {
            map.insert(from, to);
        }
        id
    }

    fn transfer_name(&mut self, from: ValueId, to: ValueId) {
        let old = std::mem::take(&mut self.values[from.index()].name);
        let fresh = std::mem::replace(&mut self.values[to.index()].name, old);
        self.live_names.remove(&fresh);
    }

    /// Removes an op from the body (or its wave) and from the use index.
    /// Its results must already be unused.
    pub fn erase_op(&mut self, id: OpId) {
        for &r in &self.ops[id.index()].results {
            debug_assert!(self.uses[r.index()].is_empty(), "erasing op with live result");
        }
        self.drop_uses(id);
        match self.ops[id.index()].parent.take() {
            Some(wave) => {
                if let OpKind::Wave { members, .. } = &mut self.ops[wave.index()].kind {
                    members.retain(|&m| m != id);
                }
            }
            None => self.body.retain(|&b| b != id),
        }
    }

    /// Rewires every use of `from` to `to`.
    pub fn replace_all_uses(&mut self, from: ValueId, to: ValueId) {
        self.replace_uses_where(from, to, |_| true);
    }

    /// Rewires uses of `from` to `to` in ops accepted by `filter`.
    pub fn replace_uses_where(&mut self, from: ValueId, to: ValueId, filter: impl Fn(OpId) -> bool) {
        let users: Vec<OpId> = self.uses[from.index()].iter().copied().filter(|&u| filter(u)).collect();
        for user in users {
            self.drop_uses(user);
            let op = &mut self.ops[user.index()];
            op.kind.for_each_value_mut(&mut |v| {
                if *v == from {
                    *v = to;
                }
            });
            let to_expr = IndexExpr::Value(to);
            op.kind.for_each_index_mut(&mut |e| *e = e.substitute(from, &to_expr));
            op.kind.for_each_scalar_mut(&mut |s| *s = s.substitute(from, to));
            for a in &mut op.awaits {
                if *a == from {
                    *a = to;
                }
            }
            self.add_uses(user);
        }
    }

    /// Replaces every use of an index-typed value with an expression.
    pub fn replace_index_uses(&mut self, from: ValueId, with: &IndexExpr) {
        let users: Vec<OpId> = self.uses[from.index()].clone();
        for user in users {
            self.drop_uses(user);
            self.ops[user.index()].kind.for_each_index_mut(&mut |e| *e = e.substitute(from, with));
            self.add_uses(user);
        }
    }

    fn add_uses(&mut self, id: OpId) {
        for v in self.ops[id.index()].operands() {
            let uses = &mut self.uses[v.index()];
            if !uses.contains(&id) {
                uses.push(id);
            }
        }
    }

    fn drop_uses(&mut self, id: OpId) {
        for v in self.ops[id.index()].operands() {
            self.uses[v.index()].retain(|&u| u != id);
        }
    }

    /// Types of the results an op of `kind` produces in this function.
    fn result_types(&self, kind: &OpKind) -> Vec<Type> {
        use OpKind::*;
        let resource = Type::Resource(Lifetime::Unknown);
        match kind {
            TensorImport { .. }
            | TensorConstant { .. }
            | TensorSplat { .. }
            | TensorClone { .. }
            | TensorSlice { .. }
            | TensorDispatch { .. }
            | ResourceImport { .. }
            | AsyncConstant { .. }
            | AsyncSplat { .. }
            | BuiltinSplatI64 { .. }
            | AsyncClone { .. }
            | AsyncSlice { .. }
            | AsyncDispatch { .. }
            | GlobalLoad { .. }
            | ResourceConstants { .. } => vec![resource],
            ResourceAlloc { lifetime, .. } => vec![Type::Resource(*lifetime)],
            TensorFill { target, .. }
            | TensorUpdate { target, .. }
            | TensorStore { target, .. }
            | AsyncFill { target, .. }
            | BuiltinFillI64 { target, .. }
            | AsyncUpdate { target, .. }
            | AsyncStore { target, .. } => vec![self.value_type(*target).clone()],
            TensorExport { .. } | ResourceExport { .. } => vec![Type::External],
            TensorSizeOf { .. } => vec![Type::Index],
            TensorLoad { source_desc, .. } => vec![Type::Scalar(source_desc.ty.element)],
            AsyncLoad { ty, .. } => vec![Type::Scalar(*ty)],
            BindingSubspan { ty, .. } => vec![Type::View(ty.clone())],
            DispatchLoad { source } => match self.value_type(*source) {
                Type::View(ty) => vec![Type::Tensor(ty.clone())],
                other => panic!("dispatch.load from non-view value of type {other}"),
            },
            DispatchCompute { ty, .. } => vec![Type::Tensor(ty.clone())],
            TruncI { source, to } | ExtUI { source, to } => match self.value_type(*source) {
                Type::Tensor(ty) => vec![Type::Tensor(ty.with_element(*to))],
                Type::Scalar(_) => vec![Type::Scalar(*to)],
                other => panic!("element conversion of non-tensor value of type {other}"),
            },
            Wave { .. } => vec![Type::Timepoint],
            GlobalStore { .. } | Return { .. } | DispatchStore { .. } => Vec::new(),
        }
    }
}

/// Module-level resource slot shared by initializers and functions.
#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    pub name: String,
    pub ty: Type,
}

/// A whole program: globals plus functions, initializers and executables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Module {
    pub globals: Vec<Global>,
    pub functions: Vec<Function>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> crate::core::CompileResult<Self> {
        parser::parse_module(text)
    }

    pub fn global(&self, name: &str) -> Option<&Global> {
        self.globals.iter().find(|g| g.name == name)
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.functions.iter_mut().find(|f| f.name == name)
    }

    /// Host functions and initializers.
    pub fn host_functions_mut(&mut self) -> impl Iterator<Item = &mut Function> {
        self.functions.iter_mut().filter(|f| f.kind.is_host())
    }

    pub fn executables_mut(&mut self) -> impl Iterator<Item = &mut Function> {
        self.functions.iter_mut().filter(|f| f.kind == FuncKind::Executable)
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        printer::print_module(self, f)
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        printer::print_function(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(target: ValueId) -> OpKind {
        OpKind::AsyncFill {
            target,
            target_size: IndexExpr::Const(16),
            offset: IndexExpr::Const(0),
            end: IndexExpr::Const(16),
            length: IndexExpr::Const(16),
            pattern: ScalarExpr::constant(ElementType::int(8), 0),
        }
    }

    #[test]
    fn test_use_index_tracks_rewrites() {
        let mut func = Function::new("f", FuncKind::Func);
        let splat = func.append(
            OpKind::AsyncSplat { pattern: ScalarExpr::constant(ElementType::int(8), 1), size: IndexExpr::Const(16) },
            "a",
        );
        let a = func.op(splat).result();
        let f1 = func.append(fill(a), "b");
        let b = func.op(f1).result();
        assert_eq!(func.uses(a), &[f1]);
        assert!(!func.has_uses(b));

        let clone = func.insert_before(
            f1,
            OpKind::AsyncClone { source: a, source_size: IndexExpr::Const(16), result_size: IndexExpr::Const(16) },
            "a_copy",
        );
        let copy = func.op(clone).result();
        func.replace_uses_where(a, copy, |u| u == f1);
        assert_eq!(func.uses(a), &[clone]);
        assert_eq!(func.uses(copy), &[f1]);
        assert_eq!(func.body(), &[splat, clone, f1]);
        assert_eq!(func.value(copy).name, "a_copy");
    }

    #[test]
    fn test_replace_op_transfers_names() {
        let mut func = Function::new("f", FuncKind::Func);
        let n = func.add_arg("n", Type::Index);
        let old = func.append(OpKind::AsyncSplat { pattern: ScalarExpr::constant(ElementType::int(8), 0), size: n.into() }, "x");
        let x = func.op(old).result();
        let user = func.append(fill(x), "y");

        let new = func.replace_op(old, OpKind::AsyncSplat { pattern: ScalarExpr::constant(ElementType::int(8), 1), size: n.into() });
        let x2 = func.op(new).result();
        assert_eq!(func.value(x2).name, "x");
        assert_eq!(func.uses(x2), &[user]);
        assert!(!func.has_uses(x));
        assert_eq!(func.body(), &[new, user]);
        assert_eq!(func.uses(n), &[new]);
    }

    #[test]
    fn test_replace_index_uses_folds() {
        let mut func = Function::new("f", FuncKind::Func);
        let sizeof = func.append(
            OpKind::TensorSizeOf { desc: TensorDesc::fixed(TensorType::of(&[4], ElementType::int(32))) },
            "size",
        );
        let size = func.op(sizeof).result();
        let user = func.append(
            OpKind::AsyncSplat { pattern: ScalarExpr::constant(ElementType::int(8), 0), size: size.into() },
            "r",
        );
        func.replace_index_uses(size, &IndexExpr::Const(16));
        func.erase_op(sizeof);
        assert_eq!(func.op(user).kind.result_size(), Some(&IndexExpr::Const(16)));
        assert_eq!(func.body(), &[user]);
    }

    #[test]
    fn test_unique_names() {
        let mut func = Function::new("f", FuncKind::Func);
        let a = func.add_arg("a", Type::Index);
        let b = func.add_arg("a", Type::Index);
        assert_eq!(func.value(a).name, "a");
        assert_eq!(func.value(b).name, "a_1");
    }
}
