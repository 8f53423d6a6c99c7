// This module implements the Tensor Encoder, the first stage of the pipeline. Host
// functions and initializers have every logical tensor op rewritten into its byte-level
// resource/async form: shapes become byte sizes, index tuples become row-major byte
// offsets, sub-byte integer elements are widened to their aligned storage width and
// splat/fill patterns are canonicalized to 8, 16, 32 or 64 bit integers. Executables have
// their binding views widened, with an explicit truncation after every dispatch load and
// an explicit extension before every dispatch store. Each op kind maps to one rewrite
// function selected by a match. A rewrite either replaces the op completely or fails with an
// EncodeError before touching the function; failures are recorded in the session and the
// op is left for the post-encoding verifier to report.

//! Tensor Encoder.

pub mod layout;

use crate::core::{CompilationSession, EncodeError};
use crate::ir::{
    ConstantData, Function, IndexExpr, Module, OpId, OpKind, ScalarExpr, TensorDesc, Type, ValueId,
};

use layout::{
    align_element_type, align_tensor_type, calculate_element_byte_offset, calculate_element_count,
    canonicalize_fill_pattern, check_encoding, element_byte_size, needs_i64_emulation,
};

/// Runs the host and device encoders over every function of the module.
pub fn encode_module(module: &mut Module, session: &CompilationSession) {
    for func in module.host_functions_mut() {
        encode_host_tensors(func, session);
    }
    for func in module.executables_mut() {
        encode_device_tensors(func, session);
    }
}

/// Rewrites every `tensor.*` op of a host function into its byte-level form.
pub fn encode_host_tensors(func: &mut Function, session: &CompilationSession) {
    session.set_current_function(&func.name);
    session.record_function_processed();

    let tensor_ops: Vec<OpId> = func.walk().into_iter().filter(|&id| func.op(id).kind.is_tensor_op()).collect();
    for op in tensor_ops {
        let name = func.op(op).name();
        match encode_op(func, op) {
            Ok(()) => {
                log::debug!("@{}: encoded {name}", func.name);
                session.record_encoded(name);
            }
            Err(reason) => session.record_skipped(op, name, reason),
        }
    }
}

fn encode_op(func: &mut Function, op: OpId) -> Result<(), EncodeError> {
    use OpKind::*;
    let kind = func.op(op).kind.clone();
    match kind {
        TensorImport { source, result } => encode_import(func, op, source, &result),
        TensorExport { source, source_desc, source_size } => encode_export(func, op, source, &source_desc, source_size),
        TensorSizeOf { desc } => encode_sizeof(func, op, &desc),
        TensorConstant { result, value } => encode_constant(func, op, &result, &value),
        TensorSplat { result, result_size, value } => encode_splat(func, op, &result, result_size, value),
        TensorClone { source, source_desc, source_size, result, result_size } => {
            check_encoding(&source_desc.ty)?;
            check_encoding(&result.ty)?;
            func.replace_op(op, AsyncClone { source, source_size, result_size });
            Ok(())
        }
        TensorSlice { source, source_desc, source_size, start, lengths: _, result, result_size } => {
            check_encoding(&source_desc.ty)?;
            check_encoding(&result.ty)?;
            let offset = calculate_element_byte_offset(&source_desc, &start);
            let end = IndexExpr::add(offset.clone(), result_size.clone());
            func.replace_op(op, AsyncSlice { source, source_size, offset, end, length: result_size });
            Ok(())
        }
        TensorFill { target, target_desc, target_size, start, lengths, value } => {
            encode_fill(func, op, target, &target_desc, target_size, &start, &lengths, value)
        }
        TensorUpdate { target, target_desc, target_size, start, update, update_desc, update_size } => {
            check_encoding(&target_desc.ty)?;
            check_encoding(&update_desc.ty)?;
            let offset = calculate_element_byte_offset(&target_desc, &start);
            let end = IndexExpr::add(offset.clone(), update_size.clone());
            func.replace_op(op, AsyncUpdate { target, target_size, offset, end, update, update_size });
            Ok(())
        }
        TensorLoad { source, source_desc, source_size, indices } => {
            encode_load(func, op, source, &source_desc, source_size, &indices)
        }
        TensorStore { target, target_desc, target_size, indices, value } => {
            check_encoding(&target_desc.ty)?;
            let offset = calculate_element_byte_offset(&target_desc, &indices);
            let aligned = align_element_type(target_desc.ty.element);
            let value = value.extu(aligned);
            func.replace_op(op, AsyncStore { target, target_size, offset, value });
            Ok(())
        }
        TensorDispatch { entry, operands, operand_descs, operand_sizes, result, result_size } => {
            for desc in operand_descs.iter().chain([&result]) {
                check_encoding(&desc.ty)?;
            }
            func.replace_op(op, AsyncDispatch { entry, operands, operand_sizes, result_size, bindings: Vec::new() });
            Ok(())
        }
        other => Err(EncodeError::NotHandled { op: other.name() }),
    }
}

fn encode_import(func: &mut Function, op: OpId, source: ValueId, result: &TensorDesc) -> Result<(), EncodeError> {
    check_encoding(&result.ty)?;
    let size = calculate_element_count(result, element_byte_size(result.ty.element));
    func.replace_op(op, OpKind::ResourceImport { source, size });
    Ok(())
}

fn encode_export(
    func: &mut Function,
    op: OpId,
    source: ValueId,
    source_desc: &TensorDesc,
    source_size: IndexExpr,
) -> Result<(), EncodeError> {
    check_encoding(&source_desc.ty)?;
    func.replace_op(op, OpKind::ResourceExport { source, size: source_size });
    Ok(())
}

/// Folds the byte size into every index expression using the result.
fn encode_sizeof(func: &mut Function, op: OpId, desc: &TensorDesc) -> Result<(), EncodeError> {
    check_encoding(&desc.ty)?;
    let result = func.op(op).result();
    // Only index expressions can absorb the size; a direct value use would dangle.
    if func.uses(result).iter().any(|&user| uses_directly(func, user, result)) {
        return Err(EncodeError::NotHandled { op: "tensor.sizeof with non-index users" });
    }
    let size = calculate_element_count(desc, element_byte_size(desc.ty.element));
    func.replace_index_uses(result, &size);
    func.erase_op(op);
    Ok(())
}

fn uses_directly(func: &Function, user: OpId, value: ValueId) -> bool {
    let mut kind = func.op(user).kind.clone();
    let mut found = false;
    kind.for_each_value_mut(&mut |v| found |= *v == value);
    found || func.op(user).awaits.contains(&value)
}

fn encode_constant(func: &mut Function, op: OpId, result: &TensorDesc, value: &ConstantData) -> Result<(), EncodeError> {
    check_encoding(&result.ty)?;
    let aligned = align_element_type(value.element);
    // Element bits are stored masked to their width, so widening is a zero extension.
    let value = if aligned != value.element { value.map(aligned, |bits| bits) } else { value.clone() };
    let size = calculate_element_count(result, element_byte_size(aligned));
    func.replace_op(op, OpKind::AsyncConstant { value, size });
    Ok(())
}

fn encode_splat(
    func: &mut Function,
    op: OpId,
    result: &TensorDesc,
    result_size: IndexExpr,
    value: ScalarExpr,
) -> Result<(), EncodeError> {
    check_encoding(&result.ty)?;
    let pattern = canonicalize_fill_pattern(value)?;
    let kind = if needs_i64_emulation(&pattern) {
        OpKind::BuiltinSplatI64 { pattern, size: result_size }
    } else {
        OpKind::AsyncSplat { pattern, size: result_size }
    };
    func.replace_op(op, kind);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn encode_fill(
    func: &mut Function,
    op: OpId,
    target: ValueId,
    target_desc: &TensorDesc,
    target_size: IndexExpr,
    start: &[IndexExpr],
    lengths: &[IndexExpr],
    value: ScalarExpr,
) -> Result<(), EncodeError> {
    check_encoding(&target_desc.ty)?;
    let offset = calculate_element_byte_offset(target_desc, start);
    let length = calculate_element_byte_offset(target_desc, lengths);
    let end = IndexExpr::add(offset.clone(), length.clone());
    let pattern = canonicalize_fill_pattern(value)?;
    let kind = if needs_i64_emulation(&pattern) {
        OpKind::BuiltinFillI64 { target, target_size, offset, end, length, pattern }
    } else {
        OpKind::AsyncFill { target, target_size, offset, end, length, pattern }
    };
    func.replace_op(op, kind);
    Ok(())
}

/// Loads read the aligned storage element and truncate it back to the logical type.
fn encode_load(
    func: &mut Function,
    op: OpId,
    source: ValueId,
    source_desc: &TensorDesc,
    source_size: IndexExpr,
    indices: &[IndexExpr],
) -> Result<(), EncodeError> {
    check_encoding(&source_desc.ty)?;
    let logical = source_desc.ty.element;
    let aligned = align_element_type(logical);
    let offset = calculate_element_byte_offset(source_desc, indices);
    let load = func.replace_op(op, OpKind::AsyncLoad { source, source_size, offset, ty: aligned });
    if aligned != logical {
        let loaded = func.op(load).result();
        let name = func.value(loaded).name.clone();
        let trunc = func.insert_after(load, OpKind::TruncI { source: loaded, to: logical }, &name);
        let truncated = func.op(trunc).result();
        func.replace_uses_where(loaded, truncated, |user| user != trunc);
    }
    Ok(())
}

/// Widens binding views of an executable to byte-aligned element types.
pub fn encode_device_tensors(func: &mut Function, session: &CompilationSession) {
    session.set_current_function(&func.name);
    session.record_function_processed();

    let ops = func.walk();
    // Views first: dispatch loads take their storage type from the view.
    for &op in &ops {
        if let OpKind::BindingSubspan { binding, offset, ty } = func.op(op).kind.clone() {
            let aligned = align_tensor_type(&ty);
            if aligned == ty {
                continue;
            }
            func.set_kind(op, OpKind::BindingSubspan { binding, offset, ty: aligned.clone() });
            func.set_value_type(func.op(op).result(), Type::View(aligned));
            session.record_encoded("binding.subspan");
        }
    }
    for &op in &ops {
        match func.op(op).kind.clone() {
            OpKind::DispatchLoad { source } => {
                if encode_dispatch_load(func, op, source) {
                    session.record_encoded("dispatch.load");
                }
            }
            OpKind::DispatchStore { value, target } => {
                if encode_dispatch_store(func, op, value, target) {
                    session.record_encoded("dispatch.store");
                }
            }
            _ => {}
        }
    }
}

fn encode_dispatch_load(func: &mut Function, op: OpId, source: ValueId) -> bool {
    let result = func.op(op).result();
    let Type::Tensor(logical) = func.value_type(result).clone() else {
        panic!("dispatch.load result is not a tensor");
    };
    let storage = match func.value_type(source) {
        Type::View(ty) => ty.clone(),
        other => panic!("dispatch.load from non-view value of type {other}"),
    };
    if storage.element == logical.element {
        return false;
    }
    assert!(
        logical.element.bit_width() < storage.element.bit_width(),
        "loads must truncate: {} loaded as {}",
        storage,
        logical
    );
    func.set_value_type(result, Type::Tensor(storage));
    let name = func.value(result).name.clone();
    let trunc = func.insert_after(op, OpKind::TruncI { source: result, to: logical.element }, &name);
    let truncated = func.op(trunc).result();
    func.replace_uses_where(result, truncated, |user| user != trunc);
    true
}

fn encode_dispatch_store(func: &mut Function, op: OpId, value: ValueId, target: ValueId) -> bool {
    let Type::Tensor(logical) = func.value_type(value).clone() else {
        panic!("dispatch.store of a non-tensor value");
    };
    let storage = match func.value_type(target) {
        Type::View(ty) => ty.clone(),
        other => panic!("dispatch.store into non-view value of type {other}"),
    };
    if storage.element == logical.element {
        return false;
    }
    assert!(
        logical.element.bit_width() < storage.element.bit_width(),
        "stores must extend: {} stored into {}",
        logical,
        storage
    );
    let name = func.value(value).name.clone();
    let ext = func.insert_before(op, OpKind::ExtUI { source: value, to: storage.element }, &name);
    let extended = func.op(ext).result();
    func.set_kind(op, OpKind::DispatchStore { value: extended, target });
    true
}

#[cfg(test)]
mod tests {
    use bumpalo::Bump;

    use super::*;
    use crate::ir::{ElementType, Elements, Module};

    fn encode(text: &str) -> (Module, crate::core::SessionStats) {
        let mut module = Module::parse(text).unwrap();
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        encode_module(&mut module, &session);
        (module, session.finish())
    }

    fn kinds(func: &Function) -> Vec<&'static str> {
        func.walk().iter().map(|&op| func.op(op).name()).collect()
    }

    #[test]
    fn test_sub_byte_constant_is_widened() {
        let (module, stats) = encode(
            r#"
func @main() {
  %c = tensor.constant {result = tensor<1000xi1>, value = dense<1> : i1}
  return(%c)
}
"#,
        );
        let func = &module.functions[0];
        let op = func.op(func.body()[0]);
        match &op.kind {
            OpKind::AsyncConstant { value, size } => {
                assert_eq!(value.element, ElementType::int(8));
                assert_eq!(value.elements, Elements::Splat(1));
                assert_eq!(size, &IndexExpr::Const(1000));
            }
            other => panic!("unexpected {}", other.name()),
        }
        assert_eq!(func.value(op.result()).name, "c");
        assert_eq!(stats.ops_encoded.get("tensor.constant"), Some(&1));
    }

    #[test]
    fn test_sizeof_folds_into_users() {
        let (module, _) = encode(
            r#"
func @main(%n: index) {
  %size = tensor.sizeof {desc = tensor<?x4xi32>{%n}}
  %s = tensor.splat {result = tensor<?x4xi32>{%n}, result_size = %size, value = 0 : i32}
  return(%s)
}
"#,
        );
        let func = &module.functions[0];
        assert_eq!(kinds(func), vec!["async.splat", "return"]);
        let n = func.args[0];
        let expected = IndexExpr::mul(IndexExpr::Const(16), IndexExpr::Value(n));
        assert_eq!(func.op(func.body()[0]).kind.result_size(), Some(&expected));
    }

    #[test]
    fn test_slice_and_update_offsets() {
        let (module, _) = encode(
            r#"
func @main(%in: external) {
  %a = tensor.import(%in) {result = tensor<1000xi8>}
  %s = tensor.slice(%a) {source = tensor<1000xi8>, source_size = 1000, start = [10], lengths = [10], result = tensor<10xi8>, result_size = 10}
  %b = tensor.update(%a, %s) {target = tensor<1000xi8>, target_size = 1000, start = [10], update = tensor<10xi8>, update_size = 10}
  return(%b)
}
"#,
        );
        let func = &module.functions[0];
        assert_eq!(kinds(func), vec!["resource.import", "async.slice", "async.update", "return"]);
        match &func.op(func.body()[1]).kind {
            OpKind::AsyncSlice { offset, end, length, .. } => {
                assert_eq!((offset, end, length), (&IndexExpr::Const(10), &IndexExpr::Const(20), &IndexExpr::Const(10)));
            }
            other => panic!("unexpected {}", other.name()),
        }
        match &func.op(func.body()[2]).kind {
            OpKind::AsyncUpdate { offset, end, .. } => {
                assert_eq!((offset, end), (&IndexExpr::Const(10), &IndexExpr::Const(20)));
            }
            other => panic!("unexpected {}", other.name()),
        }
    }

    #[test]
    fn test_dispatch_lowers_to_async_dispatch() {
        let (module, stats) = encode(
            r#"
func @main() {
  %a = tensor.splat {result = tensor<4xi32>, result_size = 16, value = 1 : i32}
  %b = tensor.splat {result = tensor<16xi8>, result_size = 16, value = 2 : i8}
  %r = tensor.dispatch(%a, %b) {entry = @kernel, operands = [tensor<4xi32>, tensor<16xi8>], operand_sizes = [16, 16], result = tensor<8xi8>, result_size = 8}
  return(%r)
}
"#,
        );
        let func = &module.functions[0];
        assert_eq!(kinds(func), vec!["async.splat", "async.splat", "async.dispatch", "return"]);
        let dispatch = func.op(func.body()[2]);
        match &dispatch.kind {
            OpKind::AsyncDispatch { entry, operands, operand_sizes, result_size, bindings } => {
                assert_eq!(entry, "kernel");
                assert_eq!(operands, &vec![func.op(func.body()[0]).result(), func.op(func.body()[1]).result()]);
                assert_eq!(operand_sizes, &vec![IndexExpr::Const(16), IndexExpr::Const(16)]);
                assert_eq!(result_size, &IndexExpr::Const(8));
                assert!(bindings.is_empty());
            }
            other => panic!("unexpected {}", other.name()),
        }
        assert_eq!(func.value(dispatch.result()).name, "r");
        assert_eq!(stats.ops_encoded.get("tensor.dispatch"), Some(&1));
    }

    #[test]
    fn test_dispatch_with_unsupported_operand_is_skipped() {
        let (module, stats) = encode(
            r#"
func @main() {
  %a = tensor.splat {result = tensor<4xi8>, result_size = 4, value = 1 : i8}
  %r = tensor.dispatch(%a) {entry = @kernel, operands = [tensor<4xi8, #packed>], operand_sizes = [4], result = tensor<4xi8>, result_size = 4}
  return(%r)
}
"#,
        );
        let func = &module.functions[0];
        assert_eq!(func.op(func.body()[1]).name(), "tensor.dispatch");
        assert_eq!(stats.ops_skipped.get("tensor.dispatch"), Some(&1));
    }

    #[test]
    fn test_wide_and_illegal_patterns() {
        let (module, stats) = encode(
            r#"
func @main() {
  %a = tensor.splat {result = tensor<4xi64>, result_size = 32, value = 7 : i64}
  %b = tensor.splat {result = tensor<4xi7>, result_size = 4, value = 3 : i7}
  %c = tensor.splat {result = tensor<4xf32>, result_size = 16, value = 1.0 : f32}
  return(%a, %b, %c)
}
"#,
        );
        let func = &module.functions[0];
        assert_eq!(kinds(func), vec!["builtin.splat_i64", "tensor.splat", "async.splat", "return"]);
        assert_eq!(stats.ops_skipped.get("tensor.splat"), Some(&1));
        match &func.op(func.body()[2]).kind {
            OpKind::AsyncSplat { pattern, .. } => {
                assert_eq!(pattern, &ScalarExpr::constant(ElementType::int(32), 0x3f80_0000));
            }
            other => panic!("unexpected {}", other.name()),
        }
    }

    #[test]
    fn test_skipped_op_records_reason() {
        let mut module = Module::parse(
            r#"
func @main() {
  %a = tensor.splat {result = tensor<4xi8, #sparse>, result_size = 4, value = 0 : i8}
  return(%a)
}
"#,
        )
        .unwrap();
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        encode_module(&mut module, &session);
        let op = module.functions[0].body()[0];
        assert!(matches!(session.skip_reason("main", op), Some(EncodeError::UnsupportedEncoding { .. })));
        assert_eq!(session.diagnostics().len(), 1);
    }

    #[test]
    fn test_sub_byte_load_truncates_and_store_extends() {
        let (module, _) = encode(
            r#"
func @main(%in: external) {
  %a = tensor.import(%in) {result = tensor<8xi1>}
  %x = tensor.load(%a) {source = tensor<8xi1>, source_size = 8, indices = [3]}
  %b = tensor.store(%a) {target = tensor<8xi1>, target_size = 8, indices = [4], value = %x}
  return(%b)
}
"#,
        );
        let func = &module.functions[0];
        assert_eq!(kinds(func), vec!["resource.import", "async.load", "arith.trunci", "async.store", "return"]);
        let load = func.op(func.body()[1]);
        assert_eq!(func.value_type(load.result()), &Type::Scalar(ElementType::int(8)));
        let trunc = func.op(func.body()[2]);
        assert_eq!(func.uses(load.result()), &[func.body()[2]]);
        match &func.op(func.body()[3]).kind {
            OpKind::AsyncStore { offset, value, .. } => {
                assert_eq!(offset, &IndexExpr::Const(4));
                let expected = ScalarExpr::Value { id: trunc.result(), ty: ElementType::int(1) }.extu(ElementType::int(8));
                assert_eq!(value, &expected);
            }
            other => panic!("unexpected {}", other.name()),
        }
    }

    #[test]
    fn test_device_views_are_widened() {
        let (module, stats) = encode(
            r#"
executable @dispatch(%in: binding, %out: binding) {
  %v = binding.subspan(%in) {offset = 0, type = tensor<16xi1>}
  %w = binding.subspan(%out) {offset = 0, type = tensor<16xi1>}
  %t = dispatch.load(%v)
  %r = dispatch.compute(%t) {name = "not", type = tensor<16xi1>}
  dispatch.store(%r, %w)
}
"#,
        );
        let func = &module.functions[0];
        assert_eq!(
            kinds(func),
            vec!["binding.subspan", "binding.subspan", "dispatch.load", "arith.trunci", "dispatch.compute", "arith.extui", "dispatch.store"]
        );
        let wide = crate::ir::TensorType::of(&[16], ElementType::int(8));
        assert_eq!(func.value_type(func.op(func.body()[0]).result()), &Type::View(wide.clone()));
        assert_eq!(func.value_type(func.op(func.body()[2]).result()), &Type::Tensor(wide.clone()));
        assert_eq!(func.value_type(func.op(func.body()[5]).result()), &Type::Tensor(wide));
        assert_eq!(stats.ops_encoded.get("dispatch.store"), Some(&1));
    }
}
