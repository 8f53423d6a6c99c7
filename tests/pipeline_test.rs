//! End-to-end tests of the lowering pipeline.

use bumpalo::Bump;
use streamc::core::{CompilationSession, CompileError, PipelineOptions, StatisticsFormat};
use streamc::ir::{ElementType, Elements, Function, IndexExpr, Lifetime, Module, OpId, OpKind, ScalarExpr};
use streamc::pipeline::{Pipeline, Stage};

const SLICE_INTO_BINDING: &str = r#"
func @main(%binding: external) {
  %c = tensor.constant {result = tensor<1000xi1>, value = dense<0> : i1}
  %f = tensor.fill(%c) {target = tensor<1000xi1>, target_size = 1000, start = [0], lengths = [1000], value = 1 : i1}
  %s = tensor.slice(%f) {source = tensor<1000xi1>, source_size = 1000, start = [10], lengths = [10], result = tensor<10xi1>, result_size = 10}
  %b = tensor.import(%binding) {result = tensor<1000xi1>}
  %u = tensor.update(%b, %s) {target = tensor<1000xi1>, target_size = 1000, start = [10], update = tensor<10xi1>, update_size = 10}
  %e = tensor.export(%u) {source = tensor<1000xi1>, source_size = 1000}
  return(%e)
}
"#;

const DISPATCH_TWO_TRANSIENTS: &str = r#"
executable @add(%lhs: binding, %rhs: binding, %out: binding) {
  %l = binding.subspan(%lhs) {offset = 0, type = tensor<16xi8>}
  %r = binding.subspan(%rhs) {offset = 0, type = tensor<16xi8>}
  %o = binding.subspan(%out) {offset = 0, type = tensor<16xi8>}
  %x = dispatch.load(%l)
  %y = dispatch.load(%r)
  %z = dispatch.compute(%x, %y) {name = "add", type = tensor<16xi8>}
  dispatch.store(%z, %o)
}

func @main() {
  %a = tensor.splat {result = tensor<16xi8>, result_size = 16, value = 1 : i8}
  %b = tensor.splat {result = tensor<16xi8>, result_size = 16, value = 2 : i8}
  %r = tensor.dispatch(%a, %b) {entry = @add, operands = [tensor<16xi8>, tensor<16xi8>], operand_sizes = [16, 16], result = tensor<16xi8>, result_size = 16}
  %e = tensor.export(%r) {source = tensor<16xi8>, source_size = 16}
  return(%e)
}
"#;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn find(func: &Function, name: &str) -> OpId {
    func.walk()
        .into_iter()
        .find(|&op| func.op(op).name() == name)
        .unwrap_or_else(|| panic!("no {name} in\n{func}"))
}

fn compile(text: &str, options: PipelineOptions) -> (Module, streamc::SessionStats) {
    init_logging();
    let mut module = Module::parse(text).unwrap();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    Pipeline::new(options).run(&mut module, &session).unwrap();
    (module, session.finish())
}

#[test]
fn test_slice_into_external_binding() {
    let (module, stats) = compile(SLICE_INTO_BINDING, PipelineOptions::default());
    let func = module.function("main").unwrap();

    for op in func.walk() {
        let node = func.op(op);
        assert!(!node.kind.is_tensor_op(), "{} survived encoding", node.name());
        if node.kind.is_async() {
            assert!(node.parent.is_some(), "{} is outside any wave", node.name());
            assert!(!node.ranges.is_empty(), "{} has no resolved ranges", node.name());
        }
    }

    match &func.op(find(func, "async.constant")).kind {
        OpKind::AsyncConstant { value, size } => {
            assert_eq!(value.element, ElementType::int(8));
            assert_eq!(value.elements, Elements::Splat(0));
            assert_eq!(size, &IndexExpr::Const(1000));
        }
        other => panic!("unexpected {}", other.name()),
    }

    match &func.op(find(func, "async.fill")).kind {
        OpKind::AsyncFill { pattern, length, .. } => {
            assert_eq!(pattern, &ScalarExpr::constant(ElementType::int(8), 1));
            assert_eq!(length, &IndexExpr::Const(1000));
        }
        other => panic!("unexpected {}", other.name()),
    }

    match &func.op(find(func, "async.slice")).kind {
        OpKind::AsyncSlice { offset, end, length, .. } => {
            assert_eq!(offset, &IndexExpr::Const(10));
            assert_eq!(end, &IndexExpr::Const(20));
            assert_eq!(length, &IndexExpr::Const(10));
        }
        other => panic!("unexpected {}", other.name()),
    }

    let import = func.op(find(func, "resource.import")).result();
    let update = func.op(find(func, "async.update"));
    assert_eq!(update.ranges[0].storage, import);
    assert_eq!(update.ranges[0].offset, IndexExpr::Const(10));
    assert_eq!(update.ranges[0].end, IndexExpr::Const(20));

    // The constant is immutable, so the fill works on a copy of it.
    assert_eq!(stats.copies_materialized, 1);
    assert_eq!(stats.constants_packed, 1);
    assert_eq!(stats.constant_bytes, 1000);
    assert!(stats.ops_skipped.is_empty());
}

#[test]
fn test_constant_upload_and_transient_arena_lead_the_body() {
    let (module, _) = compile(SLICE_INTO_BINDING, PipelineOptions::default());
    let func = module.function("main").unwrap();
    let body = func.body();
    match &func.op(body[0]).kind {
        OpKind::ResourceConstants { data, slices } => {
            assert_eq!(data.len(), 1000);
            assert_eq!(slices.len(), 1);
        }
        other => panic!("unexpected {}", other.name()),
    }
    match &func.op(body[1]).kind {
        OpKind::ResourceAlloc { lifetime, slices, .. } => {
            assert_eq!(*lifetime, Lifetime::Transient);
            assert_eq!(slices.len(), 2);
        }
        other => panic!("unexpected {}", other.name()),
    }
    assert!(matches!(func.op(*body.last().unwrap()).kind, OpKind::Return { .. }));
}

#[test]
fn test_printed_output_reparses() {
    let (module, _) = compile(SLICE_INTO_BINDING, PipelineOptions::default());
    let printed = module.to_string();
    let reparsed = Module::parse(&printed).unwrap();
    assert_eq!(reparsed.to_string(), printed);
}

#[test]
fn test_unsupported_pattern_aborts_after_encoding() {
    init_logging();
    let mut module = Module::parse(
        r#"
func @main() {
  %a = tensor.splat {result = tensor<4xi12>, result_size = 8, value = 1 : i12}
  return(%a)
}
"#,
    )
    .unwrap();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let err = Pipeline::new(PipelineOptions::default()).run(&mut module, &session).unwrap_err();
    match err {
        CompileError::Unlowered { stage, ops } => {
            assert_eq!(stage, "encode");
            assert_eq!(ops.len(), 1);
            assert!(ops[0].contains("tensor.splat"), "{ops:?}");
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(session.diagnostics().len(), 1);
}

#[test]
fn test_statistics_are_written_to_file() {
    let dir = std::env::temp_dir().join(format!("streamc-stats-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("stats.csv");
    let options = PipelineOptions {
        dump_statistics_format: StatisticsFormat::Csv,
        dump_statistics_file: Some(path.clone()),
        ..Default::default()
    };
    compile(SLICE_INTO_BINDING, options);
    let csv = std::fs::read_to_string(&path).unwrap();
    assert!(csv.starts_with("statistic,value\n"));
    assert!(csv.contains("copies_materialized,1\n"), "{csv}");
    assert!(csv.contains("constant_bytes,1000\n"), "{csv}");
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_run_until_schedule_leaves_storage_unplanned() {
    init_logging();
    let mut module = Module::parse(SLICE_INTO_BINDING).unwrap();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    Pipeline::new(PipelineOptions::default()).until(Stage::Schedule).run(&mut module, &session).unwrap();
    let func = module.function("main").unwrap();
    assert!(func.walk().iter().all(|&op| !matches!(
        func.op(op).kind,
        OpKind::ResourceAlloc { .. } | OpKind::ResourceConstants { .. }
    )));
    assert!(func.walk().iter().all(|&op| func.op(op).ranges.is_empty()));
    assert!(session.stats().waves_formed > 0);
}

#[test]
fn test_initializers_share_one_schedule() {
    let (module, _) = compile(
        r#"
global @a : resource<variable>
global @b : resource<variable>

initializer @init_a() {
  %x = tensor.splat {result = tensor<16xi8>, result_size = 16, value = 1 : i8}
  global.store(%x) {global = @a}
  return()
}

initializer @init_b() {
  %y = tensor.splat {result = tensor<16xi8>, result_size = 16, value = 2 : i8}
  global.store(%y) {global = @b}
  return()
}
"#,
        PipelineOptions::default(),
    );
    assert_eq!(module.functions.len(), 1);
    let init = &module.functions[0];
    let waves: Vec<_> = init.body().iter().filter(|&&op| matches!(init.op(op).kind, OpKind::Wave { .. })).collect();
    // Both splats are independent and land in the same wave.
    assert_eq!(waves.len(), 1);
    match &init.op(*waves[0]).kind {
        OpKind::Wave { members, .. } => assert_eq!(members.len(), 2),
        other => panic!("unexpected {}", other.name()),
    }
}

#[test]
fn test_dispatch_operands_in_one_arena_share_a_binding() {
    let options = PipelineOptions { optimize_bindings: true, ..Default::default() };
    let (module, stats) = compile(DISPATCH_TWO_TRANSIENTS, options);
    let func = module.function("main").unwrap();

    let arena = func
        .body()
        .iter()
        .find(|&&op| matches!(func.op(op).kind, OpKind::ResourceAlloc { .. }))
        .map(|&op| func.op(op).result())
        .unwrap();
    let dispatch = func.op(find(func, "async.dispatch"));
    match &dispatch.kind {
        OpKind::AsyncDispatch { entry, bindings, .. } => {
            assert_eq!(entry, "add");
            assert_eq!(bindings, &vec![0, 0]);
        }
        other => panic!("unexpected {}", other.name()),
    }
    // Both operands live in the transient arena at different offsets; the
    // exported result keeps its own storage.
    assert_eq!(dispatch.ranges[0].storage, arena);
    assert_eq!(dispatch.ranges[1].storage, arena);
    let mut offsets = vec![dispatch.ranges[0].offset.clone(), dispatch.ranges[1].offset.clone()];
    offsets.sort_by_key(|offset| offset.constant());
    assert_eq!(offsets, vec![IndexExpr::Const(0), IndexExpr::Const(16)]);
    assert_eq!(dispatch.ranges[2].storage, dispatch.result());
    assert_eq!(stats.bindings_fused, 1);
    assert_eq!(stats.ops_encoded.get("tensor.dispatch"), Some(&1));
}

#[test]
fn test_dispatch_bindings_are_left_alone_by_default() {
    let (module, stats) = compile(DISPATCH_TWO_TRANSIENTS, PipelineOptions::default());
    let func = module.function("main").unwrap();
    match &func.op(find(func, "async.dispatch")).kind {
        OpKind::AsyncDispatch { bindings, .. } => assert!(bindings.is_empty()),
        other => panic!("unexpected {}", other.name()),
    }
    assert_eq!(stats.bindings_fused, 0);
}
