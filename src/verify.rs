//! Structural checks run between pipeline stages.
//!
//! Each check is a yes/no oracle over the whole module: it either returns
//! `Ok(())` or a [`CompileError`] naming every offending op.

use hashbrown::{HashMap, HashSet};

use crate::allocation::Placements;
use crate::core::{CompilationSession, CompileError, CompileResult};
use crate::encode::layout::align_element_type;
use crate::ir::{FuncKind, Function, Lifetime, Module, OpKind, Type};
use crate::lifetime::{analyze_usage, is_pinned, observes_later_mutation};

fn describe(func: &Function, op: crate::ir::OpId) -> String {
    crate::ir::printer::op_to_string(func, op)
}

/// Input programs carry no lowered, scheduled or allocated ops.
pub fn verify_input(module: &Module) -> CompileResult<()> {
    for func in &module.functions {
        for op in func.walk() {
            let kind = &func.op(op).kind;
            let lowered = kind.is_async()
                || matches!(kind, OpKind::Wave { .. } | OpKind::ResourceAlloc { .. } | OpKind::ResourceConstants { .. });
            if lowered {
                return Err(CompileError::Verify {
                    function: func.name.clone(),
                    reason: format!("input already contains '{}'", kind.name()),
                });
            }
            if let OpKind::TensorDispatch { entry, .. } = kind {
                if !module.function(entry).is_some_and(|f| f.kind == FuncKind::Executable) {
                    return Err(CompileError::Verify {
                        function: func.name.clone(),
                        reason: format!("'{}' dispatches to unknown executable @{entry}", describe(func, op)),
                    });
                }
            }
        }
    }
    Ok(())
}

/// No tensor op survives in host code and no sub-byte access survives in executables.
pub fn verify_lowering_to_async(module: &Module, session: &CompilationSession) -> CompileResult<()> {
    let mut unlowered = Vec::new();
    for func in &module.functions {
        for op in func.walk() {
            let kind = &func.op(op).kind;
            if func.kind.is_host() {
                if kind.is_tensor_op() {
                    let reason = session
                        .skip_reason(&func.name, op)
                        .map_or_else(|| "not encoded".to_string(), |reason| reason.to_string());
                    unlowered.push(format!("@{}: {} ({reason})", func.name, kind.name()));
                }
                continue;
            }
            let accessed = match kind {
                OpKind::BindingSubspan { ty, .. } => Some(ty.element),
                OpKind::DispatchLoad { .. } => match func.value_type(func.op(op).result()) {
                    Type::Tensor(ty) => Some(ty.element),
                    _ => None,
                },
                OpKind::DispatchStore { value, .. } => match func.value_type(*value) {
                    Type::Tensor(ty) => Some(ty.element),
                    _ => None,
                },
                _ => None,
            };
            if let Some(element) = accessed {
                if align_element_type(element) != element {
                    unlowered.push(format!("@{}: {} of sub-byte {element}", func.name, kind.name()));
                }
            }
        }
    }
    if unlowered.is_empty() {
        Ok(())
    } else {
        Err(CompileError::Unlowered { stage: "encode", ops: unlowered })
    }
}

/// No in-place mutation is observable and every resource has a refined lifetime.
///
/// A mutator may share its target only with uses that run strictly before it
/// and cannot see the mutation; pinned storage is never a target.
pub fn verify_lifetimes(module: &Module) -> CompileResult<()> {
    let mut unrefined = Vec::new();
    for func in module.functions.iter().filter(|f| f.kind.is_host()) {
        let order = func.walk();
        let position: HashMap<_, usize> = order.iter().enumerate().map(|(i, &op)| (op, i)).collect();
        for &op in &order {
            let Some(target) = func.op(op).kind.tied_target() else {
                continue;
            };
            let shared = func.uses(target).iter().any(|&user| {
                user != op && (position[&user] > position[&op] || observes_later_mutation(func, user, target))
            });
            if shared || is_pinned(func, target) {
                return Err(CompileError::Verify {
                    function: func.name.clone(),
                    reason: format!(
                        "'{}' mutates {} %{} in place",
                        describe(func, op),
                        if shared { "shared" } else { "immutable" },
                        func.value(target).name
                    ),
                });
            }
        }
        let values = func.args.iter().copied().chain(order.iter().flat_map(|&op| func.op(op).results.iter().copied()));
        for value in values {
            if *func.value_type(value) == Type::Resource(Lifetime::Unknown) {
                unrefined.push(format!("@{}: %{} has no refined lifetime", func.name, func.value(value).name));
            }
        }
    }
    if unrefined.is_empty() {
        Ok(())
    } else {
        Err(CompileError::Unlowered { stage: "lifetime", ops: unrefined })
    }
}

/// Every async op is a wave member and every consumer awaits the waves it reads from.
pub fn verify_scheduled(module: &Module) -> CompileResult<()> {
    let mut unscheduled = Vec::new();
    for func in module.functions.iter().filter(|f| f.kind.is_host()) {
        for op in func.walk() {
            let node = func.op(op);
            if node.kind.is_async() && node.parent.is_none() {
                unscheduled.push(format!("@{}: {}", func.name, node.name()));
            }
        }
        if !unscheduled.is_empty() {
            continue;
        }
        for &top in func.body() {
            let node = func.op(top);
            let readers = match &node.kind {
                OpKind::Wave { members, .. } => members.clone(),
                _ => vec![top],
            };
            let awaited: HashSet<_> = node.awaits.iter().copied().collect();
            for reader in readers {
                for value in func.op(reader).kind.operands() {
                    let Some(producer) = func.def_op(value) else {
                        continue;
                    };
                    let Some(wave) = func.op(producer).parent else {
                        continue;
                    };
                    if wave != top && !awaited.contains(&func.op(wave).result()) {
                        return Err(CompileError::Verify {
                            function: func.name.clone(),
                            reason: format!("'{}' does not await the wave producing its operands", describe(func, reader)),
                        });
                    }
                }
            }
        }
    }
    if unscheduled.is_empty() {
        Ok(())
    } else {
        Err(CompileError::Unlowered { stage: "schedule", ops: unscheduled })
    }
}

/// Every owned resource has a placement and every async op has resolved ranges.
pub fn verify_allocated(module: &Module) -> CompileResult<()> {
    let mut unallocated = Vec::new();
    for func in module.functions.iter().filter(|f| f.kind.is_host()) {
        let placements = Placements::collect(func);
        let usage = analyze_usage(func);
        for group in usage.groups() {
            let owned = matches!(group.lifetime, Lifetime::Transient | Lifetime::Constant);
            let is_storage = func
                .def_op(group.root)
                .is_some_and(|op| matches!(func.op(op).kind, OpKind::ResourceAlloc { .. } | OpKind::ResourceConstants { .. }));
            if owned && !is_storage && !placements.contains(group.root) {
                unallocated.push(format!("@{}: %{} has no storage", func.name, func.value(group.root).name));
            }
        }
        for op in func.walk() {
            let node = func.op(op);
            if node.kind.is_async() && node.ranges.is_empty() {
                unallocated.push(format!("@{}: {} has no resolved ranges", func.name, node.name()));
            }
        }
    }
    if unallocated.is_empty() {
        Ok(())
    } else {
        Err(CompileError::Unlowered { stage: "allocate", ops: unallocated })
    }
}

#[cfg(test)]
mod tests {
    use bumpalo::Bump;

    use super::*;

    #[test]
    fn test_input_rejects_lowered_ops() {
        let module = Module::parse("func @main() {\n  %a = async.splat {pattern = 0 : i8, size = 4}\n  return(%a)\n}\n").unwrap();
        let err = verify_input(&module).unwrap_err();
        assert!(err.to_string().contains("async.splat"));
    }

    #[test]
    fn test_unencoded_ops_are_reported_with_reason() {
        let mut module = Module::parse(
            r#"
func @main() {
  %a = tensor.splat {result = tensor<4xi7>, result_size = 4, value = 1 : i7}
  return(%a)
}
"#,
        )
        .unwrap();
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        crate::encode::encode_module(&mut module, &session);
        let err = verify_lowering_to_async(&module, &session).unwrap_err();
        assert_eq!(
            err.to_string(),
            "encode: 1 op(s) were not lowered: @main: tensor.splat (unsupported fill pattern width 7 (not a multiple of 8))"
        );
    }

    #[test]
    fn test_input_rejects_dispatch_to_unknown_executable() {
        let module = Module::parse(
            r#"
func @main() {
  %a = tensor.splat {result = tensor<4xi8>, result_size = 4, value = 1 : i8}
  %r = tensor.dispatch(%a) {entry = @missing, operands = [tensor<4xi8>], operand_sizes = [4], result = tensor<4xi8>, result_size = 4}
  return(%r)
}
"#,
        )
        .unwrap();
        let err = verify_input(&module).unwrap_err();
        assert!(err.to_string().contains("unknown executable @missing"), "{err}");
    }

    fn lower_lifetimes(text: &str) -> Module {
        let mut module = Module::parse(text).unwrap();
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        crate::lifetime::schedule_lifetimes(&mut module, &session);
        module
    }

    #[test]
    fn test_lifetimes_accept_copied_mutators() {
        let module = lower_lifetimes(
            r#"
func @main() {
  %c = async.constant {value = dense<[1, 2, 3, 4]> : i8, size = 4}
  %a = async.splat {pattern = 1 : i8, size = 16}
  %x = async.load(%a) {source_size = 16, offset = 0, type = i8}
  %b = async.fill(%a) {target_size = 16, offset = 0, end = 8, length = 8, pattern = 0 : i8}
  %d = async.store(%c) {target_size = 4, offset = 0, value = %x}
  return(%a, %b, %d)
}
"#,
        );
        verify_lifetimes(&module).unwrap();
    }

    #[test]
    fn test_lifetimes_reject_mutation_of_shared_target() {
        let module = Module::parse(
            r#"
func @main() {
  %a = resource.alloc {size = 16, lifetime = transient}
  %b = async.fill(%a) {target_size = 16, offset = 0, end = 8, length = 8, pattern = 0 : i8}
  return(%a, %b)
}
"#,
        )
        .unwrap();
        let err = verify_lifetimes(&module).unwrap_err();
        assert!(err.to_string().contains("mutates shared %a in place"), "{err}");
    }

    #[test]
    fn test_lifetimes_reject_mutation_of_constant() {
        let module = lower_lifetimes(
            r#"
func @main() {
  %c = async.constant {value = dense<7> : i8, size = 4}
  return(%c)
}
"#,
        );
        verify_lifetimes(&module).unwrap();

        let module = Module::parse(
            r#"
func @main() {
  %c = async.constant {value = dense<7> : i8, size = 4}
  %d = async.fill(%c) {target_size = 4, offset = 0, end = 4, length = 4, pattern = 0 : i8}
  return(%d)
}
"#,
        )
        .unwrap();
        let err = verify_lifetimes(&module).unwrap_err();
        assert!(err.to_string().contains("mutates immutable %c in place"), "{err}");
    }

    #[test]
    fn test_lifetimes_reject_unrefined_resources() {
        let module = Module::parse("func @main() {
  %a = async.splat {pattern = 0 : i8, size = 4}
  return(%a)
}
").unwrap();
        let err = verify_lifetimes(&module).unwrap_err();
        assert_eq!(err.to_string(), "lifetime: 1 op(s) were not lowered: @main: %a has no refined lifetime");
    }

    #[test]
    fn test_missing_await_is_rejected() {
        let module = Module::parse(
            r#"
func @main() {
  %t1 = wave 1 {
    %a = async.splat {pattern = 1 : i8, size = 16}
  }
  %e = resource.export(%a) {size = 16}
  return(%e)
}
"#,
        )
        .unwrap();
        let err = verify_scheduled(&module).unwrap_err();
        assert!(matches!(err, CompileError::Verify { .. }));
    }

    #[test]
    fn test_unscheduled_async_op_is_reported() {
        let module = Module::parse("func @main() {\n  %a = async.splat {pattern = 0 : i8, size = 4}\n  return(%a)\n}\n").unwrap();
        assert!(matches!(verify_scheduled(&module), Err(CompileError::Unlowered { stage: "schedule", .. })));
    }
}
