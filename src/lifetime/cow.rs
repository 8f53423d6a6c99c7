//! Copy-on-write materialization and elision.
//!
//! Materialization is deliberately blunt: every in-place mutator whose target
//! is still referenced elsewhere, or whose target is immutable storage, gets
//! a fresh `async.clone` to mutate instead. Elision then removes the clones
//! whose source is provably dead after the copy point.

use hashbrown::HashMap;

use crate::core::CompilationSession;
use crate::ir::{Function, OpId, OpKind, ValueId};

/// Values backed by storage that must never be mutated in place.
pub(crate) fn is_pinned(func: &Function, value: ValueId) -> bool {
    func.def_op(value).is_some_and(|op| {
        matches!(func.op(op).kind, OpKind::AsyncConstant { .. } | OpKind::GlobalLoad { .. })
    })
}

fn needs_copy(func: &Function, target: ValueId) -> bool {
    func.uses(target).len() > 1 || is_pinned(func, target)
}

/// Inserts copies until no mutator targets a shared or immutable value.
/// Returns the number of copies inserted.
pub fn materialize_copy_on_write(func: &mut Function, session: &CompilationSession) -> usize {
    let mut total = 0;
    loop {
        let inserted = materialize_once(func, session);
        if inserted == 0 {
            return total;
        }
        total += inserted;
    }
}

fn materialize_once(func: &mut Function, session: &CompilationSession) -> usize {
    let mut inserted = 0;
    for op in func.walk() {
        let Some(target) = func.op(op).kind.tied_target() else {
            continue;
        };
        if !needs_copy(func, target) {
            continue;
        }
        let Some(size) = func.op(op).kind.result_size().cloned() else {
            continue;
        };
        let name = format!("{}_cow", func.value(target).name);
        let clone = func.insert_before(
            op,
            OpKind::AsyncClone { source: target, source_size: size.clone(), result_size: size },
            &name,
        );
        func.set_affinity(clone, func.op(op).affinity.clone());
        let copy = func.op(clone).result();
        func.replace_uses_where(target, copy, |user| user == op);
        log::debug!("@{}: materialized copy %{} for {}", func.name, name, func.op(op).name());
        session.record_copy_materialized();
        inserted += 1;
    }
    inserted
}

/// Whether an earlier use of `source` could observe a mutation of it made
/// after the use.
pub(crate) fn observes_later_mutation(func: &Function, user: OpId, source: ValueId) -> bool {
    let kind = &func.op(user).kind;
    match kind {
        OpKind::Return { .. } | OpKind::ResourceExport { .. } | OpKind::GlobalStore { .. } => true,
        _ => kind.tied_target() == Some(source),
    }
}

/// Removes clones whose source has no reads after the copy point.
/// Returns the number of clones removed.
pub fn elide_copies(func: &mut Function, session: &CompilationSession) -> usize {
    let order: HashMap<OpId, usize> = func.walk().into_iter().enumerate().map(|(i, op)| (op, i)).collect();
    let mut elided = 0;
    for op in func.walk() {
        let OpKind::AsyncClone { source, .. } = func.op(op).kind else {
            continue;
        };
        if is_pinned(func, source) {
            continue;
        }
        let position = order[&op];
        let redundant = func
            .uses(source)
            .iter()
            .filter(|&&user| user != op)
            .all(|&user| order[&user] < position && !observes_later_mutation(func, user, source));
        if !redundant {
            continue;
        }
        let copy = func.op(op).result();
        log::debug!("@{}: elided copy %{} of %{}", func.name, func.value(copy).name, func.value(source).name);
        func.replace_all_uses(copy, source);
        func.erase_op(op);
        session.record_copy_elided();
        elided += 1;
    }
    elided
}

#[cfg(test)]
mod tests {
    use bumpalo::Bump;

    use super::*;
    use crate::ir::Module;

    fn names(func: &Function) -> Vec<&'static str> {
        func.walk().iter().map(|&op| func.op(op).name()).collect()
    }

    #[test]
    fn test_shared_target_gets_copy() {
        let mut module = Module::parse(
            r#"
func @main() {
  %a = async.splat {pattern = 1 : i8, size = 16}
  %b = async.fill(%a) {target_size = 16, offset = 0, end = 4, length = 4, pattern = 0 : i8}
  return(%a, %b)
}
"#,
        )
        .unwrap();
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let func = &mut module.functions[0];
        assert_eq!(materialize_copy_on_write(func, &session), 1);
        assert_eq!(names(func), vec!["async.splat", "async.clone", "async.fill", "return"]);
        assert_eq!(elide_copies(func, &session), 0);

        let fill = func.op(func.body()[2]);
        let copy = func.op(func.body()[1]).result();
        assert_eq!(fill.kind.tied_target(), Some(copy));
        assert_eq!(func.value(copy).name, "a_cow");
        assert_eq!(session.stats().copies_materialized, 1);
    }

    #[test]
    fn test_copy_after_last_read_is_elided() {
        let mut module = Module::parse(
            r#"
func @main() {
  %a = async.splat {pattern = 1 : i8, size = 16}
  %x = async.load(%a) {source_size = 16, offset = 0, type = i8}
  %b = async.fill(%a) {target_size = 16, offset = 0, end = 4, length = 4, pattern = 0 : i8}
  return(%b)
}
"#,
        )
        .unwrap();
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let func = &mut module.functions[0];
        materialize_copy_on_write(func, &session);
        assert_eq!(names(func), vec!["async.splat", "async.load", "async.clone", "async.fill", "return"]);
        assert_eq!(elide_copies(func, &session), 1);
        assert_eq!(names(func), vec!["async.splat", "async.load", "async.fill", "return"]);

        let a = func.op(func.body()[0]).result();
        assert_eq!(func.op(func.body()[2]).kind.tied_target(), Some(a));
    }

    #[test]
    fn test_constants_are_never_mutated_in_place() {
        let mut module = Module::parse(
            r#"
func @main() {
  %c = async.constant {value = dense<[1, 2, 3, 4]> : i8, size = 4}
  %d = async.store(%c) {target_size = 4, offset = 0, value = 9 : i8}
  return(%d)
}
"#,
        )
        .unwrap();
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let func = &mut module.functions[0];
        assert_eq!(materialize_copy_on_write(func, &session), 1);
        assert_eq!(elide_copies(func, &session), 0);
        assert_eq!(names(func), vec!["async.constant", "async.clone", "async.store", "return"]);
    }

    #[test]
    fn test_exported_source_keeps_its_copy() {
        let mut module = Module::parse(
            r#"
func @main() {
  %a = async.splat {pattern = 1 : i8, size = 16}
  %e = resource.export(%a) {size = 16}
  %b = async.fill(%a) {target_size = 16, offset = 0, end = 4, length = 4, pattern = 0 : i8}
  return(%e, %b)
}
"#,
        )
        .unwrap();
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let func = &mut module.functions[0];
        materialize_copy_on_write(func, &session);
        assert_eq!(elide_copies(func, &session), 0);
        assert_eq!(session.stats().copies_elided, 0);
    }
}
