//! Resource usage refinement.
//!
//! Values that alias through in-place mutators share one storage group. A
//! group is classified once and every member is retyped with the result.

use std::collections::BTreeMap;

use hashbrown::HashMap;

use crate::ir::{Function, Lifetime, OpKind, Type, ValueDef, ValueId};

/// Final usage of one storage group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageGroup {
    pub root: ValueId,
    /// Root first, then tied results in program order.
    pub members: Vec<ValueId>,
    pub lifetime: Lifetime,
    /// Whether any op writes the storage after it is produced.
    pub is_mutated: bool,
}

/// Storage groups of a function, keyed by their root value.
#[derive(Debug, Default)]
pub struct UsageAnalysis {
    roots: HashMap<ValueId, ValueId>,
    groups: BTreeMap<ValueId, StorageGroup>,
}

impl UsageAnalysis {
    pub fn storage_root(&self, value: ValueId) -> ValueId {
        self.roots.get(&value).copied().unwrap_or(value)
    }

    pub fn group(&self, value: ValueId) -> Option<&StorageGroup> {
        self.groups.get(&self.storage_root(value))
    }

    pub fn lifetime(&self, value: ValueId) -> Lifetime {
        self.group(value).map_or(Lifetime::Unknown, |g| g.lifetime)
    }

    pub fn is_mutated(&self, value: ValueId) -> bool {
        self.group(value).is_some_and(|g| g.is_mutated)
    }

    /// Groups in root order.
    pub fn groups(&self) -> impl Iterator<Item = &StorageGroup> {
        self.groups.values()
    }
}

/// Builds storage groups and classifies them without touching the function.
pub fn analyze_usage(func: &Function) -> UsageAnalysis {
    let mut analysis = UsageAnalysis::default();

    for &arg in &func.args {
        if func.value_type(arg).is_resource() {
            analysis.add_root(arg);
        }
    }
    for op in func.walk() {
        let op = func.op(op);
        for &result in &op.results {
            if !func.value_type(result).is_resource() {
                continue;
            }
            match op.kind.tied_target() {
                Some(target) => {
                    let root = analysis.storage_root(target);
                    analysis.roots.insert(result, root);
                    if let Some(group) = analysis.groups.get_mut(&root) {
                        group.members.push(result);
                        group.is_mutated = true;
                    }
                }
                None => analysis.add_root(result),
            }
        }
    }

    let roots: Vec<ValueId> = analysis.groups.keys().copied().collect();
    for root in roots {
        let lifetime = classify(func, &analysis.groups[&root]);
        if let Some(group) = analysis.groups.get_mut(&root) {
            group.lifetime = lifetime;
        }
    }
    analysis
}

impl UsageAnalysis {
    fn add_root(&mut self, value: ValueId) {
        self.roots.insert(value, value);
        self.groups.insert(
            value,
            StorageGroup { root: value, members: vec![value], lifetime: Lifetime::Unknown, is_mutated: false },
        );
    }
}

fn classify(func: &Function, group: &StorageGroup) -> Lifetime {
    let root_def = match func.value(group.root).def {
        ValueDef::Arg(_) => return Lifetime::External,
        ValueDef::Op(op) => &func.op(op).kind,
    };
    match root_def {
        OpKind::ResourceImport { .. } => return Lifetime::External,
        OpKind::ResourceAlloc { lifetime, .. } => return *lifetime,
        _ => {}
    }

    let mut escapes = false;
    let mut global = matches!(root_def, OpKind::GlobalLoad { .. });
    for &member in &group.members {
        for &user in func.uses(member) {
            match &func.op(user).kind {
                OpKind::ResourceExport { .. } | OpKind::Return { .. } => escapes = true,
                OpKind::GlobalStore { .. } => global = true,
                _ => {}
            }
        }
    }

    if escapes {
        Lifetime::External
    } else if global {
        Lifetime::Variable
    } else if matches!(root_def, OpKind::AsyncConstant { .. } | OpKind::ResourceConstants { .. }) && !group.is_mutated {
        Lifetime::Constant
    } else {
        Lifetime::Transient
    }
}

/// Classifies every resource of `func` and retypes it with its lifetime.
pub fn refine_usage(func: &mut Function) -> UsageAnalysis {
    let analysis = analyze_usage(func);
    for group in analysis.groups() {
        log::trace!(
            "@{}: %{} is {} ({} member(s){})",
            func.name,
            func.value(group.root).name,
            group.lifetime.name(),
            group.members.len(),
            if group.is_mutated { ", mutated" } else { "" }
        );
        for &member in &group.members {
            func.set_value_type(member, Type::Resource(group.lifetime));
        }
    }
    analysis
}
