//! Property tests for layout, packing, scheduling and whole-pipeline storage safety.

use bumpalo::Bump;
use proptest::prelude::*;
use streamc::allocation::{pack_intervals, Interval, TRANSIENT_ALIGNMENT};
use streamc::core::{Analyzer, CompilationSession, PipelineOptions};
use streamc::encode::layout::{align_element_type, element_byte_size};
use streamc::ir::{ElementType, Function, Lifetime, Module, OpId, OpKind, ResolvedRange};
use streamc::lifetime::analyze_usage;
use streamc::pipeline::{Pipeline, Stage};

fn interval() -> impl Strategy<Value = Interval> {
    (1u64..256, 0usize..16, 1usize..8).prop_map(|(size, birth, len)| Interval { size, birth, death: birth + len })
}

/// A program of independent splats followed by clones of earlier values.
fn clone_chain() -> impl Strategy<Value = String> {
    (1usize..4, prop::collection::vec(any::<prop::sample::Index>(), 0..8)).prop_map(|(splats, clones)| {
        let mut text = String::from("func @main() {\n");
        let mut values = Vec::new();
        for i in 0..splats {
            text.push_str(&format!(
                "  %s{i} = tensor.splat {{result = tensor<16xi8>, result_size = 16, value = {i} : i8}}\n"
            ));
            values.push(format!("s{i}"));
        }
        for (i, pick) in clones.iter().enumerate() {
            let source = values[pick.index(values.len())].clone();
            text.push_str(&format!(
                "  %c{i} = tensor.clone(%{source}) {{source = tensor<16xi8>, source_size = 16, result = tensor<16xi8>, result_size = 16}}\n"
            ));
            values.push(format!("c{i}"));
        }
        text.push_str(&format!("  return({})\n}}\n", values.iter().map(|v| format!("%{v}")).collect::<Vec<_>>().join(", ")));
        text
    })
}

/// One statement of a generated tensor program. Indices pick an earlier resource.
#[derive(Debug, Clone)]
enum Step {
    Fill(prop::sample::Index, u8, u8),
    Update(prop::sample::Index, prop::sample::Index),
    Store(prop::sample::Index, u8),
    Duplicate(prop::sample::Index),
    Load(prop::sample::Index, u8),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (any::<prop::sample::Index>(), 0u8..8, 1u8..9).prop_map(|(p, start, len)| Step::Fill(p, start, len)),
        (any::<prop::sample::Index>(), any::<prop::sample::Index>()).prop_map(|(p, q)| Step::Update(p, q)),
        (any::<prop::sample::Index>(), 0u8..16).prop_map(|(p, i)| Step::Store(p, i)),
        any::<prop::sample::Index>().prop_map(Step::Duplicate),
        (any::<prop::sample::Index>(), 0u8..16).prop_map(|(p, i)| Step::Load(p, i)),
    ]
}

/// A program mixing in-place mutators with extra reads of their targets.
fn mutating_program() -> impl Strategy<Value = String> {
    (1usize..4, prop::collection::vec(step(), 1..12), prop::collection::vec(any::<prop::sample::Index>(), 1..4)).prop_map(
        |(splats, steps, returns)| {
            const T: &str = "tensor<16xi8>";
            let mut text = String::from("func @main() {\n");
            text.push_str(&format!("  %c = tensor.constant {{result = {T}, value = dense<7> : i8}}\n"));
            let mut values = vec!["c".to_string()];
            for i in 0..splats {
                text.push_str(&format!("  %s{i} = tensor.splat {{result = {T}, result_size = 16, value = {i} : i8}}\n"));
                values.push(format!("s{i}"));
            }
            for (n, step) in steps.iter().enumerate() {
                let pick = |p: &prop::sample::Index| values[p.index(values.len())].clone();
                let (line, produced) = match step {
                    Step::Fill(p, start, len) => (
                        format!(
                            "%v{n} = tensor.fill(%{}) {{target = {T}, target_size = 16, start = [{start}], lengths = [{len}], value = {n} : i8}}",
                            pick(p)
                        ),
                        true,
                    ),
                    Step::Update(p, q) => {
                        let target = p.index(values.len());
                        let mut update = q.index(values.len() - 1);
                        if update >= target {
                            update += 1;
                        }
                        (
                            format!(
                                "%v{n} = tensor.update(%{}, %{}) {{target = {T}, target_size = 16, start = [0], update = {T}, update_size = 16}}",
                                values[target], values[update]
                            ),
                            true,
                        )
                    }
                    Step::Store(p, i) => (
                        format!(
                            "%v{n} = tensor.store(%{}) {{target = {T}, target_size = 16, indices = [{i}], value = {n} : i8}}",
                            pick(p)
                        ),
                        true,
                    ),
                    Step::Duplicate(p) => (
                        format!(
                            "%v{n} = tensor.clone(%{}) {{source = {T}, source_size = 16, result = {T}, result_size = 16}}",
                            pick(p)
                        ),
                        true,
                    ),
                    Step::Load(p, i) => (
                        format!("%l{n} = tensor.load(%{}) {{source = {T}, source_size = 16, indices = [{i}]}}", pick(p)),
                        false,
                    ),
                };
                text.push_str(&format!("  {line}\n"));
                if produced {
                    values.push(format!("v{n}"));
                }
            }
            let mut returned: Vec<String> = Vec::new();
            for pick in &returns {
                let value = format!("%{}", values[pick.index(values.len())]);
                if !returned.contains(&value) {
                    returned.push(value);
                }
            }
            text.push_str(&format!("  return({})\n}}\n", returned.join(", ")));
            text
        },
    )
}

fn compile_fully(text: &str) -> Module {
    let mut module = Module::parse(text).unwrap();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    Pipeline::new(PipelineOptions::default())
        .run(&mut module, &session)
        .unwrap_or_else(|err| panic!("{err}\n{text}"));
    module
}

/// Byte ranges a wave member writes: the target of a mutator or a result it produces.
fn written_ranges(func: &Function, op: OpId) -> Vec<&ResolvedRange> {
    let node = func.op(op);
    let tied = node.kind.tied_target();
    node.ranges.iter().filter(|r| Some(r.resource) == tied || node.results.contains(&r.resource)).collect()
}

fn disjoint(a: (u64, u64), b: (u64, u64)) -> bool {
    a.1 <= b.0 || b.1 <= a.0
}

fn constant_span(range: &ResolvedRange) -> (u64, u64) {
    (range.offset.constant().unwrap(), range.end.constant().unwrap())
}

proptest! {
    #[test]
    fn element_alignment_is_idempotent(bits in 1u32..=64) {
        let ty = ElementType::int(bits);
        let aligned = align_element_type(ty);
        prop_assert_eq!(align_element_type(aligned), aligned);
        prop_assert!(aligned.bit_width() >= bits);
        prop_assert_eq!(element_byte_size(ty), element_byte_size(aligned));
    }

    #[test]
    fn element_byte_size_is_a_power_of_two(bits in 1u32..=64) {
        let size = element_byte_size(ElementType::int(bits));
        prop_assert!(size.is_power_of_two());
        prop_assert!(size * 8 >= u64::from(bits));
    }

    #[test]
    fn packed_intervals_never_overlap(requests in prop::collection::vec(interval(), 1..24)) {
        let (offsets, arena) = pack_intervals(&requests, TRANSIENT_ALIGNMENT);
        prop_assert_eq!(arena % TRANSIENT_ALIGNMENT, 0);
        for (i, a) in requests.iter().enumerate() {
            prop_assert_eq!(offsets[i] % TRANSIENT_ALIGNMENT, 0);
            prop_assert!(offsets[i] + a.size <= arena);
            for (j, b) in requests.iter().enumerate().skip(i + 1) {
                if a.overlaps(b) {
                    let disjoint = offsets[i] + a.size <= offsets[j] || offsets[j] + b.size <= offsets[i];
                    prop_assert!(disjoint, "requests {} and {} share bytes", i, j);
                }
            }
        }
        let total: u64 = requests.iter().map(|r| r.size.next_multiple_of(TRANSIENT_ALIGNMENT)).sum();
        prop_assert!(arena <= total);
    }

    #[test]
    fn waves_follow_their_dependencies(text in clone_chain()) {
        let mut module = Module::parse(&text).unwrap();
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        Pipeline::new(PipelineOptions::default()).until(Stage::Schedule).run(&mut module, &session).unwrap();

        let func = &module.functions[0];
        let wave_of = |value| {
            let op = func.def_op(value).unwrap();
            match &func.op(func.op(op).parent.unwrap()).kind {
                OpKind::Wave { index, .. } => *index,
                other => panic!("unexpected parent {}", other.name()),
            }
        };
        for op in func.walk() {
            if let OpKind::AsyncClone { source, .. } = &func.op(op).kind {
                prop_assert!(wave_of(*source) < wave_of(func.op(op).result()));
            }
        }
        let indices: Vec<u32> = func
            .body()
            .iter()
            .filter_map(|&op| match &func.op(op).kind {
                OpKind::Wave { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        prop_assert_eq!(indices, (1..).take(session.stats().waves_formed).collect::<Vec<u32>>());
    }

    #[test]
    fn mutated_targets_are_never_read_afterwards(text in mutating_program()) {
        let module = compile_fully(&text);
        let func = &module.functions[0];
        let mut analyzer = Analyzer::new();
        analyzer.switch_func(func);
        for op in func.walk() {
            let Some(target) = func.op(op).kind.tied_target() else {
                continue;
            };
            let at = analyzer.slot(op).unwrap();
            for &user in func.uses(target) {
                if user != op {
                    prop_assert!(
                        analyzer.slot(user).unwrap() < at,
                        "{} reads %{} after it is mutated\n{}",
                        func.op(user).name(),
                        func.value(target).name,
                        func
                    );
                }
            }
        }
    }

    #[test]
    fn wave_members_never_write_overlapping_bytes(text in mutating_program()) {
        let module = compile_fully(&text);
        let func = &module.functions[0];
        for &top in func.body() {
            let OpKind::Wave { members, .. } = &func.op(top).kind else {
                continue;
            };
            let writes: Vec<(OpId, &ResolvedRange)> =
                members.iter().flat_map(|&m| written_ranges(func, m).into_iter().map(move |r| (m, r))).collect();
            for (i, (a_op, a)) in writes.iter().enumerate() {
                for (b_op, b) in writes.iter().skip(i + 1) {
                    if a_op != b_op && a.storage == b.storage {
                        prop_assert!(
                            disjoint(constant_span(a), constant_span(b)),
                            "{} and {} write the same bytes of %{}\n{}",
                            func.op(*a_op).name(),
                            func.op(*b_op).name(),
                            func.value(a.storage).name,
                            func
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn live_transients_never_share_bytes(text in mutating_program()) {
        let module = compile_fully(&text);
        let func = &module.functions[0];
        let Some(slices) = func.body().iter().find_map(|&op| match &func.op(op).kind {
            OpKind::ResourceAlloc { lifetime: Lifetime::Transient, slices, .. } => Some(slices.clone()),
            _ => None,
        }) else {
            return Ok(());
        };
        let mut analyzer = Analyzer::new();
        analyzer.switch_func(func);
        let usage = analyze_usage(func);
        let spans: Vec<((usize, usize), (u64, u64))> = slices
            .iter()
            .map(|slice| {
                let group = usage.groups().find(|g| g.root == slice.value).unwrap();
                let live = group
                    .members
                    .iter()
                    .filter_map(|&m| analyzer.liveness(m).map(|info| info.interval()))
                    .reduce(|(b0, d0), (b1, d1)| (b0.min(b1), d0.max(d1)))
                    .unwrap();
                let offset = slice.offset.constant().unwrap();
                (live, (offset, offset + slice.length.constant().unwrap()))
            })
            .collect();
        for (i, (live_a, bytes_a)) in spans.iter().enumerate() {
            for (live_b, bytes_b) in spans.iter().skip(i + 1) {
                let overlapping_lifetimes = live_a.0 < live_b.1 && live_b.0 < live_a.1;
                if overlapping_lifetimes {
                    prop_assert!(disjoint(*bytes_a, *bytes_b), "live transients share bytes\n{}", func);
                }
            }
        }
    }
}
