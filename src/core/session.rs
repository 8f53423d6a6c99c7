// This module provides the per-compilation context of the stream compiler. A
// CompilationSession borrows a bumpalo arena used to intern function and op names, and
// guards the run statistics and the encoder diagnostics behind RefCells so that every stage
// can take the session by shared reference while it owns the module mutably. The session is
// threaded explicitly through the pipeline and consumed by finish(), which hands back the
// final statistics; nothing about a compilation lives in global state. SessionStats counts
// the work each stage performed (ops encoded and skipped per kind, copies materialized and
// elided, waves and timepoints formed, bytes packed) and renders itself either as a pretty
// report through Display or as CSV for the statistics dump.

//! Arena-based compilation session.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;

use bumpalo::Bump;
use hashbrown::HashMap;

use super::error::EncodeError;
use crate::ir::OpId;

/// An op the encoder left unrewritten, and why.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic<'arena> {
    pub function: &'arena str,
    pub op: OpId,
    pub op_name: &'static str,
    pub reason: EncodeError,
}

impl fmt::Display for Diagnostic<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}: {} skipped: {}", self.function, self.op_name, self.reason)
    }
}

/// Per-compilation context.
pub struct CompilationSession<'arena> {
    arena: &'arena Bump,
    stats: RefCell<SessionStats>,
    diagnostics: RefCell<Vec<Diagnostic<'arena>>>,
    interned_strings: RefCell<HashMap<&'arena str, &'arena str>>,
    current_function: RefCell<Option<&'arena str>>,
}

impl<'arena> CompilationSession<'arena> {
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
            diagnostics: RefCell::new(Vec::new()),
            interned_strings: RefCell::new(HashMap::new()),
            current_function: RefCell::new(None),
        }
    }

    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Intern a string in the arena.
    pub fn intern_str(&self, s: &str) -> &'arena str {
        let mut strings = self.interned_strings.borrow_mut();
        if let Some(&interned) = strings.get(s) {
            return interned;
        }
        let interned: &'arena str = self.arena.alloc_str(s);
        strings.insert(interned, interned);
        interned
    }

    /// Set the function subsequent diagnostics are attributed to.
    pub fn set_current_function(&self, name: &str) {
        let name = self.intern_str(name);
        *self.current_function.borrow_mut() = Some(name);
    }

    pub fn current_function(&self) -> Option<&'arena str> {
        *self.current_function.borrow()
    }

    /// Record a successfully encoded tensor op.
    pub fn record_encoded(&self, op_name: &str) {
        let mut stats = self.stats.borrow_mut();
        *stats.ops_encoded.entry(op_name.to_string()).or_insert(0) += 1;
    }

    /// Record a tensor op the encoder had to leave in place.
    pub fn record_skipped(&self, op: OpId, op_name: &'static str, reason: EncodeError) {
        let function = self.current_function().unwrap_or("<unknown>");
        log::debug!("@{function}: skipping {op_name}: {reason}");
        *self.stats.borrow_mut().ops_skipped.entry(op_name.to_string()).or_insert(0) += 1;
        self.diagnostics.borrow_mut().push(Diagnostic { function, op, op_name, reason });
    }

    /// Skip reason recorded for an op, if any.
    pub fn skip_reason(&self, function: &str, op: OpId) -> Option<EncodeError> {
        self.diagnostics
            .borrow()
            .iter()
            .rev()
            .find(|d| d.function == function && d.op == op)
            .map(|d| d.reason.clone())
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic<'arena>> {
        self.diagnostics.borrow().clone()
    }

    pub fn record_function_processed(&self) {
        self.stats.borrow_mut().functions_processed += 1;
    }

    pub fn record_copy_materialized(&self) {
        self.stats.borrow_mut().copies_materialized += 1;
    }

    pub fn record_copy_elided(&self) {
        self.stats.borrow_mut().copies_elided += 1;
    }

    pub fn record_wave(&self, members: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.waves_formed += 1;
        stats.largest_wave = stats.largest_wave.max(members);
    }

    pub fn record_timepoint_await(&self) {
        self.stats.borrow_mut().timepoint_awaits += 1;
    }

    pub fn record_constants_packed(&self, count: usize, bytes: u64) {
        let mut stats = self.stats.borrow_mut();
        stats.constants_packed += count;
        stats.constant_bytes += bytes;
    }

    pub fn record_transient_arena(&self, requested: u64, arena: u64) {
        let mut stats = self.stats.borrow_mut();
        stats.transient_bytes_requested += requested;
        stats.transient_arena_bytes += arena;
    }

    pub fn record_dedicated_allocation(&self) {
        self.stats.borrow_mut().dedicated_allocations += 1;
    }

    pub fn record_bindings_fused(&self, count: usize) {
        self.stats.borrow_mut().bindings_fused += count;
    }

    /// Snapshot of the statistics gathered so far.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }

    /// Ends the compilation, returning its statistics.
    pub fn finish(self) -> SessionStats {
        for diagnostic in self.diagnostics.borrow().iter() {
            log::debug!("{diagnostic}");
        }
        self.stats.into_inner()
    }
}

/// Compilation session statistics.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SessionStats {
    /// Host functions, initializers and executables visited by the encoder.
    pub functions_processed: usize,

    /// Tensor ops rewritten, per op name.
    pub ops_encoded: BTreeMap<String, usize>,

    /// Tensor ops left in place, per op name.
    pub ops_skipped: BTreeMap<String, usize>,

    pub copies_materialized: usize,
    pub copies_elided: usize,

    pub waves_formed: usize,
    pub largest_wave: usize,
    pub timepoint_awaits: usize,

    pub constants_packed: usize,
    pub constant_bytes: u64,

    /// Sum of transient sizes before reuse.
    pub transient_bytes_requested: u64,
    /// Size of the packed transient arenas.
    pub transient_arena_bytes: u64,
    pub dedicated_allocations: usize,

    pub bindings_fused: usize,
}

impl SessionStats {
    fn rows(&self) -> Vec<(String, String)> {
        let mut rows = vec![
            ("functions_processed".to_string(), self.functions_processed.to_string()),
            ("ops_encoded".to_string(), self.ops_encoded.values().sum::<usize>().to_string()),
            ("ops_skipped".to_string(), self.ops_skipped.values().sum::<usize>().to_string()),
            ("copies_materialized".to_string(), self.copies_materialized.to_string()),
            ("copies_elided".to_string(), self.copies_elided.to_string()),
            ("waves_formed".to_string(), self.waves_formed.to_string()),
            ("largest_wave".to_string(), self.largest_wave.to_string()),
            ("timepoint_awaits".to_string(), self.timepoint_awaits.to_string()),
            ("constants_packed".to_string(), self.constants_packed.to_string()),
            ("constant_bytes".to_string(), self.constant_bytes.to_string()),
            ("transient_bytes_requested".to_string(), self.transient_bytes_requested.to_string()),
            ("transient_arena_bytes".to_string(), self.transient_arena_bytes.to_string()),
            ("dedicated_allocations".to_string(), self.dedicated_allocations.to_string()),
            ("bindings_fused".to_string(), self.bindings_fused.to_string()),
        ];
        for (op, count) in &self.ops_encoded {
            rows.push((format!("encoded[{op}]"), count.to_string()));
        }
        for (op, count) in &self.ops_skipped {
            rows.push((format!("skipped[{op}]"), count.to_string()));
        }
        rows
    }

    /// Renders the statistics as `statistic,value` CSV.
    pub fn to_csv(&self) -> String {
        let mut out = String::from("statistic,value\n");
        for (key, value) in self.rows() {
            out.push_str(&key);
            out.push(',');
            out.push_str(&value);
            out.push('\n');
        }
        out
    }

    /// Bytes saved by transient storage reuse.
    pub fn transient_bytes_saved(&self) -> u64 {
        self.transient_bytes_requested.saturating_sub(self.transient_arena_bytes)
    }
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Stream Compilation Statistics:")?;
        writeln!(f, "  Functions processed: {}", self.functions_processed)?;
        writeln!(f, "  Tensor ops encoded: {}", self.ops_encoded.values().sum::<usize>())?;
        writeln!(f, "  Tensor ops skipped: {}", self.ops_skipped.values().sum::<usize>())?;
        writeln!(f, "  Copies materialized: {}", self.copies_materialized)?;
        writeln!(f, "  Copies elided: {}", self.copies_elided)?;
        writeln!(f, "  Waves formed: {} (largest {} ops)", self.waves_formed, self.largest_wave)?;
        writeln!(f, "  Timepoint awaits: {}", self.timepoint_awaits)?;
        writeln!(f, "  Constants packed: {} ({} bytes)", self.constants_packed, self.constant_bytes)?;
        writeln!(
            f,
            "  Transient arena: {} bytes for {} bytes requested ({} saved)",
            self.transient_arena_bytes,
            self.transient_bytes_requested,
            self.transient_bytes_saved()
        )?;
        writeln!(f, "  Dedicated allocations: {}", self.dedicated_allocations)?;
        writeln!(f, "  Bindings fused: {}", self.bindings_fused)?;

        if !self.ops_encoded.is_empty() {
            writeln!(f, "  Encoded op breakdown:")?;
            let mut sorted: Vec<_> = self.ops_encoded.iter().collect();
            sorted.sort_by_key(|(_, count)| std::cmp::Reverse(*count));
            for (op, count) in sorted {
                writeln!(f, "    {op}: {count}")?;
            }
        }
        if !self.ops_skipped.is_empty() {
            writeln!(f, "  Skipped op breakdown:")?;
            for (op, count) in &self.ops_skipped {
                writeln!(f, "    {op}: {count}")?;
            }
        }
        Ok(())
    }
}
