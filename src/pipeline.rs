// This module implements the pipeline driver. A Pipeline is an explicit, ordered list of the
// four stages (encode, lifetime, schedule, allocate), each a plain function over the module
// and the compilation session, with read-only PipelineOptions. Stage boundaries are gated by
// the structural verifiers: the input check and the fully-lowered check after encoding
// always run, the remaining checks run when verify_each is set. The driver also owns the
// whole-module passes that do not belong to a single stage: initializer combination, which
// must run before copy elision; binding fusion of duplicate dispatch operands, enabled by
// optimize_bindings; and the statistics dump after allocation. Functions and initializers
// are visited by iterating the module's collections, with no nested pass manager.

//! Pipeline driver.

use std::fmt;
use std::io::Write;
use std::str::FromStr;

use hashbrown::HashMap;

use crate::core::{CompilationSession, CompileError, CompileResult, PipelineOptions, SessionStats, StatisticsFormat};
use crate::ir::{FuncKind, Function, Module, OpKind, ValueId};
use crate::{allocation, encode, lifetime, schedule, verify};

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Encode,
    Lifetime,
    Schedule,
    Allocate,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Encode, Stage::Lifetime, Stage::Schedule, Stage::Allocate];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Encode => "encode",
            Stage::Lifetime => "lifetime",
            Stage::Schedule => "schedule",
            Stage::Allocate => "allocate",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.name() == s)
            .ok_or_else(|| CompileError::InvalidOption { reason: format!("unknown stage '{s}'") })
    }
}

/// Ordered stage runner.
#[derive(Debug, Clone)]
pub struct Pipeline {
    options: PipelineOptions,
    last: Stage,
}

impl Pipeline {
    pub fn new(options: PipelineOptions) -> Self {
        Self { options, last: Stage::Allocate }
    }

    /// Stops after `stage`.
    pub fn until(mut self, stage: Stage) -> Self {
        self.last = stage;
        self
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn run(&self, module: &mut Module, session: &CompilationSession) -> CompileResult<()> {
        self.run_with(module, session, |_, _| Ok(()))
    }

    /// Runs every stage up to the last one, calling `after_stage` once each
    /// stage has completed and verified.
    pub fn run_with(
        &self,
        module: &mut Module,
        session: &CompilationSession,
        mut after_stage: impl FnMut(Stage, &Module) -> CompileResult<()>,
    ) -> CompileResult<()> {
        self.options.validate()?;
        verify::verify_input(module)?;

        for stage in Stage::ALL.into_iter().filter(|&stage| stage <= self.last) {
            self.run_stage(stage, module, session)?;
            log::info!("stage '{stage}' completed");
            after_stage(stage, module)?;
        }
        Ok(())
    }

    fn run_stage(&self, stage: Stage, module: &mut Module, session: &CompilationSession) -> CompileResult<()> {
        match stage {
            Stage::Encode => {
                encode::encode_module(module, session);
                verify::verify_lowering_to_async(module, session)
            }
            Stage::Lifetime => {
                combine_initializers(module);
                lifetime::schedule_lifetimes(module, session);
                if self.options.verify_each {
                    verify::verify_lifetimes(module)?;
                }
                Ok(())
            }
            Stage::Schedule => {
                schedule::schedule_concurrency(module, session);
                if self.options.verify_each {
                    verify::verify_scheduled(module)?;
                }
                Ok(())
            }
            Stage::Allocate => {
                allocation::allocate_storage(module, session);
                if self.options.optimize_bindings {
                    optimize_bindings(module, session);
                }
                if self.options.verify_each {
                    verify::verify_allocated(module)?;
                }
                dump_statistics(&session.stats(), &self.options)
            }
        }
    }
}

/// Concatenates every initializer of the module into one, in declaration order.
pub fn combine_initializers(module: &mut Module) {
    let count = module.functions.iter().filter(|f| f.kind == FuncKind::Initializer).count();
    if count < 2 {
        return;
    }
    let Some(first) = module.functions.iter().position(|f| f.kind == FuncKind::Initializer) else {
        return;
    };

    let mut combined = Function::new("combined_initializer", FuncKind::Initializer);
    let mut map: HashMap<ValueId, ValueId> = HashMap::new();
    let mut remaining = Vec::with_capacity(module.functions.len() - count + 1);
    for func in std::mem::take(&mut module.functions) {
        if func.kind != FuncKind::Initializer {
            remaining.push(func);
            continue;
        }
        log::debug!("combining initializer @{}", func.name);
        map.clear();
        for &arg in &func.args {
            let new = combined.add_arg(&func.value(arg).name, func.value_type(arg).clone());
            map.insert(arg, new);
        }
        for &op in func.body() {
            if !matches!(func.op(op).kind, OpKind::Return { .. }) {
                combined.append_cloned(&func, op, &mut map);
            }
        }
    }
    combined.append(OpKind::Return { values: Vec::new() }, "");
    remaining.insert(first.min(remaining.len()), combined);
    module.functions = remaining;
}

/// Fuses dispatch operands backed by the same storage into shared bindings.
///
/// Operands are keyed by the storage their resolved range lands in, so two
/// slices of one arena share a binding at their own offsets. Operands without
/// resolved ranges are keyed by value.
pub fn optimize_bindings(module: &mut Module, session: &CompilationSession) {
    for func in module.host_functions_mut() {
        for op in func.walk() {
            let OpKind::AsyncDispatch { entry, operands, operand_sizes, result_size, .. } = func.op(op).kind.clone() else {
                continue;
            };
            let ranges = &func.op(op).ranges;
            let storages: Vec<ValueId> =
                operands.iter().enumerate().map(|(i, &operand)| ranges.get(i).map_or(operand, |r| r.storage)).collect();
            let mut unique: Vec<ValueId> = Vec::with_capacity(storages.len());
            let bindings: Vec<u32> = storages
                .iter()
                .map(|storage| match unique.iter().position(|u| u == storage) {
                    Some(slot) => slot as u32,
                    None => {
                        unique.push(*storage);
                        unique.len() as u32 - 1
                    }
                })
                .collect();
            let fused = operands.len() - unique.len();
            if fused > 0 {
                log::debug!("@{}: fused {fused} binding(s) of dispatch @{entry}", func.name);
                session.record_bindings_fused(fused);
            }
            func.set_kind(op, OpKind::AsyncDispatch { entry, operands, operand_sizes, result_size, bindings });
        }
    }
}

/// Writes the statistics in the configured format to the configured sink.
pub fn dump_statistics(stats: &SessionStats, options: &PipelineOptions) -> CompileResult<()> {
    let text = match options.dump_statistics_format {
        StatisticsFormat::None => return Ok(()),
        StatisticsFormat::Pretty => stats.to_string(),
        StatisticsFormat::Csv => stats.to_csv(),
    };
    match &options.dump_statistics_file {
        Some(path) => std::fs::write(path, text)?,
        None => std::io::stderr().write_all(text.as_bytes())?,
    }
    Ok(())
}
