//! Pipeline configuration.

use std::path::PathBuf;

use super::error::{CompileError, CompileResult};

/// Format of the statistics dump written after allocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum StatisticsFormat {
    #[default]
    None,
    Pretty,
    Csv,
}

/// Read-only options shared by every stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Fuse dispatch operands backed by the same storage into shared bindings.
    pub optimize_bindings: bool,
    pub dump_statistics_format: StatisticsFormat,
    /// Statistics go to stderr when unset.
    pub dump_statistics_file: Option<PathBuf>,
    /// Run the structural verifier after each stage.
    pub verify_each: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            optimize_bindings: false,
            dump_statistics_format: StatisticsFormat::None,
            dump_statistics_file: None,
            verify_each: true,
        }
    }
}

impl PipelineOptions {
    pub fn validate(&self) -> CompileResult<()> {
        if self.dump_statistics_file.is_some() && self.dump_statistics_format == StatisticsFormat::None {
            return Err(CompileError::InvalidOption {
                reason: "a statistics file was given but the statistics format is 'none'".into(),
            });
        }
        Ok(())
    }
}
