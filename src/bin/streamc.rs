//! Stream compiler driver.
//!
//! Reads stream IR from a file or stdin, runs the lowering pipeline and
//! writes the resulting IR to a file or stdout.

use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;

use bumpalo::Bump;
use clap::Parser;
use streamc::core::{CompilationSession, PipelineOptions, StatisticsFormat};
use streamc::ir::Module;
use streamc::pipeline::{Pipeline, Stage};

#[derive(Parser, Debug)]
#[command(name = "streamc", version, about = "Lowers tensor programs to scheduled, allocated stream IR")]
struct Args {
    /// Input file; reads stdin when omitted
    input: Option<PathBuf>,

    /// Output file; writes stdout when omitted
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Fuse dispatch operands backed by the same storage into shared bindings
    #[arg(long)]
    optimize_bindings: bool,

    /// Statistics dump format written after allocation
    #[arg(long, value_enum, default_value_t = StatisticsFormat::None)]
    dump_statistics_format: StatisticsFormat,

    /// Statistics go to stderr when omitted
    #[arg(long)]
    dump_statistics_file: Option<PathBuf>,

    /// Last stage to run (encode, lifetime, schedule, allocate)
    #[arg(long, default_value = "allocate")]
    run_until: Stage,

    /// Print the IR to stderr after every stage
    #[arg(long)]
    print_after_each: bool,

    /// Skip the structural verifier between stages
    #[arg(long)]
    no_verify: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let text = match &args.input {
        Some(path) => fs::read_to_string(path)?,
        None => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };

    let options = PipelineOptions {
        optimize_bindings: args.optimize_bindings,
        dump_statistics_format: args.dump_statistics_format,
        dump_statistics_file: args.dump_statistics_file.clone(),
        verify_each: !args.no_verify,
    };

    let mut module = Module::parse(&text)?;
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let result = Pipeline::new(options).until(args.run_until).run_with(&mut module, &session, |stage, module| {
        if args.print_after_each {
            eprintln!("; after {stage}\n{module}");
        }
        Ok(())
    });
    if let Err(e) = result {
        for diagnostic in session.diagnostics() {
            eprintln!("{diagnostic}");
        }
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
    log::debug!("{}", session.finish());

    match &args.output {
        Some(path) => fs::write(path, module.to_string())?,
        None => print!("{module}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_every_flag_has_help() {
        let command = Args::command();
        command.clone().debug_assert();
        for arg in command.get_arguments().filter(|arg| !matches!(arg.get_id().as_str(), "help" | "version")) {
            assert!(arg.get_help().is_some(), "{} has no help text", arg.get_id());
        }
    }

    #[test]
    fn test_statistics_format_flag() {
        let args = Args::try_parse_from(["streamc", "--dump-statistics-format", "csv"]).unwrap();
        assert_eq!(args.dump_statistics_format, StatisticsFormat::Csv);
        assert!(Args::try_parse_from(["streamc", "--dump-statistics-format", "xml"]).is_err());
    }
}
