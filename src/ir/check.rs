//! FileCheck-style validation for stream IR test files.
//!
//! A test file is stream IR text with `; RUN:` and `; CHECK...:` comment lines.
//! The runner feeds the IR through the pipeline as the RUN line asks and
//! matches the printed result against the CHECK directives in order.

use std::collections::VecDeque;

use bumpalo::Bump;

use super::{Module, ValueId};
use crate::core::{Analyzer, CompilationSession, PipelineOptions};
use crate::pipeline::{Pipeline, Stage};

/// A CHECK directive extracted from a test file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckDirective {
    /// CHECK: pattern - Match on this or a later line
    Check(String),
    /// CHECK-LABEL: pattern - Start of a section
    CheckLabel(String),
    /// CHECK-NEXT: pattern - Match on the next line
    CheckNext(String),
    /// CHECK-NOT: pattern - Absent until the next positive match
    CheckNot(String),
    /// CHECK-EMPTY - Match an empty line
    CheckEmpty,
    /// COM: comment - Ignored
    Comment(String),
}

/// A RUN directive specifying how to execute the test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDirective {
    pub args: Vec<String>,
    /// `not` prefix: the pipeline must fail.
    pub expect_failure: bool,
}

impl RunDirective {
    fn flag(&self, name: &str) -> bool {
        self.args.iter().any(|a| a == name)
    }

    fn value(&self, name: &str) -> Option<&str> {
        self.args.iter().find_map(|a| a.strip_prefix(name)?.strip_prefix('='))
    }
}

/// Test specification extracted from a test file.
#[derive(Debug)]
pub struct TestSpec {
    pub run_directives: Vec<RunDirective>,
    pub check_directives: Vec<CheckDirective>,
    pub ir_content: String,
}

impl TestSpec {
    pub fn parse(content: &str) -> Result<Self, String> {
        let mut run_directives = Vec::new();
        let mut check_directives = Vec::new();
        let mut ir_lines = Vec::new();

        for line in content.lines() {
            let trimmed = line.trim();
            if let Some(cmd) = trimmed.strip_prefix("; RUN:") {
                let (expect_failure, cmd) = match cmd.trim().strip_prefix("not ") {
                    Some(rest) => (true, rest),
                    None => (false, cmd),
                };
                let mut parts = cmd.split_whitespace();
                if parts.next().is_none() {
                    return Err(format!("empty RUN line: '{trimmed}'"));
                }
                let args = parts.filter(|p| *p != "%s").map(str::to_string).collect();
                run_directives.push(RunDirective { args, expect_failure });
            } else if let Some(pattern) = trimmed.strip_prefix("; CHECK-LABEL:") {
                check_directives.push(CheckDirective::CheckLabel(pattern.trim().to_string()));
            } else if let Some(pattern) = trimmed.strip_prefix("; CHECK-NEXT:") {
                check_directives.push(CheckDirective::CheckNext(pattern.trim().to_string()));
            } else if let Some(pattern) = trimmed.strip_prefix("; CHECK-NOT:") {
                check_directives.push(CheckDirective::CheckNot(pattern.trim().to_string()));
            } else if trimmed.starts_with("; CHECK-EMPTY") {
                check_directives.push(CheckDirective::CheckEmpty);
            } else if let Some(pattern) = trimmed.strip_prefix("; CHECK:") {
                check_directives.push(CheckDirective::Check(pattern.trim().to_string()));
            } else if let Some(comment) = trimmed.strip_prefix("; COM:") {
                check_directives.push(CheckDirective::Comment(comment.trim().to_string()));
            } else {
                ir_lines.push(line);
            }
        }

        if run_directives.is_empty() {
            return Err("test has no RUN line".to_string());
        }
        Ok(TestSpec { run_directives, check_directives, ir_content: ir_lines.join("\n") })
    }
}

/// Runs stream IR tests and validates their output.
pub struct TestRunner {
    verbose: bool,
}

impl TestRunner {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    pub fn run_test(&self, spec: &TestSpec) -> Result<(), String> {
        for run in &spec.run_directives {
            let output = self.execute(&spec.ir_content, run)?;
            self.validate_output(&output, &spec.check_directives)?;
        }
        Ok(())
    }

    /// Runs the pipeline as `run` asks and returns everything it printed.
    pub fn execute(&self, ir: &str, run: &RunDirective) -> Result<String, String> {
        let mut module = Module::parse(ir).map_err(|e| e.to_string())?;
        let last = match run.value("--run-until") {
            Some(stage) => stage.parse::<Stage>().map_err(|e| e.to_string())?,
            None => Stage::Allocate,
        };
        let options = PipelineOptions { optimize_bindings: run.flag("--optimize-bindings"), ..Default::default() };
        let print_after_each = run.flag("--print-after-each");

        let mut output = Vec::new();
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let result = Pipeline::new(options).until(last).run_with(&mut module, &session, |stage, module| {
            if print_after_each {
                output.push(format!("; after {stage}"));
                output.push(module.to_string());
            }
            Ok(())
        });

        match (result, run.expect_failure) {
            (Ok(()), true) => return Err("pipeline succeeded but the RUN line expects a failure".to_string()),
            (Err(err), true) => {
                output.push(format!("error: {err}"));
                return Ok(output.join("\n"));
            }
            (Err(err), false) => return Err(format!("pipeline failed: {err}")),
            (Ok(()), false) => {}
        }

        if !print_after_each {
            output.push(module.to_string());
        }
        if run.flag("--print-liveness") {
            print_liveness(&module, &mut output);
        }
        if self.verbose {
            println!("{}", output.join("\n"));
        }
        Ok(output.join("\n"))
    }

    /// Validates output against CHECK directives.
    pub fn validate_output(&self, output: &str, directives: &[CheckDirective]) -> Result<(), String> {
        let lines: VecDeque<_> = output.lines().collect();
        let mut line_idx = 0;
        let mut forbidden: Vec<&str> = Vec::new();

        for directive in directives {
            match directive {
                CheckDirective::Comment(_) => continue,
                CheckDirective::Check(pattern) | CheckDirective::CheckLabel(pattern) => {
                    match find_from(&lines, pattern, &mut line_idx, &mut forbidden) {
                        Some(at) if self.verbose => println!("CHECK: '{pattern}' found at line {at}"),
                        Some(_) => {}
                        None => return Err(format!("CHECK: pattern '{pattern}' not found in output:\n{output}")),
                    }
                }
                CheckDirective::CheckNot(pattern) => forbidden.push(pattern),
                CheckDirective::CheckNext(pattern) => {
                    let Some(line) = lines.get(line_idx) else {
                        return Err(format!("CHECK-NEXT: no more lines, expected '{pattern}'"));
                    };
                    if !line.contains(pattern.as_str()) {
                        return Err(format!("CHECK-NEXT: expected '{pattern}' but got '{line}'"));
                    }
                    line_idx += 1;
                }
                CheckDirective::CheckEmpty => {
                    if let Some(line) = lines.get(line_idx) {
                        if !line.trim().is_empty() {
                            return Err(format!("CHECK-EMPTY: expected empty line but got '{line}'"));
                        }
                    }
                    line_idx += 1;
                }
            }
        }

        if let Some(bad) = forbidden.iter().find(|f| lines.iter().skip(line_idx).any(|line| line.contains(**f))) {
            return Err(format!("CHECK-NOT: pattern '{bad}' found in output"));
        }
        Ok(())
    }
}

/// Finds `pattern` at or after `line_idx`, failing if a forbidden pattern
/// shows up first.
fn find_from(lines: &VecDeque<&str>, pattern: &str, line_idx: &mut usize, forbidden: &mut Vec<&str>) -> Option<usize> {
    let idx = lines.iter().skip(*line_idx).position(|line| line.contains(pattern))?;
    for line in lines.iter().skip(*line_idx).take(idx) {
        if let Some(bad) = forbidden.iter().find(|f| line.contains(**f)) {
            log::debug!("CHECK-NOT: '{bad}' found in '{line}'");
            return None;
        }
    }
    forbidden.clear();
    *line_idx += idx + 1;
    Some(*line_idx - 1)
}

fn print_liveness(module: &Module, output: &mut Vec<String>) {
    let mut analyzer = Analyzer::new();
    for func in module.functions.iter().filter(|f| f.kind.is_host()) {
        analyzer.switch_func(func);
        output.push(format!("Liveness for @{}", func.name));
        for i in 0..func.value_count() {
            let value = ValueId(i as u32);
            match analyzer.liveness(value) {
                Some(info) => output.push(format!(
                    "%{}: {} refs, {}->{}",
                    func.value(value).name,
                    info.ref_count,
                    info.first,
                    info.last
                )),
                None => output.push(format!("%{}: ignored", func.value(value).name)),
            }
        }
        output.push("End Liveness".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPLAT: &str = r#"; RUN: streamc --run-until=encode %s
; CHECK-LABEL: func @main
; CHECK-NEXT: async.splat
; CHECK-NOT: tensor.splat
; COM: splats become byte fills
func @main() {
  %a = tensor.splat {result = tensor<16xi8>, result_size = 16, value = 1 : i8}
  return(%a)
}"#;

    #[test]
    fn test_parse_directives() {
        let spec = TestSpec::parse(SPLAT).unwrap();
        assert_eq!(spec.run_directives.len(), 1);
        assert_eq!(spec.run_directives[0].args, vec!["--run-until=encode".to_string()]);
        assert!(!spec.run_directives[0].expect_failure);
        assert_eq!(spec.check_directives.len(), 4);
        assert!(spec.ir_content.contains("func @main()"));
        assert!(!spec.ir_content.contains("CHECK"));
    }

    #[test]
    fn test_missing_run_line() {
        assert!(TestSpec::parse("func @main() {\n  return()\n}").is_err());
    }

    #[test]
    fn test_check_matching() {
        let runner = TestRunner::new(false);
        let output = "func @main() {\n  %a = async.splat\n  return(%a)\n}\n";
        let directives = vec![
            CheckDirective::CheckLabel("func @main".to_string()),
            CheckDirective::CheckNext("async.splat".to_string()),
            CheckDirective::Check("return".to_string()),
        ];
        assert!(runner.validate_output(output, &directives).is_ok());

        let directives = vec![CheckDirective::Check("return".to_string()), CheckDirective::CheckNext("async.splat".to_string())];
        assert!(runner.validate_output(output, &directives).is_err());
    }

    #[test]
    fn test_check_not() {
        let runner = TestRunner::new(false);
        let output = "a\nb\nc";
        let ok = vec![CheckDirective::Check("a".into()), CheckDirective::CheckNot("x".into()), CheckDirective::Check("c".into())];
        assert!(runner.validate_output(output, &ok).is_ok());
        let bad = vec![CheckDirective::Check("a".into()), CheckDirective::CheckNot("b".into()), CheckDirective::Check("c".into())];
        assert!(runner.validate_output(output, &bad).is_err());
    }

    #[test]
    fn test_run_encode_only() {
        let spec = TestSpec::parse(SPLAT).unwrap();
        TestRunner::new(false).run_test(&spec).unwrap();
    }

    #[test]
    fn test_expected_failure() {
        let content = r#"; RUN: not streamc %s
; CHECK: error: encode: 1 op(s) were not lowered
func @main() {
  %a = tensor.splat {result = tensor<4xi7>, result_size = 4, value = 1 : i7}
  return(%a)
}"#;
        let spec = TestSpec::parse(content).unwrap();
        assert!(spec.run_directives[0].expect_failure);
        TestRunner::new(false).run_test(&spec).unwrap();
    }
}
