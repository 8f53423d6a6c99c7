//! Runs every `.sir` file under `tests/filetests` through the check runner.

use std::fs;
use std::path::{Path, PathBuf};

use streamc::ir::check::{TestRunner, TestSpec};

/// Discovers all .sir files in a directory recursively.
fn discover_sir_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                files.extend(discover_sir_files(&path));
            } else if path.extension().and_then(|s| s.to_str()) == Some("sir") {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

fn run_sir_file(path: &Path) -> Result<(), String> {
    let content = fs::read_to_string(path).map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    let spec = TestSpec::parse(&content)?;
    TestRunner::new(false).run_test(&spec)
}

#[test]
fn test_all_filetests() {
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/filetests");
    let files = discover_sir_files(&dir);
    assert!(!files.is_empty(), "no filetests found in {}", dir.display());

    let failures: Vec<String> = files
        .iter()
        .filter_map(|path| run_sir_file(path).err().map(|e| format!("{}: {e}", path.display())))
        .collect();
    assert!(failures.is_empty(), "{} of {} filetests failed:\n{}", failures.len(), files.len(), failures.join("\n\n"));
}
