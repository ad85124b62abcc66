//! Architectural Enforcement Integration Tests
//!
//! Shared source walking for the tests in `tests/`, which enforce:
//! - No sleep() calls in production code
//! - No blocking network clients in production code
//! - No unwrap()/expect() in production code
//! - No HTTP server framework in the core crate
//!
//! Production code is every `.rs` file under a crate's `src/`, up to the
//! first `#[cfg(test)]` line. Test-only helper modules (`test_utils.rs`) and
//! comment lines are skipped.

use std::fs;
use std::path::{Path, PathBuf};

/// Production source trees checked by the line rules
pub const PRODUCTION_DIRS: [&str; 2] = ["balancer/core/src", "balancer/daemon/src"];

/// Workspace root, two levels above this crate
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// One line of production code
#[derive(Debug, Clone)]
pub struct SourceLine {
    pub path: PathBuf,
    pub number: usize,
    pub code: String,
}

impl std::fmt::Display for SourceLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.number, self.code.trim())
    }
}

/// Production lines of one file, comments stripped
#[must_use]
pub fn production_lines(path: &Path) -> Vec<SourceLine> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };

    let mut lines = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("#[cfg(test)]") {
            break;
        }
        if trimmed.starts_with("//") {
            continue;
        }
        let code = line.split("//").next().unwrap_or(line);
        lines.push(SourceLine {
            path: path.to_path_buf(),
            number: idx + 1,
            code: code.to_string(),
        });
    }
    lines
}

/// Production lines of every Rust file under `dir`, relative to the workspace root
#[must_use]
pub fn production_tree(dir: &str) -> Vec<SourceLine> {
    let root = workspace_root().join(dir);
    assert!(root.exists(), "source tree {} is missing", root.display());

    walkdir::WalkDir::new(&root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .filter(|e| e.file_name() != "test_utils.rs")
        .flat_map(|e| production_lines(e.path()))
        .collect()
}

/// Lines across all production trees matching `pred`
#[must_use]
pub fn violations<F>(pred: F) -> Vec<SourceLine>
where
    F: Fn(&str) -> bool,
{
    PRODUCTION_DIRS
        .iter()
        .flat_map(|dir| production_tree(dir))
        .filter(|line| pred(&line.code))
        .collect()
}

/// Print every violation and fail
pub fn report(title: &str, hint: &str, found: &[SourceLine]) {
    if found.is_empty() {
        return;
    }
    eprintln!("\n❌ {title}\n");
    for line in found {
        eprintln!("  ❌ {line}");
    }
    eprintln!("\n✅ {hint}");
    panic!(
        "\nFound {} violation(s) in production code.\nFix these before merging!",
        found.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_production_lines_stop_at_test_module() {
        let mut file = tempfile_in_target();
        writeln!(
            file.1,
            "fn live() {{ run(); }} // trailing\n/// doc unwrap()\n#[cfg(test)]\nmod tests {{ fn t() {{ x.unwrap(); }} }}"
        )
        .unwrap();

        let lines = production_lines(&file.0);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].code.trim(), "fn live() { run(); }");
        std::fs::remove_file(&file.0).unwrap();
    }

    fn tempfile_in_target() -> (PathBuf, fs::File) {
        let path = std::env::temp_dir().join(format!("arch-enforcement-{}.rs", std::process::id()));
        let file = fs::File::create(&path).unwrap();
        (path, file)
    }

    #[test]
    fn test_workspace_root_has_balancer() {
        assert!(workspace_root().join("balancer/core/Cargo.toml").exists());
    }
}
