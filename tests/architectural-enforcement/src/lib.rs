//! Architectural Enforcement
//!
//! Source-tree checks shared by the integration tests in this package:
//! - No blocking sleeps, and async sleeps only for backoff or pacing
//! - No stdout/stderr printing in library or daemon code (use `tracing`)
//! - No `unwrap()`/`expect()` outside test modules
//!
//! Checks run over production sources only. Everything from the first
//! `#[cfg(test)]` line of a file onwards is treated as test code.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Production source roots, relative to the workspace root
pub const PRODUCTION_DIRS: [&str; 2] = ["relay/core/src", "relay/daemon/src"];

/// A rule violation at a source line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File containing the violation
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// Offending line, trimmed
    pub text: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.line, self.text)
    }
}

/// Workspace root, two levels above this package
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("..")
}

/// All `.rs` files under `dir`
#[must_use]
pub fn rust_sources(dir: &Path) -> Vec<PathBuf> {
    if !dir.exists() {
        return Vec::new();
    }
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(|e| e.path().to_path_buf())
        .collect()
}

/// Lines of `content` that belong to production code
#[must_use]
pub fn production_lines(content: &str) -> Vec<&str> {
    content
        .lines()
        .take_while(|line| !line.trim_start().starts_with("#[cfg(test)]"))
        .collect()
}

/// Code part of a line, without a trailing `//` comment or doc comment
#[must_use]
pub fn code_part(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Whether any line in `idx-before ..= idx+after` contains one of `words`
#[must_use]
pub fn has_context(lines: &[&str], idx: usize, before: usize, after: usize, words: &[&str]) -> bool {
    let start = idx.saturating_sub(before);
    let end = (idx + after + 1).min(lines.len());
    lines[start..end].iter().any(|line| {
        let lower = line.to_lowercase();
        words.iter().any(|w| lower.contains(w))
    })
}

/// Scan production lines of every file under the production roots
///
/// `check` gets the production lines of a file and an index, and reports
/// whether that line violates the rule.
pub fn scan<F>(check: F) -> Vec<Violation>
where
    F: Fn(&Path, &[&str], usize) -> bool,
{
    let root = workspace_root();
    let mut violations = Vec::new();
    for dir in PRODUCTION_DIRS {
        for path in rust_sources(&root.join(dir)) {
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            let lines = production_lines(&content);
            for idx in 0..lines.len() {
                if check(&path, &lines, idx) {
                    violations.push(Violation {
                        path: path.clone(),
                        line: idx + 1,
                        text: lines[idx].trim().to_string(),
                    });
                }
            }
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_lines_stop_at_test_module() {
        let content = "fn a() {}\n#[cfg(test)]\nmod tests {}\n";
        assert_eq!(production_lines(content), vec!["fn a() {}"]);
    }

    #[test]
    fn test_code_part_drops_comment() {
        assert_eq!(code_part("let x = 1; // sleep(1)"), "let x = 1; ");
    }

    #[test]
    fn test_has_context_window() {
        let lines = ["let backoff = base * 2;", "x", "tokio::time::sleep(backoff)"];
        assert!(has_context(&lines, 2, 2, 0, &["backoff"]));
        assert!(!has_context(&lines, 2, 0, 0, &["retry"]));
    }

    #[test]
    fn test_production_roots_exist() {
        let root = workspace_root();
        for dir in PRODUCTION_DIRS {
            assert!(!rust_sources(&root.join(dir)).is_empty(), "{dir} has no sources");
        }
    }
}
