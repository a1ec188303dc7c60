//! Write-scope policy for the tester and implementer roles.
//!
//! The tester may only touch files under the tests directory; the implementer
//! may touch anything except the tests directory. Paths must be relative and
//! stay inside the workspace.

use std::path::{Component, Path};

use thiserror::Error;

use crate::core::types::FileEdit;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopeViolation {
    #[error("path {0} escapes the workspace")]
    Escapes(String),

    #[error("tester may only write under {tests_dir}/ (got {path})")]
    OutsideTests { tests_dir: String, path: String },

    #[error("implementer may not modify {path} under {tests_dir}/")]
    InsideTests { tests_dir: String, path: String },

    #[error("implementer returned no edits")]
    EmptyModification,
}

/// Check the file the tester wants to create.
pub fn check_tester_path(tests_dir: &str, path: &str) -> Result<(), ScopeViolation> {
    ensure_relative(path)?;
    if !is_under(tests_dir, path) {
        return Err(ScopeViolation::OutsideTests {
            tests_dir: tests_dir.to_string(),
            path: path.to_string(),
        });
    }
    Ok(())
}

/// Check every edit the implementer wants to apply.
pub fn check_implementer_edits(tests_dir: &str, edits: &[FileEdit]) -> Result<(), ScopeViolation> {
    if edits.is_empty() {
        return Err(ScopeViolation::EmptyModification);
    }
    for edit in edits {
        ensure_relative(&edit.path)?;
        if is_under(tests_dir, &edit.path) {
            return Err(ScopeViolation::InsideTests {
                tests_dir: tests_dir.to_string(),
                path: edit.path.clone(),
            });
        }
    }
    Ok(())
}

fn ensure_relative(path: &str) -> Result<(), ScopeViolation> {
    let ok = !path.is_empty()
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if ok {
        Ok(())
    } else {
        Err(ScopeViolation::Escapes(path.to_string()))
    }
}

fn is_under(dir: &str, path: &str) -> bool {
    let dir = Path::new(dir.trim_end_matches('/'));
    let normalized: std::path::PathBuf = Path::new(path)
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();
    normalized.starts_with(dir) && normalized != dir
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tester_may_write_inside_tests_dir() {
        check_tester_path("tests", "tests/adder.rs").expect("allowed");
        check_tester_path("tests/", "./tests/unit/adder.rs").expect("allowed");
    }

    #[test]
    fn tester_may_not_write_sources() {
        let err = check_tester_path("tests", "src/lib.rs").unwrap_err();
        assert!(matches!(err, ScopeViolation::OutsideTests { .. }));
        // prefix match is by component, not by string
        assert!(check_tester_path("tests", "tests_helper.rs").is_err());
    }

    #[test]
    fn escaping_paths_are_rejected() {
        assert_eq!(
            check_tester_path("tests", "tests/../src/lib.rs").unwrap_err(),
            ScopeViolation::Escapes("tests/../src/lib.rs".to_string())
        );
        assert!(check_tester_path("tests", "/etc/passwd").is_err());
    }

    #[test]
    fn implementer_may_not_touch_tests() {
        let edits = vec![
            FileEdit::write("src/lib.rs", "fn add() {}"),
            FileEdit::delete("tests/adder.rs"),
        ];
        let err = check_implementer_edits("tests", &edits).unwrap_err();
        assert_eq!(
            err.to_string(),
            "implementer may not modify tests/adder.rs under tests/"
        );
    }

    #[test]
    fn implementer_must_change_something() {
        assert_eq!(
            check_implementer_edits("tests", &[]).unwrap_err(),
            ScopeViolation::EmptyModification
        );
    }
}
