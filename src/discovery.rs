//! Test-unit enumeration -- recursive walk of a directory, collecting files
//! whose names match a pattern. Called once per run.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::model::TestUnit;

/// Enumerate test units under `dir`: every regular file whose name contains
/// `pattern`, as sorted relative path strings. The sort keeps runs
/// deterministic.
pub fn discover(dir: &Path, pattern: &str) -> Result<Vec<TestUnit>> {
    let mut units = Vec::new();
    walk(dir, pattern, &mut units)
        .with_context(|| format!("failed to discover tests under {}", dir.display()))?;
    units.sort();
    debug!(dir = %dir.display(), count = units.len(), "discovered test units");
    Ok(units)
}

fn walk(dir: &Path, pattern: &str, units: &mut Vec<TestUnit>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk(&path, pattern, units)?;
        } else if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if name.contains(pattern) {
                units.push(path.to_string_lossy().into_owned());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_discover_matches_pattern_recursively() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("test_alpha.sh"), "exit 0").unwrap();
        fs::write(dir.path().join("helper.sh"), "exit 0").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested").join("test_beta.sh"), "exit 0").unwrap();

        let units = discover(dir.path(), "test_").unwrap();

        assert_eq!(units.len(), 2);
        assert!(units[0].ends_with("test_alpha.sh") || units[0].ends_with("test_beta.sh"));
        assert!(units.iter().all(|u| !u.contains("helper")));
    }

    #[test]
    fn test_discover_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let units = discover(dir.path(), "test").unwrap();
        assert!(units.is_empty());
    }

    #[test]
    fn test_discover_missing_dir_is_an_error() {
        assert!(discover(Path::new("/definitely/not/here"), "test").is_err());
    }
}
