//! Glob-based file selection for a profile's search definition.

use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use walkdir::WalkDir;

use crate::error::{PipelineError, Result};

/// Compiled include/exclude patterns.
///
/// Patterns match paths relative to the searched directory. `*` stays inside
/// one path component and `**` spans any number of them, so `*.txt` only
/// matches top-level files while `**/*.txt` matches at any depth.
#[derive(Debug, Clone)]
pub struct FileMatcher {
    /// `None` when no include pattern was given: every file is included.
    include: Option<GlobSet>,
    exclude: GlobSet,
}

impl FileMatcher {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        let include = if include.is_empty() {
            None
        } else {
            Some(compile(include)?)
        };
        Ok(Self {
            include,
            exclude: compile(exclude)?,
        })
    }

    /// Whether a path relative to the searched directory is selected.
    pub fn is_match(&self, relative: &Path) -> bool {
        let included = self
            .include
            .as_ref()
            .map_or(true, |set| set.is_match(relative));
        included && !self.exclude.is_match(relative)
    }

    /// Absolute paths of every selected regular file under `directory`, sorted.
    ///
    /// Symlinks are not followed. Unreadable entries are logged and skipped.
    pub fn find(&self, directory: &Path, cancel: &CancellationToken) -> Result<Vec<PathBuf>> {
        let root = directory
            .canonicalize()
            .ok()
            .filter(|p| p.is_dir())
            .ok_or_else(|| PipelineError::DirectoryNotFound(directory.display().to_string()))?;

        let mut files = Vec::new();
        for entry in WalkDir::new(&root).follow_links(false) {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(directory = %root.display(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let selected = entry
                .path()
                .strip_prefix(&root)
                .map(|relative| self.is_match(relative))
                .unwrap_or(false);
            if selected {
                files.push(entry.into_path());
            }
        }

        files.sort();
        Ok(files)
    }
}

fn compile(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| PipelineError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
        builder.add(glob);
    }
    builder.build().map_err(|e| PipelineError::InvalidPattern {
        pattern: patterns.join(", "),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn patterns(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for path in [
            "notes.txt",
            "report.doc",
            "docs/guide.md",
            "docs/drafts/wip.md",
            "src/main.rs",
            "temp/cache.txt",
        ] {
            let full = dir.path().join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, path).unwrap();
        }
        dir
    }

    fn relative(dir: &tempfile::TempDir, files: &[PathBuf]) -> Vec<String> {
        let root = dir.path().canonicalize().unwrap();
        files
            .iter()
            .map(|f| f.strip_prefix(&root).unwrap().to_string_lossy().replace('\\', "/"))
            .collect()
    }

    #[test]
    fn single_star_stays_in_one_component() {
        let matcher = FileMatcher::new(&patterns(&["*.txt"]), &[]).unwrap();
        assert!(matcher.is_match(Path::new("notes.txt")));
        assert!(!matcher.is_match(Path::new("temp/cache.txt")));
    }

    #[test]
    fn include_and_exclude_combine() {
        let dir = tree();
        let matcher =
            FileMatcher::new(&patterns(&["**/*.md", "*.txt"]), &patterns(&["**/drafts/**"]))
                .unwrap();

        let found = matcher.find(dir.path(), &CancellationToken::new()).unwrap();
        assert_eq!(relative(&dir, &found), vec!["docs/guide.md", "notes.txt"]);
        assert!(found.iter().all(|p| p.is_absolute()));
    }

    #[test]
    fn no_include_patterns_selects_everything_not_excluded() {
        let dir = tree();
        let matcher = FileMatcher::new(&[], &patterns(&["temp/**", "**/*.rs"])).unwrap();

        let found = matcher.find(dir.path(), &CancellationToken::new()).unwrap();
        assert_eq!(
            relative(&dir, &found),
            vec!["docs/drafts/wip.md", "docs/guide.md", "notes.txt", "report.doc"]
        );
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let err = FileMatcher::new(&patterns(&["[unclosed"]), &[]).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidPattern { .. }));
    }

    #[test]
    fn missing_directory_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let matcher = FileMatcher::new(&[], &[]).unwrap();
        let err = matcher
            .find(&dir.path().join("gone"), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, PipelineError::DirectoryNotFound(_)));
    }

    #[test]
    fn cancelled_walk_stops() {
        let dir = tree();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let matcher = FileMatcher::new(&[], &[]).unwrap();
        assert!(matcher.find(dir.path(), &cancel).unwrap_err().is_cancelled());
    }
}
