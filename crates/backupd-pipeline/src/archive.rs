use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use flate2::{write::GzEncoder, Compression};
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

/// A finished tar.gz on local disk. The file is deleted when this is dropped.
#[derive(Debug)]
pub struct Archive {
    file: NamedTempFile,
    entries: usize,
    size: u64,
}

impl Archive {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Number of files stored.
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Compressed size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Pack `files` into a gzip-compressed tarball, naming each entry by its path
/// relative to `directory`.
///
/// Files that disappear between matching and archiving are skipped. Checks
/// `cancel` before every entry; a cancelled build leaves nothing behind.
pub fn build_archive(
    directory: &Path,
    files: &[PathBuf],
    level: u32,
    cancel: &CancellationToken,
) -> Result<Archive> {
    let root = directory
        .canonicalize()
        .map_err(|_| PipelineError::DirectoryNotFound(directory.display().to_string()))?;

    let file = tempfile::Builder::new()
        .prefix("backupd-")
        .suffix(".tar.gz")
        .tempfile()?;

    let mut entries = 0;
    {
        let encoder = GzEncoder::new(file.as_file(), Compression::new(level.min(9)));
        let mut tar = tar::Builder::new(encoder);
        tar.follow_symlinks(false);

        for path in files {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let name = path.strip_prefix(&root).map_err(|_| {
                PipelineError::Internal(format!(
                    "{} is outside {}",
                    path.display(),
                    root.display()
                ))
            })?;
            match tar.append_path_with_name(path, name) {
                Ok(()) => entries += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    warn!(path = %path.display(), "file vanished before it could be archived");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut out = tar.into_inner()?.finish()?;
        out.flush()?;
    }

    let size = file.as_file().metadata()?.len();
    debug!(archive = %file.path().display(), entries, size, "archive built");
    Ok(Archive {
        file,
        entries,
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::fs;

    fn entry_names(path: &Path) -> Vec<String> {
        let reader = GzDecoder::new(fs::File::open(path).unwrap());
        let mut archive = tar::Archive::new(reader);
        let mut names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn source() -> (tempfile::TempDir, Vec<PathBuf>) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("notes.txt"), "hello").unwrap();
        fs::write(dir.path().join("docs/guide.md"), "# guide").unwrap();
        let root = dir.path().canonicalize().unwrap();
        let files = vec![root.join("docs/guide.md"), root.join("notes.txt")];
        (dir, files)
    }

    #[test]
    fn entries_are_relative_to_directory() {
        let (dir, files) = source();
        let archive = build_archive(dir.path(), &files, 6, &CancellationToken::new()).unwrap();

        assert_eq!(archive.entries(), 2);
        assert!(archive.size() > 0);
        assert_eq!(entry_names(archive.path()), vec!["docs/guide.md", "notes.txt"]);
    }

    #[test]
    fn empty_selection_yields_valid_empty_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = build_archive(dir.path(), &[], 6, &CancellationToken::new()).unwrap();
        assert_eq!(archive.entries(), 0);
        assert!(entry_names(archive.path()).is_empty());
    }

    #[test]
    fn vanished_file_is_skipped() {
        let (dir, mut files) = source();
        files.push(dir.path().canonicalize().unwrap().join("deleted.txt"));

        let archive = build_archive(dir.path(), &files, 1, &CancellationToken::new()).unwrap();
        assert_eq!(archive.entries(), 2);
    }

    #[test]
    fn cancelled_build_fails() {
        let (dir, files) = source();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = build_archive(dir.path(), &files, 6, &cancel).unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn archive_file_is_deleted_on_drop() {
        let (dir, files) = source();
        let archive = build_archive(dir.path(), &files, 6, &CancellationToken::new()).unwrap();
        let path = archive.path().to_path_buf();
        assert!(path.exists());
        drop(archive);
        assert!(!path.exists());
    }
}
