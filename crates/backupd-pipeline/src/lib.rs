//! `backupd-pipeline`: turns one invocation into a stored archive.
//!
//! [`FileMatcher`] selects files, [`build_archive`] packs them into a tar.gz,
//! and an [`ArchiveSink`] stores the result. [`BackupPipeline`] strings the
//! three together and checks the invocation's scope between steps.

pub mod archive;
pub mod error;
pub mod matcher;
pub mod pipeline;
pub mod sink;

pub use archive::{build_archive, Archive};
pub use error::{PipelineError, Result};
pub use matcher::FileMatcher;
pub use pipeline::{BackupOutcome, BackupPipeline};
pub use sink::{build_sink, ArchiveSink, BlobSink, FilesystemSink};
