use std::path::Path;
use std::sync::Arc;

use backupd_scheduler::InvocationDescriptor;
use tracing::{debug, info};

use crate::{
    archive::{build_archive, Archive},
    error::{PipelineError, Result},
    matcher::FileMatcher,
    sink::ArchiveSink,
};

/// What a completed run produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupOutcome {
    pub files: usize,
    pub bytes: u64,
}

/// Match → archive → ship, for one invocation at a time.
pub struct BackupPipeline {
    sink: Arc<dyn ArchiveSink>,
    compression_level: u32,
}

impl BackupPipeline {
    pub fn new(sink: Arc<dyn ArchiveSink>, compression_level: u32) -> Self {
        Self {
            sink,
            compression_level,
        }
    }

    pub fn sink_name(&self) -> &str {
        self.sink.name()
    }

    /// Run one backup. Returns [`PipelineError::Cancelled`] as soon as the
    /// invocation's scope is found revoked; nothing reaches the sink after that.
    pub async fn run(&self, invocation: &InvocationDescriptor) -> Result<BackupOutcome> {
        let cancel = invocation.scope.token().clone();
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let search = Arc::clone(&invocation.search_definition);
        let level = self.compression_level;
        let token = cancel.clone();
        let archive = tokio::task::spawn_blocking(move || -> Result<Archive> {
            let matcher = FileMatcher::new(&search.include_patterns, &search.exclude_patterns)?;
            let directory = Path::new(&search.directory);
            let files = matcher.find(directory, &token)?;
            debug!(directory = %directory.display(), files = files.len(), "files matched");
            build_archive(directory, &files, level, &token)
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("archive task failed: {e}")))??;

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        self.sink
            .write(&invocation.archive_name(), archive.path(), &cancel)
            .await?;

        let outcome = BackupOutcome {
            files: archive.entries(),
            bytes: archive.size(),
        };
        info!(
            profile_id = %invocation.profile_id,
            files = outcome.files,
            bytes = outcome.bytes,
            sink = self.sink.name(),
            "backup completed"
        );
        Ok(outcome)
    }
}
