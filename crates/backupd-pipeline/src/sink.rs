//! Destinations for finished archives.
//!
//! Both sinks overwrite: each profile keeps exactly one archive, named
//! `{profile}.tar.gz`, which the next run replaces.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use backupd_core::config::{BlobConfig, OutputConfig};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};

const COPY_CHUNK: usize = 64 * 1024;
const STORAGE_SCOPE: &str = "https://storage.azure.com/.default";
const BLOB_API_VERSION: &str = "2023-11-03";
/// Refresh a cached token this many seconds before it expires.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 120;

#[async_trait]
pub trait ArchiveSink: Send + Sync {
    /// Short label for logs.
    fn name(&self) -> &str;

    /// Store the archive at `archive` under `name`, replacing any previous one.
    async fn write(&self, name: &str, archive: &Path, cancel: &CancellationToken) -> Result<()>;
}

/// Build the sink described by the `[output]` section.
pub fn build_sink(config: &OutputConfig) -> Result<Arc<dyn ArchiveSink>> {
    match config {
        OutputConfig::Filesystem { path } => Ok(Arc::new(FilesystemSink::new(path))),
        OutputConfig::Blob(blob) => Ok(Arc::new(BlobSink::new(blob.clone())?)),
    }
}

/// Archive names become file or blob names, so they must be a single
/// non-special path component.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(PipelineError::InvalidName(name.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

pub struct FilesystemSink {
    root: PathBuf,
}

impl FilesystemSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ArchiveSink for FilesystemSink {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn write(&self, name: &str, archive: &Path, cancel: &CancellationToken) -> Result<()> {
        validate_name(name)?;
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let root = self.root.clone();
        let source = archive.to_path_buf();
        let target = root.join(name);
        let cancel = cancel.clone();

        // Stage next to the target so the final rename stays on one filesystem.
        let written = tokio::task::spawn_blocking(move || -> Result<PathBuf> {
            std::fs::create_dir_all(&root)?;
            let mut staged = tempfile::Builder::new()
                .prefix(".backupd-")
                .suffix(".partial")
                .tempfile_in(&root)?;
            let mut input = std::fs::File::open(&source)?;
            copy_cancellable(&mut input, staged.as_file_mut(), &cancel)?;
            staged.as_file().sync_all()?;
            staged
                .persist(&target)
                .map_err(|e| PipelineError::Io(e.error))?;
            Ok(target)
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("filesystem sink task failed: {e}")))??;

        info!(path = %written.display(), "archive stored");
        Ok(())
    }
}

fn copy_cancellable(
    input: &mut impl Read,
    output: &mut impl Write,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut total = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let n = input.read(&mut buf)?;
        if n == 0 {
            return Ok(total);
        }
        output.write_all(&buf[..n])?;
        total += n as u64;
    }
}

// ---------------------------------------------------------------------------
// Blob storage
// ---------------------------------------------------------------------------

/// Bearer token from the client-credentials grant, cached in memory.
struct CachedToken {
    token: String,
    expires_at: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

/// Uploads archives as block blobs with a single Put Blob request,
/// authenticating as a service principal.
pub struct BlobSink {
    client: reqwest::Client,
    config: BlobConfig,
    cached: Arc<RwLock<Option<CachedToken>>>,
}

impl BlobSink {
    pub fn new(config: BlobConfig) -> Result<Self> {
        for (field, value) in [
            ("endpoint", &config.endpoint),
            ("container", &config.container),
            ("tenant_id", &config.tenant_id),
            ("client_id", &config.client_id),
            ("client_secret", &config.client_secret),
        ] {
            if value.trim().is_empty() {
                return Err(PipelineError::Config(format!("output.{field} must be set")));
            }
        }
        let sink = Self {
            client: reqwest::Client::new(),
            config,
            cached: Arc::new(RwLock::new(None)),
        };
        // Fail at startup rather than on the first upload.
        sink.blob_url("probe")?;
        Ok(sink)
    }

    /// `{endpoint}/{container}/{name}`, percent-encoding each segment.
    pub fn blob_url(&self, name: &str) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.config.endpoint)
            .map_err(|e| PipelineError::Config(format!("invalid blob endpoint: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| PipelineError::Config("blob endpoint cannot be a base URL".into()))?
            .pop_if_empty()
            .push(&self.config.container)
            .push(name);
        Ok(url)
    }

    fn token_url(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.config.authority_host.trim_end_matches('/'),
            self.config.tenant_id
        )
    }

    async fn ensure_token(&self) -> Result<String> {
        let now = chrono::Utc::now().timestamp();
        {
            let cached = self.cached.read().await;
            if let Some(ref c) = *cached {
                if now + TOKEN_REFRESH_MARGIN_SECS < c.expires_at {
                    return Ok(c.token.clone());
                }
            }
        }

        let mut cached = self.cached.write().await;
        // Another upload may have refreshed it while we waited.
        let now = chrono::Utc::now().timestamp();
        if let Some(ref c) = *cached {
            if now + TOKEN_REFRESH_MARGIN_SECS < c.expires_at {
                return Ok(c.token.clone());
            }
        }

        let fresh = self.request_token().await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(token)
    }

    async fn request_token(&self) -> Result<CachedToken> {
        let resp = self
            .client
            .post(self.token_url())
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("scope", STORAGE_SCOPE),
            ])
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(PipelineError::Auth {
                status,
                message: text,
            });
        }

        let body: TokenResponse = resp.json().await?;
        let expires_at = chrono::Utc::now().timestamp() + body.expires_in;
        debug!(expires_at, "storage access token obtained");
        Ok(CachedToken {
            token: body.access_token,
            expires_at,
        })
    }
}

#[async_trait]
impl ArchiveSink for BlobSink {
    fn name(&self) -> &str {
        "blob"
    }

    async fn write(&self, name: &str, archive: &Path, cancel: &CancellationToken) -> Result<()> {
        validate_name(name)?;
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let url = self.blob_url(name)?;
        let token = self.ensure_token().await?;
        let file = tokio::fs::File::open(archive).await?;
        let length = file.metadata().await?.len();

        let request = self
            .client
            .put(url.clone())
            .bearer_auth(token)
            .header("x-ms-version", BLOB_API_VERSION)
            .header("x-ms-blob-type", "BlockBlob")
            .header(CONTENT_TYPE, "application/gzip")
            .header(CONTENT_LENGTH, length)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send();

        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            resp = request => resp?,
        };

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(PipelineError::Upload {
                status,
                message: text,
            });
        }

        info!(url = %url, bytes = length, "archive uploaded");
        Ok(())
    }
}
