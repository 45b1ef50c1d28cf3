use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use reqwest::Client;
use thiserror::Error;
use futures_util::StreamExt;
use tracing::debug;

use crate::config::InstallerConfig;
use crate::integrity::{ChecksumVerifier, IntegrityError};
use crate::models::{FailureKind, FileFailure, RemoteFile};

/// Errors of a single file transfer.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("server answered {status} for {url}")]
    Status { url: String, status: u16 },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("no data received from {url} for {timeout:?}")]
    Stalled { url: String, timeout: Duration },
    #[error("{url} sent {actual} bytes, expected {expected}")]
    SizeMismatch { url: String, expected: u64, actual: u64 },
    #[error("io error on {}: {source}", .path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("refusing to write outside the model directory: {}", .0.display())]
    InvalidPath(PathBuf),
    #[error(transparent)]
    Checksum(#[from] IntegrityError),
    #[error("transfer cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::Status { .. }
            | FetchError::Network(_)
            | FetchError::Stalled { .. }
            | FetchError::SizeMismatch { .. } => FailureKind::Transfer,
            FetchError::Filesystem { .. } | FetchError::InvalidPath(_) => FailureKind::Filesystem,
            FetchError::Checksum(_) => FailureKind::Checksum,
            FetchError::Cancelled => FailureKind::Cancelled,
        }
    }

    /// Turns the error into the failure entry recorded on the job.
    pub fn into_failure(self, relative_path: &Path) -> FileFailure {
        FileFailure::new(relative_path, self.kind(), self.to_string())
    }

    fn filesystem(path: &Path) -> impl FnOnce(std::io::Error) -> FetchError + '_ {
        move |source| FetchError::Filesystem { path: path.to_path_buf(), source }
    }
}

/// Transfers single files to disk.
#[derive(Debug, Clone)]
pub struct FileFetcher {
    client: Client,
    chunk_size: usize,
    read_timeout: Duration,
    verify_checksums: bool,
}

impl FileFetcher {
    pub fn from_config(config: &InstallerConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: &InstallerConfig) -> Self {
        Self {
            client,
            chunk_size: config.chunk_size.max(1),
            read_timeout: config.read_timeout(),
            verify_checksums: config.verify_checksums,
        }
    }

    /// Streams `file` to `model_dir/file.relative_path`.
    ///
    /// `on_chunk` is called with the length of every slice right after it was
    /// written. An existing file at the target is truncated. Returns the number
    /// of bytes written.
    pub async fn fetch<F>(
        &self,
        file: &RemoteFile,
        model_dir: &Path,
        cancel: &CancellationToken,
        mut on_chunk: F,
    ) -> Result<u64, FetchError>
    where
        F: FnMut(u64) + Send,
    {
        let path = resolve_local_path(model_dir, &file.relative_path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(FetchError::filesystem(parent))?;
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            response = self.client.get(&file.url).send() => response?,
        };
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status { url: file.url.clone(), status: status.as_u16() });
        }

        let mut verifier = if self.verify_checksums {
            file.checksum.as_deref().and_then(ChecksumVerifier::for_expected)
        } else {
            None
        };

        let mut out = File::create(&path).await.map_err(FetchError::filesystem(&path))?;
        let mut stream = response.bytes_stream();
        let mut transferred = 0u64;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                next = tokio::time::timeout(self.read_timeout, stream.next()) => next,
            };
            let chunk = match next {
                Ok(Some(chunk)) => chunk?,
                Ok(None) => break,
                Err(_) => {
                    return Err(FetchError::Stalled { url: file.url.clone(), timeout: self.read_timeout })
                }
            };
            for piece in chunk.chunks(self.chunk_size) {
                out.write_all(piece).await.map_err(FetchError::filesystem(&path))?;
                if let Some(verifier) = verifier.as_mut() {
                    verifier.update(piece);
                }
                transferred += piece.len() as u64;
                on_chunk(piece.len() as u64);
            }
        }
        out.flush().await.map_err(FetchError::filesystem(&path))?;

        if let Some(expected) = file.size {
            if transferred != expected {
                return Err(FetchError::SizeMismatch {
                    url: file.url.clone(),
                    expected,
                    actual: transferred,
                });
            }
        }

        if let Some(verifier) = verifier {
            verifier.finish()?;
        }

        debug!(file = %file.relative_path.display(), bytes = transferred, "file transferred");
        Ok(transferred)
    }
}

/// Joins `relative` onto `model_dir`, rejecting absolute paths and `..`.
pub fn resolve_local_path(model_dir: &Path, relative: &Path) -> Result<PathBuf, FetchError> {
    let mut resolved = model_dir.to_path_buf();
    let mut has_name = false;
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                has_name = true;
            }
            Component::CurDir => {}
            _ => return Err(FetchError::InvalidPath(relative.to_path_buf())),
        }
    }
    if !has_name {
        return Err(FetchError::InvalidPath(relative.to_path_buf()));
    }
    Ok(resolved)
}
