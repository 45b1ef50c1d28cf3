// src/models.rs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::events::LifecycleEvent;

/// Identifier handed out for every installation.
pub type JobId = Uuid;

/// One downloadable unit of a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub url: String,
    /// Location of the file inside the model directory, e.g. `unet/config.json`.
    pub relative_path: PathBuf,
    /// Size in bytes, when the remote publishes one.
    pub size: Option<u64>,
    /// Hex encoded SHA-256 published by the remote.
    pub checksum: Option<String>,
}

impl RemoteFile {
    pub fn new(url: impl Into<String>, relative_path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            relative_path: relative_path.into(),
            size: None,
            checksum: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }
}

/// The resolved file list of one installable model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub model_id: String,
    /// Short model name; doubles as the model's directory name on disk.
    pub display_name: String,
    pub files: Vec<RemoteFile>,
}

impl Manifest {
    /// Sum of all known file sizes.
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().filter_map(|f| f.size).sum()
    }

    /// True when every file carries a size, i.e. `total_bytes` is exact.
    pub fn sizes_known(&self) -> bool {
        self.files.iter().all(|f| f.size.is_some())
    }

    /// Directory the files of this model are written into.
    pub fn model_dir(&self, destination_dir: &Path) -> PathBuf {
        destination_dir.join(&self.display_name)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// Category of a per-file failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transfer,
    Filesystem,
    Checksum,
    Cancelled,
}

/// A failure recorded against one file of a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileFailure {
    pub relative_path: PathBuf,
    pub kind: FailureKind,
    pub message: String,
}

impl FileFailure {
    pub fn new(relative_path: impl Into<PathBuf>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            relative_path: relative_path.into(),
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for FileFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.relative_path.display(), self.message)
    }
}

/// Byte counter of a single file within a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileProgress {
    pub relative_path: PathBuf,
    pub size: Option<u64>,
    pub bytes_downloaded: u64,
}

/// The mutable state of one installation.
///
/// Owned by the orchestrator for the job's lifetime; everyone else gets clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: JobId,
    pub model_id: String,
    pub destination_dir: PathBuf,
    /// Sum of the known file sizes.
    pub total_bytes: u64,
    /// False when at least one file had no size, making `total_bytes` partial.
    pub sizes_known: bool,
    pub bytes_downloaded: u64,
    pub files: Vec<FileProgress>,
    pub status: JobStatus,
    pub errors: Vec<FileFailure>,
}

impl DownloadJob {
    pub fn new(id: JobId, manifest: &Manifest, destination_dir: PathBuf) -> Self {
        Self {
            id,
            model_id: manifest.model_id.clone(),
            destination_dir,
            total_bytes: manifest.total_bytes(),
            sizes_known: manifest.sizes_known(),
            bytes_downloaded: 0,
            files: manifest
                .files
                .iter()
                .map(|f| FileProgress {
                    relative_path: f.relative_path.clone(),
                    size: f.size,
                    bytes_downloaded: 0,
                })
                .collect(),
            status: JobStatus::Pending,
            errors: Vec::new(),
        }
    }

    /// Adds `len` bytes to file `index` and to the aggregate. Returns the new aggregate.
    pub fn record_chunk(&mut self, index: usize, len: u64) -> u64 {
        if let Some(file) = self.files.get_mut(index) {
            file.bytes_downloaded += len;
        }
        self.bytes_downloaded += len;
        self.bytes_downloaded
    }

    /// Moves to `next` if the state machine allows it.
    pub fn transition(&mut self, next: JobStatus) -> bool {
        if self.status.can_transition(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    /// Total that percentages are measured against: zero (unknown) unless
    /// every file carries a size.
    pub fn progress_total(&self) -> u64 {
        if self.sizes_known {
            self.total_bytes
        } else {
            0
        }
    }

    pub fn percentage(&self) -> f64 {
        if self.status == JobStatus::Completed {
            return 100.0;
        }
        percentage(self.bytes_downloaded, self.progress_total())
    }
}

/// `done / total * 100`, clamped to `0..=100`. Zero when the total is unknown.
pub fn percentage(done: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (done as f64 / total as f64 * 100.0).min(100.0)
    }
}

/// The externally visible state of a job, as kept by the job registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub job_id: JobId,
    pub model_id: String,
    pub destination_dir: PathBuf,
    pub status: JobStatus,
    pub percentage: f64,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub errors: Vec<FileFailure>,
}

impl JobRecord {
    pub fn started(job_id: JobId, model_id: impl Into<String>, destination_dir: impl Into<PathBuf>) -> Self {
        Self {
            job_id,
            model_id: model_id.into(),
            destination_dir: destination_dir.into(),
            status: JobStatus::Running,
            percentage: 0.0,
            bytes_downloaded: 0,
            total_bytes: 0,
            errors: Vec::new(),
        }
    }

    /// Folds a lifecycle event into the record.
    ///
    /// Returns false when the event was ignored: it belongs to another job,
    /// the record is already terminal, or it is a repeated `Started`.
    pub fn apply(&mut self, event: &LifecycleEvent) -> bool {
        if event.job_id() != self.job_id || self.status.is_terminal() {
            return false;
        }
        match event {
            LifecycleEvent::Started { .. } => false,
            LifecycleEvent::Progress {
                bytes_downloaded,
                total_bytes,
                percentage,
                ..
            } => {
                self.bytes_downloaded = self.bytes_downloaded.max(*bytes_downloaded);
                self.total_bytes = *total_bytes;
                self.percentage = self.percentage.max(*percentage);
                true
            }
            LifecycleEvent::Completed { total_bytes, .. } => {
                self.status = JobStatus::Completed;
                self.total_bytes = *total_bytes;
                self.bytes_downloaded = self.bytes_downloaded.max(*total_bytes);
                self.percentage = 100.0;
                true
            }
            LifecycleEvent::Failed { errors, .. } => {
                self.status = JobStatus::Failed;
                self.errors = errors.clone();
                true
            }
        }
    }
}
