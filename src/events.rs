// src/events.rs

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::mpsc;

use crate::models::{FileFailure, JobId};

/// Externally observable state changes of a job.
///
/// For one job the order is always: one `Started`, any number of `Progress`
/// with non-decreasing byte counts, then exactly one `Completed` or `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Started {
        job_id: JobId,
        model_id: String,
        destination_dir: PathBuf,
    },
    Progress {
        job_id: JobId,
        bytes_downloaded: u64,
        total_bytes: u64,
        percentage: f64,
    },
    Completed {
        job_id: JobId,
        total_bytes: u64,
    },
    Failed {
        job_id: JobId,
        errors: Vec<FileFailure>,
    },
}

impl LifecycleEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            LifecycleEvent::Started { job_id, .. }
            | LifecycleEvent::Progress { job_id, .. }
            | LifecycleEvent::Completed { job_id, .. }
            | LifecycleEvent::Failed { job_id, .. } => *job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleEvent::Completed { .. } | LifecycleEvent::Failed { .. })
    }

    /// Event name used on the server-push stream.
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Started { .. } => "started",
            LifecycleEvent::Progress { .. } => "progress",
            LifecycleEvent::Completed { .. } => "complete",
            LifecycleEvent::Failed { .. } => "failed",
        }
    }
}

/// Receiver of lifecycle events.
///
/// Delivery is fire-and-forget: implementations must not block and have no
/// way to fail the download.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: LifecycleEvent);
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn publish(&self, _event: LifecycleEvent) {}
}

impl EventSink for mpsc::UnboundedSender<LifecycleEvent> {
    fn publish(&self, event: LifecycleEvent) {
        if self.send(event).is_err() {
            tracing::debug!("event receiver dropped");
        }
    }
}
