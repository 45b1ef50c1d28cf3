// src/progress.rs

use crate::events::LifecycleEvent;
use crate::models::{percentage, JobId};

/// Reporting step used while the total size of a job is unknown.
const UNKNOWN_TOTAL_STEP: u64 = 1024 * 1024;

/// A progress value that passed the throttle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressTick {
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub percentage: f64,
}

impl ProgressTick {
    pub fn into_event(self, job_id: JobId) -> LifecycleEvent {
        LifecycleEvent::Progress {
            job_id,
            bytes_downloaded: self.bytes_downloaded,
            total_bytes: self.total_bytes,
            percentage: self.percentage,
        }
    }
}

/// Decides which aggregate byte counts become `Progress` events.
///
/// A tick is produced once at least 1% of the total arrived since the last
/// one, or when the aggregate reaches the total. The 100% tick is produced at
/// most once; nothing follows it.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    total_bytes: u64,
    step: u64,
    last_reported: u64,
    reported_full: bool,
}

impl ProgressReporter {
    pub fn new(total_bytes: u64) -> Self {
        let step = if total_bytes == 0 {
            UNKNOWN_TOTAL_STEP
        } else {
            (total_bytes / 100).max(1)
        };
        Self {
            total_bytes,
            step,
            last_reported: 0,
            reported_full: false,
        }
    }

    /// Feeds the current aggregate. Callers must pass non-decreasing values.
    pub fn on_progress(&mut self, bytes_downloaded: u64) -> Option<ProgressTick> {
        if self.reported_full {
            return None;
        }
        let reached_total = self.total_bytes > 0 && bytes_downloaded >= self.total_bytes;
        if !reached_total && bytes_downloaded.saturating_sub(self.last_reported) < self.step {
            return None;
        }
        self.last_reported = bytes_downloaded;
        let percentage = percentage(bytes_downloaded, self.total_bytes);
        if percentage >= 100.0 {
            self.reported_full = true;
        }
        Some(ProgressTick {
            bytes_downloaded,
            total_bytes: self.total_bytes,
            percentage,
        })
    }

    /// The closing 100% tick of a successful job, unless one was already produced.
    pub fn finish(&mut self, bytes_downloaded: u64) -> Option<ProgressTick> {
        if self.reported_full {
            return None;
        }
        self.reported_full = true;
        self.last_reported = bytes_downloaded;
        Some(ProgressTick {
            bytes_downloaded,
            total_bytes: self.total_bytes.max(bytes_downloaded),
            percentage: 100.0,
        })
    }
}
