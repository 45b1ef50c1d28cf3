// src/manager.rs

use crate::config::InstallerConfig;
use crate::downloader::FileFetcher;
use crate::events::{EventSink, LifecycleEvent};
use crate::models::{DownloadJob, FailureKind, FileFailure, JobId, JobStatus, Manifest};
use crate::progress::ProgressReporter;
use crate::resolver::{ManifestFetchError, ManifestResolver};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The terminal error of a job whose files did not all arrive.
#[derive(Debug, Clone, Error)]
#[error("encountered {} errors while installing job {job_id}", .failures.len())]
pub struct AggregateInstallError {
    pub job_id: JobId,
    pub failures: Vec<FileFailure>,
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestFetchError),
    #[error(transparent)]
    Aggregate(#[from] AggregateInstallError),
    #[error("install task aborted: {0}")]
    Aborted(String),
}

/// Byte delta reported by one fetch task.
#[derive(Debug, Clone, Copy)]
struct ChunkProgress {
    file_index: usize,
    len: u64,
}

/// Schedules file fetches for manifests with bounded parallelism and reports
/// their lifecycle to an event sink.
pub struct Installer {
    fetcher: Arc<FileFetcher>,
    sink: Arc<dyn EventSink>,
    max_concurrency: usize,
}

impl Installer {
    pub fn new(fetcher: FileFetcher, sink: Arc<dyn EventSink>, max_concurrency: usize) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            sink,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn from_config(config: &InstallerConfig, sink: Arc<dyn EventSink>) -> Result<Self, reqwest::Error> {
        Ok(Self::new(FileFetcher::from_config(config)?, sink, config.max_concurrency))
    }

    /// Starts installing `manifest` into `destination_dir/<model name>`.
    ///
    /// Must be called from within a tokio runtime. The returned handle can be
    /// polled, awaited and cancelled.
    pub fn install(&self, manifest: Manifest, destination_dir: PathBuf) -> JobHandle {
        let job_id = Uuid::new_v4();
        let job = DownloadJob::new(job_id, &manifest, destination_dir);
        let (snapshot_tx, snapshot_rx) = watch::channel(job);
        let cancel = CancellationToken::new();

        let run = JobRun {
            job_id,
            fetcher: Arc::clone(&self.fetcher),
            sink: Arc::clone(&self.sink),
            max_concurrency: self.max_concurrency,
            snapshot: Arc::new(snapshot_tx),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(run.execute(manifest));

        JobHandle { job_id, snapshot: snapshot_rx, cancel, task }
    }

    /// Resolves `model_id` and starts installing it.
    ///
    /// A resolution failure is returned directly: no job is created, no
    /// events are emitted and no file is attempted.
    pub async fn install_model(
        &self,
        resolver: &dyn ManifestResolver,
        model_id: &str,
        variant: Option<&str>,
        destination_dir: PathBuf,
    ) -> Result<JobHandle, ManifestFetchError> {
        let manifest = match resolver.resolve(model_id, variant).await {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(model_id, error = %e, "manifest resolution failed");
                return Err(e);
            }
        };
        Ok(self.install(manifest, destination_dir))
    }
}

/// Caller side of a running installation.
#[derive(Debug)]
pub struct JobHandle {
    job_id: JobId,
    snapshot: watch::Receiver<DownloadJob>,
    cancel: CancellationToken,
    task: JoinHandle<Result<DownloadJob, AggregateInstallError>>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.job_id
    }

    /// A copy of the job's current state.
    pub fn snapshot(&self) -> DownloadJob {
        self.snapshot.borrow().clone()
    }

    pub fn status(&self) -> JobStatus {
        self.snapshot.borrow().status
    }

    /// Receiver notified on every state change of the job.
    pub fn subscribe(&self) -> watch::Receiver<DownloadJob> {
        self.snapshot.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops admitting files and aborts in-flight transfers.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this job, for callers that do not own the handle.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the terminal state.
    pub async fn wait(self) -> Result<DownloadJob, InstallError> {
        match self.task.await {
            Ok(Ok(job)) => Ok(job),
            Ok(Err(e)) => Err(InstallError::Aggregate(e)),
            Err(e) => Err(InstallError::Aborted(e.to_string())),
        }
    }
}

/// Everything one job needs, moved into its task.
struct JobRun {
    job_id: JobId,
    fetcher: Arc<FileFetcher>,
    sink: Arc<dyn EventSink>,
    max_concurrency: usize,
    snapshot: Arc<watch::Sender<DownloadJob>>,
    cancel: CancellationToken,
}

impl JobRun {
    async fn execute(self, manifest: Manifest) -> Result<DownloadJob, AggregateInstallError> {
        let JobRun { job_id, fetcher, sink, max_concurrency, snapshot, cancel } = self;
        let (destination_dir, total_bytes, progress_total) = {
            let job = snapshot.borrow();
            (job.destination_dir.clone(), job.total_bytes, job.progress_total())
        };

        info!(%job_id, model_id = %manifest.model_id, files = manifest.files.len(), total_bytes, "install started");
        sink.publish(LifecycleEvent::Started {
            job_id,
            model_id: manifest.model_id.clone(),
            destination_dir: destination_dir.clone(),
        });
        let guard = TerminalGuard::new(job_id, Arc::clone(&sink));
        snapshot.send_modify(|job| {
            job.transition(JobStatus::Running);
        });

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let aggregator = tokio::spawn(aggregate_progress(
            job_id,
            chunk_rx,
            Arc::clone(&snapshot),
            Arc::clone(&sink),
            ProgressReporter::new(progress_total),
        ));

        let model_dir = manifest.model_dir(&destination_dir);
        let semaphore = Arc::new(Semaphore::new(max_concurrency));
        let mut fetches = JoinSet::new();

        for (file_index, file) in manifest.files.into_iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                let failure = FileFailure::new(&file.relative_path, FailureKind::Cancelled, "cancelled before start");
                snapshot.send_modify(|job| job.errors.push(failure));
                continue;
            };

            let fetcher = Arc::clone(&fetcher);
            let chunk_tx = chunk_tx.clone();
            let cancel = cancel.clone();
            let model_dir = model_dir.clone();
            fetches.spawn(async move {
                let _permit = permit;
                let result = fetcher
                    .fetch(&file, &model_dir, &cancel, |len| {
                        let _ = chunk_tx.send(ChunkProgress { file_index, len });
                    })
                    .await;
                (file.relative_path, result)
            });
        }
        drop(chunk_tx);

        while let Some(joined) = fetches.join_next().await {
            let failure = match joined {
                Ok((path, Ok(bytes))) => {
                    debug!(%job_id, file = %path.display(), bytes, "fetch finished");
                    continue;
                }
                Ok((path, Err(e))) => {
                    warn!(%job_id, file = %path.display(), error = %e, "fetch failed");
                    e.into_failure(&path)
                }
                Err(e) => {
                    warn!(%job_id, error = %e, "fetch task aborted");
                    FileFailure::new(PathBuf::new(), FailureKind::Transfer, format!("fetch task aborted: {e}"))
                }
            };
            snapshot.send_modify(|job| job.errors.push(failure));
        }

        // All senders are gone once every fetch task finished, so this drains and ends.
        let mut reporter = match aggregator.await {
            Ok(reporter) => reporter,
            Err(e) => {
                warn!(%job_id, error = %e, "progress aggregation aborted");
                ProgressReporter::new(progress_total)
            }
        };

        let (bytes_downloaded, failures) = {
            let job = snapshot.borrow();
            (job.bytes_downloaded, job.errors.clone())
        };

        if failures.is_empty() {
            if let Some(tick) = reporter.finish(bytes_downloaded) {
                sink.publish(tick.into_event(job_id));
            }
            snapshot.send_modify(|job| {
                job.transition(JobStatus::Completed);
            });
            guard.disarm();
            sink.publish(LifecycleEvent::Completed {
                job_id,
                total_bytes: total_bytes.max(bytes_downloaded),
            });
            info!(%job_id, bytes_downloaded, "install completed");
            let job = snapshot.borrow().clone();
            Ok(job)
        } else {
            snapshot.send_modify(|job| {
                job.transition(JobStatus::Failed);
            });
            guard.disarm();
            sink.publish(LifecycleEvent::Failed { job_id, errors: failures.clone() });
            warn!(%job_id, errors = failures.len(), "install failed");
            Err(AggregateInstallError { job_id, failures })
        }
    }
}

/// Publishes `Failed` for a job whose task stops (panic, runtime shutdown)
/// before it published a terminal event.
struct TerminalGuard {
    job_id: JobId,
    sink: Arc<dyn EventSink>,
    armed: bool,
}

impl TerminalGuard {
    fn new(job_id: JobId, sink: Arc<dyn EventSink>) -> Self {
        Self { job_id, sink, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(job_id = %self.job_id, "install task stopped without a terminal state");
        self.sink.publish(LifecycleEvent::Failed {
            job_id: self.job_id,
            errors: vec![FileFailure::new(
                PathBuf::new(),
                FailureKind::Cancelled,
                "install task stopped before finishing",
            )],
        });
    }
}

/// Single consumer of all chunk deltas of a job: updates the counters and
/// publishes throttled progress events. Returns once every sender is dropped.
async fn aggregate_progress(
    job_id: JobId,
    mut chunks: mpsc::UnboundedReceiver<ChunkProgress>,
    snapshot: Arc<watch::Sender<DownloadJob>>,
    sink: Arc<dyn EventSink>,
    mut reporter: ProgressReporter,
) -> ProgressReporter {
    while let Some(chunk) = chunks.recv().await {
        let mut bytes_downloaded = 0;
        snapshot.send_modify(|job| bytes_downloaded = job.record_chunk(chunk.file_index, chunk.len));
        if let Some(tick) = reporter.on_progress(bytes_downloaded) {
            sink.publish(tick.into_event(job_id));
        }
    }
    reporter
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::JobRegistry;
    use crate::state_manager::MemoryJobStore;
    use std::time::Duration;

    #[test]
    fn dropped_guard_publishes_failed() {
        let (tx, mut rx) = mpsc::unbounded_channel::<LifecycleEvent>();
        let job_id = Uuid::new_v4();
        drop(TerminalGuard::new(job_id, Arc::new(tx)));

        match rx.try_recv() {
            Ok(LifecycleEvent::Failed { job_id: id, errors }) => {
                assert_eq!(id, job_id);
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].kind, FailureKind::Cancelled);
            }
            other => panic!("expected failed event, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn disarmed_guard_stays_silent() {
        let (tx, mut rx) = mpsc::unbounded_channel::<LifecycleEvent>();
        TerminalGuard::new(Uuid::new_v4(), Arc::new(tx)).disarm();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stopped_task_leaves_no_running_job_behind() {
        let registry = JobRegistry::spawn(Arc::new(MemoryJobStore::new()));
        let mut updates = registry.subscribe();
        let job_id = Uuid::new_v4();

        registry.publish(LifecycleEvent::Started {
            job_id,
            model_id: "acme/tiny".into(),
            destination_dir: "/tmp/models".into(),
        });
        // Stands in for a job task that unwinds after `Started`.
        drop(TerminalGuard::new(job_id, Arc::new(registry.clone())));

        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(5), updates.recv())
                .await
                .expect("update in time")
                .expect("channel open");
        }
        let record = registry.status(job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
    }
}
