//! Job registry.
//!
//! Receives lifecycle events from installers, folds them into [`JobRecord`]s
//! kept in a [`JobStore`], and fans every change out to stream subscribers.
//! Events are applied by one consumer task, in the order they were published.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::events::{EventSink, LifecycleEvent};
use crate::models::{JobId, JobRecord};
use crate::state_manager::{JobStore, StateError};

const UPDATE_CAPACITY: usize = 256;

/// A record change together with the event that caused it.
#[derive(Debug, Clone)]
pub struct JobUpdate {
    pub event: LifecycleEvent,
    pub record: JobRecord,
}

/// Event sink that keeps queryable job state.
#[derive(Clone)]
pub struct JobRegistry {
    events: mpsc::UnboundedSender<LifecycleEvent>,
    updates: broadcast::Sender<JobUpdate>,
    store: Arc<dyn JobStore>,
}

impl JobRegistry {
    /// Creates the registry and spawns its consumer task.
    ///
    /// The task ends once every clone of the registry is dropped.
    pub fn spawn(store: Arc<dyn JobStore>) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        tokio::spawn(consume(rx, Arc::clone(&store), updates.clone()));
        Self { events, updates, store }
    }

    /// The last known state of a job.
    pub async fn status(&self, job_id: JobId) -> Result<Option<JobRecord>, StateError> {
        self.store.load(job_id).await
    }

    /// Receiver of every applied change, across all jobs.
    pub fn subscribe(&self) -> broadcast::Receiver<JobUpdate> {
        self.updates.subscribe()
    }
}

impl EventSink for JobRegistry {
    fn publish(&self, event: LifecycleEvent) {
        if self.events.send(event).is_err() {
            warn!("job registry stopped, dropping event");
        }
    }
}

async fn consume(
    mut events: mpsc::UnboundedReceiver<LifecycleEvent>,
    store: Arc<dyn JobStore>,
    updates: broadcast::Sender<JobUpdate>,
) {
    // Records of jobs that have not reached a terminal state yet. Every job
    // task publishes one terminal event, even when it unwinds.
    let mut live: HashMap<JobId, JobRecord> = HashMap::new();

    while let Some(event) = events.recv().await {
        let job_id = event.job_id();
        let record = match &event {
            LifecycleEvent::Started { model_id, destination_dir, .. } => {
                let record = JobRecord::started(job_id, model_id.clone(), destination_dir.clone());
                live.insert(job_id, record.clone());
                record
            }
            _ => {
                let Some(record) = live.get_mut(&job_id) else {
                    debug!(%job_id, event = event.name(), "event for unknown or finished job ignored");
                    continue;
                };
                if !record.apply(&event) {
                    continue;
                }
                let record = record.clone();
                if event.is_terminal() {
                    live.remove(&job_id);
                }
                record
            }
        };

        if let Err(e) = store.save(&record).await {
            warn!(%job_id, error = %e, "failed to persist job record");
        }
        // No subscribers is fine.
        let _ = updates.send(JobUpdate { event, record });
    }
}
