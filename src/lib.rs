pub mod api;
pub mod config;
pub mod downloader;
pub mod events;
pub mod integrity;
pub mod manager;
pub mod models;
pub mod progress;
pub mod registry;
pub mod resolver;
pub mod state_manager;

/// Convenient re-exports of the types most callers need.
pub mod prelude {
    pub use crate::config::InstallerConfig;
    pub use crate::downloader::{FetchError, FileFetcher};
    pub use crate::events::{EventSink, LifecycleEvent, NoopSink};
    pub use crate::manager::{AggregateInstallError, InstallError, Installer, JobHandle};
    pub use crate::models::{
        DownloadJob, FailureKind, FileFailure, JobId, JobRecord, JobStatus, Manifest, RemoteFile,
    };
    pub use crate::registry::{JobRegistry, JobUpdate};
    pub use crate::resolver::{HuggingFaceResolver, ManifestFetchError, ManifestResolver};
    pub use crate::state_manager::{JobStore, MemoryJobStore, SqliteJobStore, StateError};
}
