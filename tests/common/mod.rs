// Shared fixtures: an in-process HTTP server that serves deterministic files.
#![allow(dead_code)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use model_installer::prelude::*;

/// Deterministic file content.
pub fn content(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Counts responses whose body is still being sent.
#[derive(Debug, Default)]
pub struct TransferStats {
    active: AtomicUsize,
    max_active: AtomicUsize,
    requests: AtomicUsize,
}

impl TransferStats {
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn begin(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
    }

    fn end(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
struct ServerState {
    files: Arc<HashMap<String, Vec<u8>>>,
    stats: Arc<TransferStats>,
    chunk_len: usize,
    chunk_delay: Duration,
}

pub struct FileServer {
    pub addr: SocketAddr,
    pub stats: Arc<TransferStats>,
}

impl FileServer {
    pub fn url(&self, name: &str) -> String {
        format!("http://{}/files/{}", self.addr, name)
    }
}

/// Serves `files` under `/files/<name>`, `chunk_len` bytes every `chunk_delay`.
/// Unknown names answer 404.
pub async fn serve_files(files: Vec<(&str, Vec<u8>)>, chunk_len: usize, chunk_delay: Duration) -> FileServer {
    let stats = Arc::new(TransferStats::default());
    let state = ServerState {
        files: Arc::new(files.into_iter().map(|(n, d)| (n.to_string(), d)).collect()),
        stats: Arc::clone(&stats),
        chunk_len,
        chunk_delay,
    };
    let app = Router::new()
        .route("/files/*name", get(serve_file))
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    FileServer { addr, stats }
}

async fn serve_file(State(state): State<ServerState>, Path(name): Path<String>) -> Response {
    let Some(data) = state.files.get(&name) else {
        return (StatusCode::NOT_FOUND, "no such file").into_response();
    };

    state.stats.begin();
    let chunks: Vec<Bytes> = data.chunks(state.chunk_len).map(Bytes::copy_from_slice).collect();
    let count = chunks.len();
    let stats = Arc::clone(&state.stats);
    let delay = state.chunk_delay;
    let body = futures_util::stream::iter(chunks.into_iter().enumerate()).then(move |(i, chunk)| {
        let stats = Arc::clone(&stats);
        async move {
            tokio::time::sleep(delay).await;
            // Counted as finished before the client can see the last bytes.
            if i + 1 == count {
                stats.end();
            }
            Ok::<_, Infallible>(chunk)
        }
    });

    (
        StatusCode::OK,
        [(header::CONTENT_LENGTH, data.len().to_string())],
        Body::from_stream(body),
    )
        .into_response()
}

/// Manifest for model `acme/tiny` whose files live on `server`.
pub fn manifest(server: &FileServer, files: &[(&str, Option<u64>)]) -> Manifest {
    Manifest {
        model_id: "acme/tiny".to_string(),
        display_name: "tiny".to_string(),
        files: files
            .iter()
            .map(|(name, size)| RemoteFile {
                url: server.url(name),
                relative_path: PathBuf::from(name),
                size: *size,
                checksum: None,
            })
            .collect(),
    }
}

pub fn installer(config: &InstallerConfig) -> (Installer, mpsc::UnboundedReceiver<LifecycleEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let installer = Installer::from_config(config, Arc::new(tx)).unwrap();
    (installer, rx)
}

pub fn config(max_concurrency: usize) -> InstallerConfig {
    InstallerConfig {
        max_concurrency,
        ..InstallerConfig::default()
    }
}

/// Everything published so far.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// (bytes_downloaded, percentage) of every progress event, in order.
pub fn progress_of(events: &[LifecycleEvent]) -> Vec<(u64, f64)> {
    events
        .iter()
        .filter_map(|e| match e {
            LifecycleEvent::Progress { bytes_downloaded, percentage, .. } => Some((*bytes_downloaded, *percentage)),
            _ => None,
        })
        .collect()
}

/// Resolver answering from a fixed table.
pub struct StaticResolver {
    manifests: HashMap<String, Manifest>,
}

impl StaticResolver {
    pub fn new(manifests: Vec<Manifest>) -> Self {
        Self {
            manifests: manifests.into_iter().map(|m| (m.model_id.clone(), m)).collect(),
        }
    }
}

#[async_trait]
impl ManifestResolver for StaticResolver {
    async fn resolve(&self, model_id: &str, _variant: Option<&str>) -> Result<Manifest, ManifestFetchError> {
        self.manifests
            .get(model_id)
            .cloned()
            .ok_or_else(|| ManifestFetchError::NotFound(model_id.to_string()))
    }
}
