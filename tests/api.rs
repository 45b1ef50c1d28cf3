mod common;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use tokio::net::TcpListener;

use common::*;
use model_installer::api::{self, AppState, InstallResponse, TaskStatus, API_PREFIX};
use model_installer::prelude::*;

struct TestApp {
    addr: SocketAddr,
    client: reqwest::Client,
}

impl TestApp {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}{}", self.addr, API_PREFIX, path)
    }

    async fn install(&self, model_id: &str, download_dir: &Path) -> reqwest::Response {
        let download_dir = download_dir.display().to_string();
        self.client
            .get(self.url("/huggingface"))
            .query(&[("model_id", model_id), ("download_dir", download_dir.as_str())])
            .send()
            .await
            .unwrap()
    }

    async fn status(&self, job_id: JobId) -> reqwest::Response {
        self.client
            .get(self.url(&format!("/task-status/{job_id}")))
            .send()
            .await
            .unwrap()
    }

    /// Polls task-status until the job is terminal.
    async fn wait_terminal(&self, job_id: JobId) -> TaskStatus {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let response = self.status(job_id).await;
                if response.status() == StatusCode::OK {
                    let status: TaskStatus = response.json().await.unwrap();
                    if status.status.is_terminal() {
                        return status;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap()
    }
}

async fn spawn_app(resolver: StaticResolver) -> TestApp {
    let registry = JobRegistry::spawn(Arc::new(MemoryJobStore::new()));
    let installer = Installer::from_config(&config(2), Arc::new(registry.clone())).unwrap();
    let default_dir = std::env::temp_dir().join("model-installer-tests");
    let state = AppState::new(Arc::new(installer), Arc::new(resolver), registry, default_dir);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, api::router(state)).await.unwrap();
    });
    TestApp { addr, client: reqwest::Client::new() }
}

#[tokio::test]
async fn install_runs_to_completion() {
    let files = vec![("a.bin", content(100, 1)), ("b.bin", content(50, 2))];
    let server = serve_files(files, 16, Duration::from_millis(1)).await;
    let manifest = manifest(&server, &[("a.bin", Some(100)), ("b.bin", Some(50))]);
    let app = spawn_app(StaticResolver::new(vec![manifest])).await;
    let dest = tempfile::tempdir().unwrap();

    let response = app.install("acme/tiny", dest.path()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let InstallResponse { job_id } = response.json().await.unwrap();

    let status = app.wait_terminal(job_id).await;
    assert_eq!(status.status, JobStatus::Completed);
    assert_eq!(status.percentage, 100.0);
    assert!(status.errors.is_empty());
    assert_eq!(std::fs::metadata(dest.path().join("tiny/a.bin")).unwrap().len(), 100);

    // A finished job replays its record as a snapshot and closes the stream.
    let body = app
        .client
        .get(app.url(&format!("/stream/{job_id}")))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("event: snapshot"), "{body}");
    let data = body
        .lines()
        .find_map(|line| line.strip_prefix("data:"))
        .unwrap();
    let record: JobRecord = serde_json::from_str(data.trim()).unwrap();
    assert_eq!(record.job_id, job_id);
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.bytes_downloaded, 150);
}

#[tokio::test]
async fn failed_files_show_up_in_task_status() {
    let server = serve_files(vec![("a.bin", content(100, 1))], 16, Duration::from_millis(1)).await;
    let manifest = manifest(&server, &[("a.bin", Some(100)), ("gone.bin", Some(100))]);
    let app = spawn_app(StaticResolver::new(vec![manifest])).await;
    let dest = tempfile::tempdir().unwrap();

    let InstallResponse { job_id } = app.install("acme/tiny", dest.path()).await.json().await.unwrap();
    let status = app.wait_terminal(job_id).await;

    assert_eq!(status.status, JobStatus::Failed);
    assert_eq!(status.errors.len(), 1);
    assert_eq!(status.errors[0].kind, FailureKind::Transfer);
    assert!(status.percentage < 100.0);
}

#[tokio::test]
async fn cancel_stops_a_running_job() {
    let size = 64 * 1024;
    let server = serve_files(vec![("big.bin", content(size, 1))], 1024, Duration::from_millis(50)).await;
    let app = spawn_app(StaticResolver::new(vec![manifest(&server, &[("big.bin", Some(size as u64))])])).await;
    let dest = tempfile::tempdir().unwrap();

    let InstallResponse { job_id } = app.install("acme/tiny", dest.path()).await.json().await.unwrap();
    let cancel = app.client.post(app.url(&format!("/cancel/{job_id}"))).send().await.unwrap();
    assert_eq!(cancel.status(), StatusCode::ACCEPTED);

    let status = app.wait_terminal(job_id).await;
    assert_eq!(status.status, JobStatus::Failed);
    assert!(status.errors.iter().all(|e| e.kind == FailureKind::Cancelled));
}

#[tokio::test]
async fn unknown_models_are_not_found() {
    let app = spawn_app(StaticResolver::new(vec![])).await;
    let dest = tempfile::tempdir().unwrap();

    let response = app.install("acme/missing", dest.path()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], 404);
    assert!(body["error"].as_str().unwrap().contains("acme/missing"));
}

#[tokio::test]
async fn unknown_jobs_are_reported() {
    let app = spawn_app(StaticResolver::new(vec![])).await;
    let job_id = uuid::Uuid::new_v4();

    assert_eq!(app.status(job_id).await.status(), StatusCode::NOT_FOUND);

    let cancel = app.client.post(app.url(&format!("/cancel/{job_id}"))).send().await.unwrap();
    assert_eq!(cancel.status(), StatusCode::NOT_FOUND);

    let body = app
        .client
        .get(app.url(&format!("/stream/{job_id}")))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("event: error"), "{body}");
    assert!(body.contains("Job not found"), "{body}");
}
