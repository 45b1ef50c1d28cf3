//! Manifest resolution.
//!
//! Turns a model identifier into the list of files that make up the model.
//! The orchestrator only depends on the [`ManifestResolver`] trait.

use std::path::PathBuf;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::config::InstallerConfig;
use crate::models::{Manifest, RemoteFile};

#[derive(Debug, Error)]
pub enum ManifestFetchError {
    #[error("invalid model id {0:?}, expected \"owner/name\"")]
    InvalidModelId(String),
    #[error("model {0} not found")]
    NotFound(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unusable metadata for {model_id}: {reason}")]
    Malformed { model_id: String, reason: String },
}

/// Resolves a model identifier (and optional revision) into a manifest.
#[async_trait]
pub trait ManifestResolver: Send + Sync {
    async fn resolve(&self, model_id: &str, variant: Option<&str>) -> Result<Manifest, ManifestFetchError>;
}

#[derive(Debug, Deserialize)]
struct ModelInfo {
    id: String,
    #[serde(default)]
    siblings: Vec<Sibling>,
}

#[derive(Debug, Deserialize)]
struct Sibling {
    rfilename: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    lfs: Option<LfsInfo>,
}

#[derive(Debug, Deserialize)]
struct LfsInfo {
    #[serde(default)]
    sha256: Option<String>,
}

/// Resolver backed by the HuggingFace Hub model API.
#[derive(Debug, Clone)]
pub struct HuggingFaceResolver {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

impl HuggingFaceResolver {
    pub fn from_config(config: &InstallerConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self::with_client(client, &config.hf_endpoint, config.hf_token.clone()))
    }

    pub fn with_client(client: Client, endpoint: &str, token: Option<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn download_url(&self, model_id: &str, revision: &str, rfilename: &str) -> String {
        format!("{}/{model_id}/resolve/{revision}/{rfilename}", self.endpoint)
    }
}

/// Splits `owner/name`, returning the name.
fn model_name(model_id: &str) -> Result<&str, ManifestFetchError> {
    match model_id.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => Ok(name),
        _ => Err(ManifestFetchError::InvalidModelId(model_id.to_string())),
    }
}

#[async_trait]
impl ManifestResolver for HuggingFaceResolver {
    async fn resolve(&self, model_id: &str, variant: Option<&str>) -> Result<Manifest, ManifestFetchError> {
        let name = model_name(model_id)?;
        let revision = variant.unwrap_or("main");
        let url = format!("{}/api/models/{model_id}/revision/{revision}", self.endpoint);

        let mut request = self.client.get(&url).query(&[("blobs", "true")]);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        // The hub answers 401 instead of 404 for repositories it will not disclose.
        if matches!(response.status(), StatusCode::NOT_FOUND | StatusCode::UNAUTHORIZED) {
            return Err(ManifestFetchError::NotFound(model_id.to_string()));
        }
        let info: ModelInfo = response.error_for_status()?.json().await?;

        if info.siblings.is_empty() {
            return Err(ManifestFetchError::Malformed {
                model_id: model_id.to_string(),
                reason: "no files listed".to_string(),
            });
        }

        let files: Vec<RemoteFile> = info
            .siblings
            .into_iter()
            .map(|s| RemoteFile {
                url: self.download_url(model_id, revision, &s.rfilename),
                relative_path: PathBuf::from(&s.rfilename),
                size: s.size,
                checksum: s.lfs.and_then(|lfs| lfs.sha256),
            })
            .collect();

        debug!(model_id, revision, files = files.len(), "manifest resolved");
        Ok(Manifest {
            model_id: info.id,
            display_name: name.to_string(),
            files,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_name_requires_owner_and_name() {
        assert_eq!(model_name("acme/tiny").unwrap(), "tiny");
        for bad in ["tiny", "/tiny", "acme/", "a/b/c"] {
            assert!(matches!(model_name(bad), Err(ManifestFetchError::InvalidModelId(_))), "{bad}");
        }
    }

    #[test]
    fn parses_hub_metadata() {
        let json = r#"{
            "id": "acme/tiny",
            "siblings": [
                {"rfilename": "config.json", "size": 120},
                {"rfilename": "unet/model.safetensors", "size": 4096,
                 "lfs": {"sha256": "abc", "size": 4096}}
            ]
        }"#;
        let info: ModelInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.siblings.len(), 2);
        assert!(info.siblings[0].lfs.is_none());
        assert_eq!(info.siblings[1].lfs.as_ref().unwrap().sha256.as_deref(), Some("abc"));
    }

    #[test]
    fn download_urls_point_at_resolve_endpoint() {
        let resolver = HuggingFaceResolver::with_client(Client::new(), "https://hub.example/", None);
        assert_eq!(
            resolver.download_url("acme/tiny", "fp16", "unet/model.bin"),
            "https://hub.example/acme/tiny/resolve/fp16/unet/model.bin"
        );
    }
}
