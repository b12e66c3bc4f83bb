//! Byte-blob access to the artifact bucket.
//!
//! The object store is treated as a plain HTTP byte store: GET an object,
//! HEAD the bucket. `MemoryBlobStore` backs tests and local runs.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob transport error: {0}")]
    Transport(String),
    #[error("blob GET {key} returned status {status}")]
    Status { key: String, status: u16 },
}

#[async_trait]
pub trait BlobFetch: Send + Sync {
    /// Fetch an object. `Ok(None)` means not-found; transport failures are
    /// errors so callers can distinguish the two.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError>;

    /// Bucket accessibility probe (HEAD).
    async fn head(&self) -> bool;
}

/// S3-compatible path-style HTTP blob store: `{endpoint}/{bucket}/{key}`.
pub struct HttpBlobStore {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
}

impl HttpBlobStore {
    pub fn new(endpoint: &str, bucket: &str, region: &str) -> anyhow::Result<Self> {
        use anyhow::Context;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    "x-blob-region",
                    region.parse().context("Invalid blob region")?,
                );
                headers
            })
            .build()
            .context("Failed to build blob store client")?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
        })
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }
}

#[async_trait]
impl BlobFetch for HttpBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError> {
        let url = self.url(key);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BlobError::Transport(e.to_string()))?;

        match resp.status().as_u16() {
            200 => {
                let bytes = resp
                    .bytes()
                    .await
                    .map_err(|e| BlobError::Transport(e.to_string()))?;
                Ok(Some(bytes.to_vec()))
            }
            404 => Ok(None),
            status => Err(BlobError::Status {
                key: key.to_string(),
                status,
            }),
        }
    }

    async fn head(&self) -> bool {
        let url = format!("{}/{}", self.endpoint, self.bucket);
        match self.client.head(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!(error = %e, "Bucket HEAD probe failed");
                false
            }
        }
    }
}

/// In-memory blob store for tests: seed objects, flip accessibility, and
/// corrupt payloads to exercise the checksum gate.
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
    accessible: AtomicBool,
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            accessible: AtomicBool::new(true),
        }
    }

    pub fn put(&self, key: &str, bytes: Vec<u8>) {
        self.objects.write().insert(key.to_string(), bytes);
    }

    pub fn put_json(&self, key: &str, value: &serde_json::Value) {
        self.put(key, serde_json::to_vec(value).expect("serializable json"));
    }

    pub fn remove(&self, key: &str) {
        self.objects.write().remove(key);
    }

    pub fn set_accessible(&self, accessible: bool) {
        self.accessible.store(accessible, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobFetch for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError> {
        if !self.accessible.load(Ordering::SeqCst) {
            return Err(BlobError::Transport("store offline".to_string()));
        }
        Ok(self.objects.read().get(key).cloned())
    }

    async fn head(&self) -> bool {
        self.accessible.load(Ordering::SeqCst)
    }
}
