//! Byte retrieval by relative path: the only I/O the engine performs.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{VoxError, VoxResult};

/// Fetches asset bytes by relative path (e.g. `vox/roy/station.a.mp3`).
#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn fetch(&self, path: &str) -> VoxResult<Bytes>;
}

/// Reads assets from the local filesystem, relative to `root`.
#[derive(Debug, Clone)]
pub struct FsAssetStore {
    root: PathBuf,
}

impl FsAssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve against the current working directory.
    pub fn cwd() -> Self {
        Self::new(".")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl AssetStore for FsAssetStore {
    async fn fetch(&self, path: &str) -> VoxResult<Bytes> {
        let full = self.root.join(path.trim_start_matches('/'));
        debug!(path = %full.display(), "reading asset");
        match tokio::fs::read(&full).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(VoxError::NotFound(full.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Fetches assets over HTTP(S) from `{base_url}/{path}`.
#[derive(Debug, Clone)]
pub struct HttpAssetStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpAssetStore {
    pub fn new(base_url: impl Into<String>) -> VoxResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl AssetStore for HttpAssetStore {
    async fn fetch(&self, path: &str) -> VoxResult<Bytes> {
        let url = self.url_for(path);
        debug!(%url, "fetching asset");
        let res = self.client.get(&url).send().await?;
        let status = res.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(VoxError::NotFound(url));
        }
        if !status.is_success() {
            return Err(VoxError::Fetch(format!("{} returned {}", url, status)));
        }
        Ok(res.bytes().await?)
    }
}

/// In-memory assets, e.g. clips bundled into the binary.
#[derive(Debug, Default)]
pub struct MemoryAssetStore {
    assets: RwLock<HashMap<String, Bytes>>,
}

impl MemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<String>, bytes: impl Into<Bytes>) {
        self.assets.write().insert(path.into(), bytes.into());
    }

    pub fn len(&self) -> usize {
        self.assets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.read().is_empty()
    }
}

#[async_trait]
impl AssetStore for MemoryAssetStore {
    async fn fetch(&self, path: &str) -> VoxResult<Bytes> {
        self.assets
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| VoxError::NotFound(path.to_string()))
    }
}
