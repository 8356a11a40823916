//! JSON snapshot storage + HTTP fetch utilities for lbsync.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use lbsync_core::LeaderboardConfig;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lbsync-storage";

/// Fixed courtesy delay enforced after every remote request.
pub const REQUEST_COOLDOWN: Duration = Duration::from_secs(1);

pub async fn cooldown() {
    tokio::time::sleep(REQUEST_COOLDOWN).await;
}

pub async fn load_leaderboard_config(path: impl AsRef<Path>) -> anyhow::Result<LeaderboardConfig> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    /// The file already held identical bytes and was left untouched.
    pub unchanged: bool,
}

/// Reads and writes whole JSON snapshot files under a root directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub async fn read_text(&self, name: &str) -> anyhow::Result<String> {
        let path = self.path_for(name);
        fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))
    }

    /// Strict read: a missing or corrupt snapshot is an error.
    pub async fn read<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<T> {
        let text = self.read_text(name).await?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", self.path_for(name).display()))
    }

    /// Lenient read for prior sync state: a missing or corrupt snapshot yields `T::default()`.
    pub async fn read_or_default<T: DeserializeOwned + Default>(&self, name: &str) -> T {
        let path = self.path_for(name);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no prior snapshot; starting empty");
                return T::default();
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "error reading snapshot; starting empty");
                return T::default();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "malformed snapshot; starting empty");
                T::default()
            }
        }
    }

    /// Serialize `value` and replace the snapshot atomically via temp-file rename.
    pub async fn write<T: Serialize + ?Sized>(
        &self,
        name: &str,
        value: &T,
    ) -> anyhow::Result<StoredSnapshot> {
        let bytes = serde_json::to_vec(value).with_context(|| format!("serializing {name}"))?;
        let content_hash = Self::sha256_hex(&bytes);
        let path = self.path_for(name);

        if let Ok(existing) = fs::read(&path).await {
            if Self::sha256_hex(&existing) == content_hash {
                return Ok(StoredSnapshot {
                    content_hash,
                    unchanged: true,
                });
            }
        }

        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp snapshot {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        Ok(StoredSnapshot {
            content_hash,
            unchanged: false,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    NotFound,
    Failure,
}

pub fn classify_status(status: StatusCode) -> ResponseClass {
    if status == StatusCode::NOT_FOUND {
        ResponseClass::NotFound
    } else if status.is_success() {
        ResponseClass::Success
    } else {
        ResponseClass::Failure
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("page from {url} has no data array")]
    MissingData { url: String },
}

/// Anything that can answer a GET with a JSON document.
///
/// A 404 answers with an empty object; every other failure is a [`FetchError`].
#[async_trait]
pub trait JsonSource: Send + Sync {
    async fn get_json(&self, url: &str) -> Result<JsonValue, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    async fn fetch(&self, url: &str) -> Result<JsonValue, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;
        let status = resp.status();

        match classify_status(status) {
            ResponseClass::NotFound => {
                info!(url, "not found; treating as empty");
                Ok(JsonValue::Object(Default::default()))
            }
            ResponseClass::Failure => Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            }),
            ResponseClass::Success => {
                let body = resp.bytes().await.map_err(|source| FetchError::Request {
                    url: url.to_string(),
                    source,
                })?;
                serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                    url: url.to_string(),
                    source,
                })
            }
        }
    }
}

#[async_trait]
impl JsonSource for HttpFetcher {
    async fn get_json(&self, url: &str) -> Result<JsonValue, FetchError> {
        self.fetch(url).instrument(info_span!("http_fetch", url)).await
    }
}
