//! Downloaded artifact storage + HTTP fetch utilities.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Certificate, StatusCode};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "nicind-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
}

/// Working directory for downloaded source files. Each source writes under its own
/// subdirectory with a fixed file name, replaced on every run.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn artifact_relative_path(&self, source: &str, file_name: &str) -> PathBuf {
        PathBuf::from(source.trim().to_ascii_lowercase()).join(file_name)
    }

    /// Write bytes through a temp file and an atomic rename over any previous download.
    pub async fn store_bytes(
        &self,
        source: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.artifact_relative_path(source, file_name);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp artifact {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        debug!(path = %absolute_path.display(), sha256 = %content_hash, bytes = bytes.len(), "stored artifact");
        Ok(StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMethod {
    Get,
    PostForm,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub method: FetchMethod,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub form: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    /// Wait the configured download delay before sending.
    pub throttled: bool,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: FetchMethod::Get,
            url: url.into(),
            query: Vec::new(),
            form: Vec::new(),
            headers: Vec::new(),
            throttled: false,
        }
    }

    pub fn post_form<K, V>(url: impl Into<String>, form: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            method: FetchMethod::PostForm,
            form: form.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            ..Self::get(url)
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn throttled(mut self) -> Self {
        self.throttled = true;
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn form_value(&self, key: &str) -> Option<&str> {
        self.form
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Sends one request and returns the body of a successful response.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub download_delay: Duration,
    /// PEM bundle trusted in addition to the platform roots.
    pub extra_root_certificate: Option<PathBuf>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            download_delay: Duration::from_secs(3),
            extra_root_certificate: None,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    download_delay: Duration,
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

        if let Some(path) = &config.extra_root_certificate {
            let pem = std::fs::read(path)
                .with_context(|| format!("reading root certificate {}", path.display()))?;
            let cert = Certificate::from_pem(&pem)
                .with_context(|| format!("parsing root certificate {}", path.display()))?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            download_delay: config.download_delay,
        })
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedResponse, FetchError> {
        if request.throttled && !self.download_delay.is_zero() {
            tokio::time::sleep(self.download_delay).await;
        }

        let span = info_span!("http_fetch", url = %request.url, method = ?request.method);
        async {
            let mut builder = match request.method {
                FetchMethod::Get => self.client.get(&request.url),
                FetchMethod::PostForm => self.client.post(&request.url).form(&request.form),
            };
            if !request.query.is_empty() {
                builder = builder.query(&request.query);
            }
            for (key, value) in &request.headers {
                builder = builder.header(key.as_str(), value.as_str());
            }

            let resp = builder.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

type Responder = Box<dyn Fn(&FetchRequest) -> Option<Vec<u8>> + Send + Sync>;

/// Offline `Fetch` that answers from a closure; `None` becomes a 404. Every request is recorded.
pub struct FixtureFetch {
    responder: Responder,
    requests: Mutex<Vec<FetchRequest>>,
}

impl FixtureFetch {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&FetchRequest) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Fetch for FixtureFetch {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedResponse, FetchError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        match (self.responder)(request) {
            Some(body) => Ok(FetchedResponse {
                status: StatusCode::OK,
                final_url: request.url.clone(),
                body,
            }),
            None => Err(FetchError::HttpStatus {
                status: StatusCode::NOT_FOUND.as_u16(),
                url: request.url.clone(),
            }),
        }
    }
}
