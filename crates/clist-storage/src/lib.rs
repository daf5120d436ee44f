//! HTTP fetch collaborator, response cache, contest store and audit log for the updater.

mod audit;
mod memory;
mod pg;
mod store;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

pub use audit::{AuditEntry, AuditKind, AuditLog};
pub use memory::MemoryContestStore;
pub use pg::PgContestStore;
pub use store::{ContestStore, ContestUpsert, ContestWrite, PruneQuery, StoreError, WriteAction, WriteOutcome};

pub const CRATE_NAME: &str = "clist-storage";

/// Query parameters that only bust caches and never change the response.
const VOLATILE_QUERY_PARAMS: &[&str] = &["_", "t", "ts", "timestamp", "nocache", "rand", "random"];

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub headers: Vec<(String, String)>,
    /// Issue a HEAD request; the body comes back empty.
    pub no_body: bool,
    pub follow_redirect: bool,
    pub use_cache: bool,
}

impl FetchOptions {
    pub fn cached() -> Self {
        Self {
            follow_redirect: true,
            use_cache: true,
            ..Default::default()
        }
    }

    pub fn fresh() -> Self {
        Self {
            follow_redirect: true,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedResponse {
    pub status: u16,
    pub final_url: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid request header {0}")]
    InvalidHeader(String),
    #[error("fetcher is shutting down")]
    Closed,
}

/// The fetch collaborator handed to every source module.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        post: Option<&str>,
        options: &FetchOptions,
    ) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub cache: Option<ResponseCache>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 16,
            per_host_concurrency: 2,
            backoff: BackoffPolicy::default(),
            cache: None,
        }
    }
}

/// Strip cache-busting query parameters so equivalent urls share a cache entry.
pub fn normalize_cache_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return raw.to_string();
    };
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| {
            let k = k.to_ascii_lowercase();
            !VOLATILE_QUERY_PARAMS.contains(&k.as_str()) && !k.starts_with("utm_")
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.set_fragment(None);
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
    url.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedEntry {
    stored_at: DateTime<Utc>,
    response: FetchedResponse,
}

/// On-disk response cache addressed by the hash of the normalized request.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    root: PathBuf,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(root: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            root: root.into(),
            ttl,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn cache_key(url: &str, post: Option<&str>) -> String {
        let mut material = normalize_cache_url(url);
        if let Some(body) = post {
            material.push('\n');
            material.push_str(body);
        }
        Self::sha256_hex(material.as_bytes())
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let shard = &key[..2.min(key.len())];
        self.root.join(shard).join(format!("{key}.json"))
    }

    pub async fn load(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<FetchedResponse>> {
        let path = self.entry_path(key);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking cache entry {}", path.display()))?
        {
            return Ok(None);
        }
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading cache entry {}", path.display()))?;
        let entry: CachedEntry = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing cache entry {}", path.display()))?;
        let age = (now - entry.stored_at).to_std().unwrap_or_default();
        if age > self.ttl {
            return Ok(None);
        }
        Ok(Some(entry.response))
    }

    /// Store a response using a temp file and atomic rename.
    pub async fn store(
        &self,
        key: &str,
        response: &FetchedResponse,
        now: DateTime<Utc>,
    ) -> anyhow::Result<PathBuf> {
        let path = self.entry_path(key);
        let bytes = serde_json::to_vec(&CachedEntry {
            stored_at: now,
            response: response.clone(),
        })
        .context("serializing cache entry")?;
        write_atomic(&path, &bytes).await?;
        Ok(path)
    }
}

/// Write bytes next to `path` under a temp name, then rename over it.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// reqwest-backed fetcher: shared cookie jar, bounded concurrency, retries and a response cache.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    no_redirect_client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
    cache: Option<ResponseCache>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let jar = Arc::new(Jar::default());
        let build = |policy: Policy| {
            let mut builder = reqwest::Client::builder()
                .gzip(true)
                .brotli(true)
                .cookie_provider(jar.clone())
                .redirect(policy)
                .timeout(config.timeout);
            if let Some(user_agent) = &config.user_agent {
                builder = builder.user_agent(user_agent.clone());
            }
            builder.build()
        };

        let client = build(Policy::limited(10)).context("building reqwest client")?;
        let no_redirect_client =
            build(Policy::none()).context("building non-redirecting reqwest client")?;

        Ok(Self {
            client,
            no_redirect_client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_host_limit: config.per_host_concurrency.max(1),
            per_host: Mutex::new(HashMap::new()),
            backoff: config.backoff,
            cache: config.cache,
        })
    }

    async fn per_host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut map = self.per_host.lock().await;
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    fn build_request(
        &self,
        url: &str,
        post: Option<&str>,
        options: &FetchOptions,
    ) -> Result<reqwest::RequestBuilder, FetchError> {
        let client = if options.follow_redirect {
            &self.client
        } else {
            &self.no_redirect_client
        };

        let mut headers = HeaderMap::new();
        for (name, value) in &options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| FetchError::InvalidHeader(name.clone()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| FetchError::InvalidHeader(name.as_str().to_string()))?;
            headers.insert(name, value);
        }

        let request = match post {
            Some(body) => {
                if !headers.contains_key(CONTENT_TYPE) {
                    headers.insert(
                        CONTENT_TYPE,
                        HeaderValue::from_static("application/x-www-form-urlencoded"),
                    );
                }
                client.post(url).body(body.to_string())
            }
            None if options.no_body => client.head(url),
            None => client.get(url),
        };
        Ok(request.headers(headers))
    }

    async fn fetch_uncached(
        &self,
        url: &str,
        post: Option<&str>,
        options: &FetchOptions,
    ) -> Result<FetchedResponse, FetchError> {
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(ToString::to_string))
            .unwrap_or_default();
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_host = self.per_host_semaphore(&host).await;
        let _host = per_host.acquire().await.map_err(|_| FetchError::Closed)?;

        let mut attempt = 0;
        loop {
            let request = self.build_request(url, post, options)?;
            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let passthrough_redirect =
                        status.is_redirection() && !options.follow_redirect;

                    if status.is_success() || passthrough_redirect {
                        let headers = resp
                            .headers()
                            .iter()
                            .filter_map(|(k, v)| {
                                v.to_str()
                                    .ok()
                                    .map(|v| (k.as_str().to_string(), v.to_string()))
                            })
                            .collect();
                        let body = if options.no_body {
                            String::new()
                        } else {
                            resp.text().await?
                        };
                        return Ok(FetchedResponse {
                            status: status.as_u16(),
                            final_url,
                            headers,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(attempt, error = %err, "retrying request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        post: Option<&str>,
        options: &FetchOptions,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url, post = post.is_some());
        async {
            let cache = self
                .cache
                .as_ref()
                .filter(|_| options.use_cache && !options.no_body);
            let key = ResponseCache::cache_key(url, post);

            if let Some(cache) = cache {
                match cache.load(&key, Utc::now()).await {
                    Ok(Some(hit)) => {
                        debug!("cache hit");
                        return Ok(hit);
                    }
                    Ok(None) => {}
                    Err(err) => warn!(error = %err, "ignoring unreadable cache entry"),
                }
            }

            let response = self.fetch_uncached(url, post, options).await?;

            if let Some(cache) = cache {
                if let Err(err) = cache.store(&key, &response, Utc::now()).await {
                    warn!(error = %err, "failed to store cache entry");
                }
            }
            Ok(response)
        }
        .instrument(span)
        .await
    }
}
