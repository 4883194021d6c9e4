//! HTTP fetch, auth, and keyed-store upsert utilities for cardfeed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use cardfeed_core::CallBudget;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cardfeed-storage";

/// Token refreshes happen this far ahead of the reported expiry.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(300);

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

/// Shared retry schedule. The fetcher uses the exponential curve for 429/5xx,
/// the upsert store uses the linear curve for transient write failures.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    /// Base delay doubling per attempt, capped at `max_delay`.
    pub fn exponential_delay(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Base delay growing linearly per attempt, capped at `max_delay`.
    pub fn linear_delay(&self, attempt_index: usize) -> Duration {
        self.base_delay
            .saturating_mul(attempt_index as u32 + 1)
            .min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("search credentials missing: set app id and secret in the environment")]
    MissingCredentials,
    #[error("token exchange rejected with http status {status}")]
    Rejected { status: u16 },
    #[error("token exchange request failed: {0}")]
    Request(#[from] reqwest::Error),
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self, now: Instant) -> bool {
        now + TOKEN_REFRESH_MARGIN < self.expires_at
    }
}

/// OAuth client-credentials token source for the search API.
///
/// Tokens are cached in memory and refreshed proactively before expiry;
/// the exchange sends the app id/secret as HTTP Basic auth.
pub struct SearchAuth {
    client: reqwest::Client,
    token_url: String,
    app_id: String,
    app_secret: String,
    scope: String,
    cached: Mutex<Option<CachedToken>>,
}

impl SearchAuth {
    pub fn new(
        client: reqwest::Client,
        token_url: impl Into<String>,
        app_id: impl Into<String>,
        app_secret: impl Into<String>,
        scope: impl Into<String>,
    ) -> Result<Self, AuthError> {
        let app_id = app_id.into();
        let app_secret = app_secret.into();
        if app_id.trim().is_empty() || app_secret.trim().is_empty() {
            return Err(AuthError::MissingCredentials);
        }
        Ok(Self {
            client,
            token_url: token_url.into(),
            app_id,
            app_secret,
            scope: scope.into(),
            cached: Mutex::new(None),
        })
    }

    /// Returns a bearer token, exchanging credentials only when the cached
    /// token is missing or inside the refresh margin.
    pub async fn bearer_token(&self) -> Result<String, AuthError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.is_fresh(Instant::now()) {
                return Ok(token.value.clone());
            }
        }

        let response = self
            .client
            .post(&self.token_url)
            .basic_auth(&self.app_id, Some(&self.app_secret))
            .form(&[
                ("grant_type", "client_credentials"),
                ("scope", self.scope.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::Rejected {
                status: status.as_u16(),
            });
        }

        let body: TokenResponse = response.json().await?;
        let token = CachedToken {
            value: body.access_token,
            expires_at: Instant::now() + Duration::from_secs(body.expires_in),
        };
        debug!(expires_in = body.expires_in, "exchanged client credentials for bearer token");
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("rate limited after {attempts} attempts: {url}")]
    RateLimited { url: String, attempts: usize },
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

enum AttemptFailure {
    Status(u16),
    Request(reqwest::Error),
}

/// Outbound HTTP GET wrapper for the source APIs.
///
/// Every attempt consumes one unit of the shared call budget, success or not.
/// 429s and transient failures retry on the exponential backoff curve; callers
/// treat a final error as "this unit produced no data" and keep walking.
pub struct RateLimitedFetcher {
    client: reqwest::Client,
    budget: Arc<CallBudget>,
    backoff: BackoffPolicy,
}

impl RateLimitedFetcher {
    pub fn new(config: FetcherConfig, budget: Arc<CallBudget>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            budget,
            backoff: config.backoff,
        })
    }

    pub fn budget(&self) -> &CallBudget {
        &self.budget
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    pub fn http_client(&self) -> reqwest::Client {
        self.client.clone()
    }

    pub async fn get(
        &self,
        url: &str,
        query: &[(&str, String)],
        bearer: Option<&str>,
    ) -> Result<Vec<u8>, FetchError> {
        let mut last_failure: Option<AttemptFailure> = None;

        for attempt in 0..=self.backoff.max_retries {
            let calls_made = self.budget.record_call();
            debug!(url, attempt, calls_made, "source call");

            let mut request = self.client.get(url);
            if !query.is_empty() {
                request = request.query(query);
            }
            if let Some(token) = bearer {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.bytes().await?.to_vec());
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let delay = self.backoff.exponential_delay(attempt);
                        warn!(url, status = status.as_u16(), ?delay, "retryable status, backing off");
                        last_failure = Some(AttemptFailure::Status(status.as_u16()));
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    last_failure = Some(AttemptFailure::Status(status.as_u16()));
                    break;
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let delay = self.backoff.exponential_delay(attempt);
                        warn!(url, error = %err, ?delay, "transient request failure, backing off");
                        last_failure = Some(AttemptFailure::Request(err));
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    last_failure = Some(AttemptFailure::Request(err));
                    break;
                }
            }
        }

        match last_failure {
            Some(AttemptFailure::Status(429)) => Err(FetchError::RateLimited {
                url: url.to_string(),
                attempts: self.backoff.max_retries + 1,
            }),
            Some(AttemptFailure::Status(status)) => Err(FetchError::Status {
                status,
                url: url.to_string(),
            }),
            Some(AttemptFailure::Request(err)) => Err(FetchError::Request(err)),
            // Unreachable with max_retries >= 0, but avoid a panic path.
            None => Err(FetchError::RateLimited {
                url: url.to_string(),
                attempts: 0,
            }),
        }
    }
}

/// Destination for normalized rows. The store owns the rows; the pipeline only
/// proposes upserts against an explicit conflict key.
#[async_trait]
pub trait RowSink: Send + Sync {
    /// Upserts rows in bounded batches, returning how many were written.
    /// Failed batches are logged and dropped, never propagated — a single bad
    /// batch must not abort the run.
    async fn upsert_rows(&self, table: &str, conflict_key: &str, rows: Vec<JsonValue>) -> u64;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store write rejected with http status {status} for table {table}")]
    Status { status: u16, table: String },
    #[error("store request failed: {0}")]
    Request(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct UpsertStoreConfig {
    pub base_url: String,
    pub api_key: String,
    pub batch_size: usize,
    pub retry: BackoffPolicy,
    pub timeout: Duration,
}

impl UpsertStoreConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            batch_size: 200,
            retry: BackoffPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(5),
            },
            timeout: Duration::from_secs(30),
        }
    }
}

/// REST client for the keyed upsert store (PostgREST-style endpoint).
///
/// Writes are full-row merge-on-conflict: re-submitting the same row with the
/// same key reproduces the same stored state.
pub struct UpsertStore {
    client: reqwest::Client,
    config: UpsertStoreConfig,
}

impl UpsertStore {
    pub fn new(config: UpsertStoreConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !config.base_url.trim().is_empty() && !config.api_key.trim().is_empty(),
            "store URL and key must be configured"
        );
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .build()
            .context("building store client")?;
        Ok(Self { client, config })
    }

    async fn write_batch(
        &self,
        table: &str,
        conflict_key: &str,
        batch: &[JsonValue],
    ) -> Result<(), StoreError> {
        let url = format!(
            "{}/rest/v1/{}",
            self.config.base_url.trim_end_matches('/'),
            table
        );
        let response = self
            .client
            .post(&url)
            .query(&[("on_conflict", conflict_key)])
            .header("apikey", &self.config.api_key)
            .bearer_auth(&self.config.api_key)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(batch)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Status {
                status: status.as_u16(),
                table: table.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RowSink for UpsertStore {
    async fn upsert_rows(&self, table: &str, conflict_key: &str, rows: Vec<JsonValue>) -> u64 {
        if rows.is_empty() {
            return 0;
        }
        let mut written = 0u64;
        for (batch_index, batch) in rows.chunks(self.config.batch_size.max(1)).enumerate() {
            let mut batch_ok = false;
            for attempt in 0..=self.config.retry.max_retries {
                match self.write_batch(table, conflict_key, batch).await {
                    Ok(()) => {
                        batch_ok = true;
                        break;
                    }
                    Err(err) if attempt < self.config.retry.max_retries => {
                        let delay = self.config.retry.linear_delay(attempt);
                        warn!(table, batch_index, error = %err, ?delay, "store write failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    Err(err) => {
                        error!(table, batch_index, error = %err, "store write failed, dropping batch");
                    }
                }
            }
            if batch_ok {
                written += batch.len() as u64;
            }
        }
        written
    }
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub path: PathBuf,
    pub deduplicated: bool,
}

/// Immutable, hash-addressed audit copies of raw source payloads.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Stores a payload under `<source>/<date>/<label>-<hash12>.<ext>` using a
    /// temp file plus atomic rename. Identical content at an identical path is
    /// reported as deduplicated rather than rewritten.
    pub async fn store_payload(
        &self,
        fetched_at: DateTime<Utc>,
        source: &str,
        label: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let day = fetched_at.format("%Y%m%d").to_string();
        let label: String = label
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        let file_name = format!("{label}-{}.{extension}", &content_hash[..12]);
        let path = self.root.join(source).join(day).join(file_name);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating artifact directory {}", parent.display()))?;
        }
        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking artifact path {}", path.display()))?
        {
            return Ok(StoredArtifact {
                content_hash,
                path,
                deduplicated: true,
            });
        }

        let temp_path = path
            .parent()
            .map(|p| p.join(format!(".{}.tmp", Uuid::new_v4())))
            .unwrap_or_else(|| PathBuf::from(format!(".{}.tmp", Uuid::new_v4())));
        let mut file = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("creating temp artifact {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &path).await {
            Ok(()) => Ok(StoredArtifact {
                content_hash,
                path,
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredArtifact {
                    content_hash,
                    path,
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err)
                    .with_context(|| format!("renaming artifact into place at {}", path.display()))
            }
        }
    }
}
