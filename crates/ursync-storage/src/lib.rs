//! Canonical user + audit persistence and HTTP fetch utilities for ursync.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};
use ursync_core::{AuditEvent, CanonicalUser, IdentityKey, NormalizedRecord};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ursync-storage";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached (connect, pool, TLS or IO failure).
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("uniqueness constraint violated: {0}")]
    UniqueViolation(String),
    #[error("store query failed: {0}")]
    Query(String),
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation(_))
    }
}

pub fn classify_sqlx_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => StoreError::UniqueViolation(
            db_err
                .constraint()
                .map(ToString::to_string)
                .unwrap_or_else(|| db_err.message().to_string()),
        ),
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
        _ => StoreError::Query(err.to_string()),
    }
}

/// Store handle for canonical user rows.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Exact-match existence check for an identity key.
    ///
    /// A tuple key only matches rows without an external identifier.
    async fn exists(&self, key: &IdentityKey) -> Result<bool, StoreError>;

    /// Insert a normalized record. Must fail with [`StoreError::UniqueViolation`]
    /// when a row with the same identity key already exists.
    async fn insert(&self, record: &NormalizedRecord) -> Result<CanonicalUser, StoreError>;
}

/// Store handle for the append-only audit journal.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, description: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Postgres-backed implementation of both store traits over one shared pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, config: PoolConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("applying migrations")
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn exists(&self, key: &IdentityKey) -> Result<bool, StoreError> {
        let found = match key {
            IdentityKey::External(id) => {
                sqlx::query_scalar::<_, bool>(
                    "SELECT EXISTS (SELECT 1 FROM usuarios WHERE id_usuario = $1)",
                )
                .bind(id.as_str())
                .fetch_one(&self.pool)
                .await
            }
            IdentityKey::Tuple(t) => {
                sqlx::query_scalar::<_, bool>(
                    r#"
                    SELECT EXISTS (
                        SELECT 1
                          FROM usuarios
                         WHERE id_usuario IS NULL
                           AND nombre = $1
                           AND apellido_paterno = $2
                           AND apellido_materno = $3
                           AND fono = $4
                    )
                    "#,
                )
                .bind(&t.given_name)
                .bind(&t.paternal_surname)
                .bind(&t.maternal_surname)
                .bind(&t.phone)
                .fetch_one(&self.pool)
                .await
            }
        };
        found.map_err(classify_sqlx_error)
    }

    async fn insert(&self, record: &NormalizedRecord) -> Result<CanonicalUser, StoreError> {
        let (id, created_at) = sqlx::query_as::<_, (i64, DateTime<Utc>)>(
            r#"
            INSERT INTO usuarios (id_usuario, nombre, apellido_paterno, apellido_materno, fono)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, created_at
            "#,
        )
        .bind(record.external_id.as_ref().map(|id| id.as_str()))
        .bind(&record.given_name)
        .bind(&record.paternal_surname)
        .bind(&record.maternal_surname)
        .bind(&record.phone)
        .fetch_one(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        Ok(CanonicalUser {
            id,
            external_id: record.external_id.clone(),
            given_name: record.given_name.clone(),
            paternal_surname: record.paternal_surname.clone(),
            maternal_surname: record.maternal_surname.clone(),
            phone: record.phone.clone(),
            created_at,
        })
    }
}

#[async_trait]
impl AuditStore for PgStore {
    async fn append(&self, description: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO log (descripcion) VALUES ($1)")
            .bind(description)
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(())
    }
}

/// In-process user store; uniqueness is checked under the same lock as the insert.
#[derive(Debug, Default)]
pub struct MemoryUserStore {
    rows: Mutex<Vec<CanonicalUser>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn users(&self) -> Vec<CanonicalUser> {
        self.rows.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn exists(&self, key: &IdentityKey) -> Result<bool, StoreError> {
        let rows = self.rows.lock().await;
        Ok(rows.iter().any(|row| &row.identity_key() == key))
    }

    async fn insert(&self, record: &NormalizedRecord) -> Result<CanonicalUser, StoreError> {
        let mut rows = self.rows.lock().await;
        let key = record.identity_key();
        if rows.iter().any(|row| row.identity_key() == key) {
            return Err(StoreError::UniqueViolation(key.to_string()));
        }

        let user = CanonicalUser {
            id: rows.len() as i64 + 1,
            external_id: record.external_id.clone(),
            given_name: record.given_name.clone(),
            paternal_surname: record.paternal_surname.clone(),
            maternal_surname: record.maternal_surname.clone(),
            phone: record.phone.clone(),
            created_at: Utc::now(),
        };
        rows.push(user.clone());
        Ok(user)
    }
}

#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }

    pub async fn descriptions(&self) -> Vec<String> {
        self.events
            .lock()
            .await
            .iter()
            .map(|e| e.description.clone())
            .collect()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditLog {
    async fn append(&self, description: &str) -> Result<(), StoreError> {
        self.events.lock().await.push(AuditEvent {
            description: description.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }
}

/// Best-effort audit writer. Persistence failures go to `tracing` and are dropped.
#[derive(Clone)]
pub struct AuditSink {
    store: Arc<dyn AuditStore>,
}

impl AuditSink {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, description: impl Into<String>) {
        let description = description.into();
        match self.store.append(&description).await {
            Ok(()) => debug!(%description, "audit event recorded"),
            Err(err) => warn!(%description, error = %err, "audit event dropped"),
        }
    }
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
            max_retries: 3,
            base_delay: Duration::from_millis(250),
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
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
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
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
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
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET `url`, retrying retryable failures per the backoff policy.
    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let retry_allowed = attempt < self.backoff.max_retries;
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::NonRetryable || !retry_allowed {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    warn!(attempt, status = status.as_u16(), "retryable upstream status");
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                        || !retry_allowed
                    {
                        return Err(FetchError::Request(err));
                    }
                    warn!(attempt, error = %err, "retryable upstream request error");
                }
            }

            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}
