//! Upstream registry source contracts and the HTTP registry API source.

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;
use ursync_core::{candidates_from_values, CandidateRecord, CandidateSlot};
use ursync_storage::{FetchError, HttpFetcher};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ursync-upstream";

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream registry unavailable: {0}")]
    Unavailable(String),
    #[error("upstream registry response malformed: {0}")]
    Malformed(String),
}

impl From<FetchError> for UpstreamError {
    fn from(err: FetchError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchContext {
    pub run_id: Uuid,
}

impl FetchContext {
    pub fn new(run_id: Uuid) -> Self {
        Self { run_id }
    }
}

/// A source of the complete candidate set. Either every row or an error.
///
/// Rows that were readable JSON but not a valid user record come back as
/// rejected slots, in their original position.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_all(&self, ctx: &FetchContext) -> Result<Vec<CandidateSlot>, UpstreamError>;
}

/// Reads the registry's JSON array endpoint over HTTP.
#[derive(Debug, Clone)]
pub struct RegistryApiSource {
    http: HttpFetcher,
    url: String,
}

impl RegistryApiSource {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl UpstreamSource for RegistryApiSource {
    fn source_id(&self) -> &str {
        "registry-api"
    }

    async fn fetch_all(&self, ctx: &FetchContext) -> Result<Vec<CandidateSlot>, UpstreamError> {
        let resp = self.http.fetch_bytes(ctx.run_id, &self.url).await?;
        let rows = parse_registry_body(&resp.body)?;
        let rejected = rows.iter().filter(|row| row.is_err()).count();
        info!(run_id = %ctx.run_id, url = %resp.final_url, rows = rows.len(), rejected, "fetched upstream registry");
        Ok(rows)
    }
}

/// Parse the registry payload: a JSON array of user objects.
///
/// Only a body that is not a JSON array is `Malformed`; a bad row is rejected
/// on its own. Pulled records never carry an external identifier, even if the
/// payload has one.
pub fn parse_registry_body(body: &[u8]) -> Result<Vec<CandidateSlot>, UpstreamError> {
    let rows: Vec<serde_json::Value> =
        serde_json::from_slice(body).map_err(|err| UpstreamError::Malformed(err.to_string()))?;
    Ok(candidates_from_values(rows)
        .into_iter()
        .map(|slot| {
            slot.map(|record| CandidateRecord {
                external_id: None,
                ..record
            })
        })
        .collect())
}

/// Fixed in-memory candidate set, for local runs and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    records: Vec<CandidateRecord>,
}

impl StaticSource {
    pub fn new(records: Vec<CandidateRecord>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl UpstreamSource for StaticSource {
    fn source_id(&self) -> &str {
        "static"
    }

    async fn fetch_all(&self, _ctx: &FetchContext) -> Result<Vec<CandidateSlot>, UpstreamError> {
        Ok(self.records.iter().cloned().map(Ok).collect())
    }
}
