//! Portal access and Postgres-backed stores for shoal.
//!
//! The ingestion engine only ever talks to the traits in this crate:
//! [`RemoteSource`] for the content-record portal, and the four store traits
//! ([`CursorStore`], [`RecordStore`], [`EventLog`], [`EntityCatalog`]) for
//! persistence. [`HttpRemoteSource`] and [`Database`] are the production
//! implementations.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use shoal_core::{ContentRecord, CursorState, Entity, FailureEvent, Feed};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "shoal-storage";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no document for owner '{owner}' at '{path}'")]
    NotFound { owner: String, path: String },
    #[error("portal returned status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("document at '{path}' is not valid JSON: {source}")]
    MalformedBody {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Result of a conditional document fetch.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The cached fingerprint still matches; no document was transferred.
    Unchanged,
    Document { data: JsonValue, fingerprint: String },
}

/// A remote source of per-owner JSON documents with content fingerprints.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Fetch the document at `path` under `owner`. When `cached_fingerprint`
    /// is supplied and the remote content still matches it, the source reports
    /// [`FetchOutcome::Unchanged`] without transferring the document.
    async fn fetch(
        &self,
        owner: &str,
        path: &str,
        cached_fingerprint: Option<&str>,
    ) -> Result<FetchOutcome, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryClass {
    Transient,
    Permanent,
}

fn classify_status(status: StatusCode) -> RetryClass {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryClass::Transient
    } else {
        RetryClass::Permanent
    }
}

fn classify_request_error(err: &reqwest::Error) -> RetryClass {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryClass::Transient
    } else {
        RetryClass::Permanent
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
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Hex sha256 of a document body, used as the fingerprint when the portal
/// does not supply an `ETag`.
pub fn content_fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl RemoteConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// HTTP portal client serving documents at `GET {base}/{owner}/{path}`.
///
/// Conditional fetch uses `If-None-Match`; a 304 reports the document
/// unchanged. The returned fingerprint is the response `ETag` when present,
/// otherwise a sha256 of the body. Transient failures (5xx, 429, timeouts)
/// retry with capped exponential backoff.
#[derive(Debug)]
pub struct HttpRemoteSource {
    base_url: String,
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpRemoteSource {
    pub fn new(config: RemoteConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client: builder.build()?,
            backoff: config.backoff,
        })
    }

    fn document_url(&self, owner: &str, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, owner, path)
    }
}

#[async_trait]
impl RemoteSource for HttpRemoteSource {
    async fn fetch(
        &self,
        owner: &str,
        path: &str,
        cached_fingerprint: Option<&str>,
    ) -> Result<FetchOutcome, FetchError> {
        let url = self.document_url(owner, path);
        let cached = cached_fingerprint.filter(|tag| !tag.is_empty());
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut request = self.client.get(&url);
            if let Some(tag) = cached {
                request = request.header(header::IF_NONE_MATCH, format!("\"{tag}\""));
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::NOT_MODIFIED {
                        debug!(owner, path, "document unchanged");
                        return Ok(FetchOutcome::Unchanged);
                    }
                    if status == StatusCode::NOT_FOUND {
                        return Err(FetchError::NotFound {
                            owner: owner.to_string(),
                            path: path.to_string(),
                        });
                    }
                    if status.is_success() {
                        let etag = resp
                            .headers()
                            .get(header::ETAG)
                            .and_then(|value| value.to_str().ok())
                            .map(|value| value.trim_matches('"').to_string());
                        let body = resp.bytes().await?;
                        let fingerprint = etag.unwrap_or_else(|| content_fingerprint(&body));
                        let data = serde_json::from_slice(&body).map_err(|source| {
                            FetchError::MalformedBody {
                                path: path.to_string(),
                                source,
                            }
                        })?;
                        return Ok(FetchOutcome::Document { data, fingerprint });
                    }

                    if classify_status(status) == RetryClass::Transient
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url,
                    });
                }
                Err(err) => {
                    if classify_request_error(&err) == RetryClass::Transient
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop records the last transient error"),
        ))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Durable per-entity ingestion cursors.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// The committed cursor for an entity; the pristine default when the
    /// entity has never been scanned.
    async fn cursor(&self, entity: &Entity) -> Result<CursorState, StoreError>;

    /// Replace the entity's cursor in a single write.
    async fn commit(&self, entity: &Entity, state: &CursorState) -> Result<(), StoreError>;
}

/// Append-only store of normalized content records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a batch of freshly normalized records. Not atomic across the
    /// batch; a failure may leave a prefix inserted.
    async fn insert_many(&self, records: &[ContentRecord]) -> Result<(), StoreError>;
}

/// Append-only failure event log.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, event: &FailureEvent) -> Result<(), StoreError>;
}

/// The set of owners and entities tracked for ingestion.
#[async_trait]
pub trait EntityCatalog: Send + Sync {
    async fn entities(&self) -> Result<Vec<Entity>, StoreError>;

    async fn owners(&self) -> Result<Vec<String>, StoreError>;

    /// Track a newly discovered owner across every feed. Returns true when
    /// the owner was not already registered.
    async fn register_owner(&self, owner: &str) -> Result<bool, StoreError>;
}

/// Postgres persistence implementing every store trait.
#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new().max_connections(8).connect(url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl CursorStore for Database {
    async fn cursor(&self, entity: &Entity) -> Result<CursorState, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT last_page, last_offset, empty_runs, index_fingerprint, page_fingerprint
              FROM feed_cursors
             WHERE owner_identity = $1 AND feed = $2
            "#,
        )
        .bind(&entity.owner)
        .bind(entity.feed.dir_name())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(CursorState::default());
        };
        let last_page: i64 = row.try_get("last_page")?;
        let last_offset: i64 = row.try_get("last_offset")?;
        let empty_runs: i32 = row.try_get("empty_runs")?;
        Ok(CursorState {
            last_page: last_page as u64,
            last_offset: last_offset as u64,
            empty_runs: empty_runs as u32,
            index_fingerprint: row.try_get("index_fingerprint")?,
            page_fingerprint: row.try_get("page_fingerprint")?,
        })
    }

    async fn commit(&self, entity: &Entity, state: &CursorState) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO feed_cursors
                (owner_identity, feed, last_page, last_offset, empty_runs,
                 index_fingerprint, page_fingerprint)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (owner_identity, feed) DO UPDATE
               SET last_page = EXCLUDED.last_page,
                   last_offset = EXCLUDED.last_offset,
                   empty_runs = EXCLUDED.empty_runs,
                   index_fingerprint = EXCLUDED.index_fingerprint,
                   page_fingerprint = EXCLUDED.page_fingerprint
            "#,
        )
        .bind(&entity.owner)
        .bind(entity.feed.dir_name())
        .bind(state.last_page as i64)
        .bind(state.last_offset as i64)
        .bind(state.empty_runs as i32)
        .bind(&state.index_fingerprint)
        .bind(&state.page_fingerprint)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for Database {
    async fn insert_many(&self, records: &[ContentRecord]) -> Result<(), StoreError> {
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO content_records
                    (id, entry_kind, owner_identity, feed, content_ref,
                     metadata, created_at, ingested_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(record.id)
            .bind(record.entry_kind.as_str())
            .bind(&record.owner)
            .bind(record.feed.dir_name())
            .bind(&record.content_ref)
            .bind(&record.metadata)
            .bind(record.created_at)
            .bind(record.ingested_at)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl EventLog for Database {
    async fn append(&self, event: &FailureEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO failure_events (id, kind, owner_identity, feed, error, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.id)
        .bind(event.kind.as_str())
        .bind(&event.owner)
        .bind(event.feed.map(|feed| feed.dir_name()))
        .bind(&event.error)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl EntityCatalog for Database {
    async fn entities(&self) -> Result<Vec<Entity>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT owner_identity, feed
              FROM feed_cursors
             ORDER BY owner_identity, feed
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut entities = Vec::with_capacity(rows.len());
        for row in rows {
            let owner: String = row.try_get("owner_identity")?;
            let label: String = row.try_get("feed")?;
            let Some(feed) = Feed::from_dir_name(&label) else {
                warn!(owner, label, "unknown feed label in catalog, skipping");
                continue;
            };
            entities.push(Entity { owner, feed });
        }
        Ok(entities)
    }

    async fn owners(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT owner_identity FROM feed_cursors ORDER BY owner_identity",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| row.try_get("owner_identity").map_err(StoreError::from))
            .collect()
    }

    async fn register_owner(&self, owner: &str) -> Result<bool, StoreError> {
        let mut inserted = 0;
        for feed in Feed::ALL {
            let result = sqlx::query(
                r#"
                INSERT INTO feed_cursors (owner_identity, feed)
                VALUES ($1, $2)
                ON CONFLICT (owner_identity, feed) DO NOTHING
                "#,
            )
            .bind(owner)
            .bind(feed.dir_name())
            .execute(&self.pool)
            .await?;
            inserted += result.rows_affected();
        }
        Ok(inserted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_sha256() {
        assert_eq!(
            content_fingerprint(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn only_server_errors_and_rate_limits_retry() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryClass::Transient
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryClass::Transient
        );
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryClass::Permanent);
        assert_eq!(classify_status(StatusCode::GONE), RetryClass::Permanent);
    }

    #[test]
    fn document_urls_join_cleanly() {
        let source = HttpRemoteSource::new(RemoteConfig::new("http://localhost:9980/"))
            .expect("client builds");
        assert_eq!(
            source.document_url("ed25519:abc", "contentrecord.hns/posts/index.json"),
            "http://localhost:9980/ed25519:abc/contentrecord.hns/posts/index.json"
        );
    }
}
