//! Rate-limited upstream fetch client + checkpoint/record/aggregation stores for deskpulse.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use deskpulse_core::{
    Agent, AggregationGrain, AggregationLog, EntityKind, Group, Organization,
    ParseKindError, Rollup, SyncCheckpoint, Ticket,
};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub mod memory;
pub mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

pub const CRATE_NAME: &str = "deskpulse-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseDisposition {
    Success,
    Throttled,
    Fatal,
}

/// Only 429 is retried; every other failure surfaces to the caller on first sight.
pub fn classify_status(status: StatusCode) -> ResponseDisposition {
    if status.is_success() {
        ResponseDisposition::Success
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ResponseDisposition::Throttled
    } else {
        ResponseDisposition::Fatal
    }
}

/// Reads `Retry-After` as whole (or fractional) seconds, falling back when absent, unparsable,
/// negative, or too large to represent.
pub fn retry_after_delay(headers: &HeaderMap, fallback: Duration) -> Duration {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .unwrap_or(fallback)
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    /// Sleep applied after every successful request.
    pub request_delay: Duration,
    /// Throttling wait used when the server sends no usable `Retry-After`.
    pub default_retry_after: Duration,
    pub max_retries: usize,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            request_delay: Duration::from_secs(6),
            default_retry_after: Duration::from_secs(60),
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiCredentials {
    pub email: String,
    pub api_token: String,
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub credentials: Option<ApiCredentials>,
    pub rate_limit: RateLimitPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("deskpulse/{}", env!("CARGO_PKG_VERSION"))),
            credentials: None,
            rate_limit: RateLimitPolicy::default(),
        }
    }
}

/// Pagination metadata carried by every upstream list payload.
pub trait Paginated {
    fn next_page(&self) -> Option<&str>;
    fn item_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct FetchedPage<T> {
    pub payload: T,
    pub next_page: Option<String>,
    /// Requests issued for this page, throttled attempts included.
    pub attempts: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("still throttled after {attempts} attempts for {url}")]
    RateLimited { attempts: usize, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone)]
pub struct FetchClient {
    client: reqwest::Client,
    credentials: Option<ApiCredentials>,
    policy: RateLimitPolicy,
}

impl FetchClient {
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
            credentials: config.credentials,
            policy: config.rate_limit,
        })
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    /// GET one page, honouring server-directed throttling and the fixed post-request delay.
    pub async fn fetch_page<T>(&self, url: &str) -> Result<FetchedPage<T>, FetchError>
    where
        T: DeserializeOwned + Paginated,
    {
        let span = info_span!("fetch_page", url);
        self.fetch_page_inner(url).instrument(span).await
    }

    async fn fetch_page_inner<T>(&self, url: &str) -> Result<FetchedPage<T>, FetchError>
    where
        T: DeserializeOwned + Paginated,
    {
        let mut throttled = 0usize;

        loop {
            let mut request = self.client.get(url);
            if let Some(creds) = &self.credentials {
                request = request
                    .basic_auth(format!("{}/token", creds.email), Some(&creds.api_token));
            }

            let resp = request.send().await.map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;
            let status = resp.status();

            match classify_status(status) {
                ResponseDisposition::Success => {
                    let body = resp.bytes().await.map_err(|source| FetchError::Request {
                        url: url.to_string(),
                        source,
                    })?;
                    let payload: T =
                        serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                            url: url.to_string(),
                            source,
                        })?;
                    let next_page = payload.next_page().map(ToString::to_string);
                    debug!(
                        items = payload.item_count(),
                        has_next = next_page.is_some(),
                        "page fetched"
                    );

                    if !self.policy.request_delay.is_zero() {
                        tokio::time::sleep(self.policy.request_delay).await;
                    }

                    return Ok(FetchedPage {
                        payload,
                        next_page,
                        attempts: throttled + 1,
                    });
                }
                ResponseDisposition::Throttled => {
                    if throttled >= self.policy.max_retries {
                        return Err(FetchError::RateLimited {
                            attempts: throttled + 1,
                            url: url.to_string(),
                        });
                    }
                    let wait = retry_after_delay(resp.headers(), self.policy.default_retry_after);
                    throttled += 1;
                    warn!(
                        wait_secs = wait.as_secs_f64(),
                        retry = throttled,
                        "upstream throttled request; waiting before retry"
                    );
                    tokio::time::sleep(wait).await;
                }
                ResponseDisposition::Fatal => {
                    let mut body = resp.text().await.unwrap_or_default();
                    if body.len() > ERROR_BODY_LIMIT {
                        let mut cut = ERROR_BODY_LIMIT;
                        while !body.is_char_boundary(cut) {
                            cut -= 1;
                        }
                        body.truncate(cut);
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                        body,
                    });
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid stored value: {0}")]
    InvalidValue(String),
    #[error("write rejected: {0}")]
    Rejected(String),
}

impl From<ParseKindError> for StoreError {
    fn from(err: ParseKindError) -> Self {
        StoreError::InvalidValue(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Per-entity sync position. Rows are only ever upserted, never deleted.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, entity: EntityKind) -> StoreResult<Option<SyncCheckpoint>>;

    async fn list(&self) -> StoreResult<Vec<SyncCheckpoint>>;

    /// Flags a run in progress; cursor and counters are left untouched.
    async fn mark_syncing(&self, entity: EntityKind) -> StoreResult<SyncCheckpoint>;

    /// Persists a completed run. Timestamp cursors are kept at `max(previous, cursor)` and
    /// `records` is added to the cumulative total.
    async fn mark_success(
        &self,
        entity: EntityKind,
        cursor: &str,
        records: u64,
    ) -> StoreResult<SyncCheckpoint>;

    /// Records a failed run without rewinding the cursor.
    async fn mark_error(&self, entity: EntityKind, message: &str) -> StoreResult<SyncCheckpoint>;
}

/// Local mirror of upstream records, keyed by upstream id.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Last write wins per field, except ticket metrics, which survive a snapshot that omits them.
    async fn upsert_ticket(&self, ticket: &Ticket) -> StoreResult<()>;
    async fn upsert_organization(&self, organization: &Organization) -> StoreResult<()>;
    async fn upsert_agent(&self, agent: &Agent) -> StoreResult<()>;
    async fn upsert_group(&self, group: &Group) -> StoreResult<()>;

    /// Tickets created, updated or solved inside `[start, end)`, ordered by id.
    async fn tickets_touching(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<Ticket>>;

    async fn count_records(&self, entity: EntityKind) -> StoreResult<i64>;
}

#[async_trait]
pub trait AggregationStore: Send + Sync {
    /// Upserts the run-log row for the period into `running`.
    async fn begin_aggregation(
        &self,
        grain: AggregationGrain,
        period_start: NaiveDate,
    ) -> StoreResult<AggregationLog>;

    async fn complete_aggregation(
        &self,
        grain: AggregationGrain,
        period_start: NaiveDate,
        records_produced: i64,
    ) -> StoreResult<AggregationLog>;

    async fn fail_aggregation(
        &self,
        grain: AggregationGrain,
        period_start: NaiveDate,
        message: &str,
    ) -> StoreResult<AggregationLog>;

    /// Upserts `rows` for the period, then drops rows of that period the computation
    /// no longer produces. Returns the number of rows written.
    async fn replace_rollups(
        &self,
        grain: AggregationGrain,
        period_start: NaiveDate,
        rows: &[Rollup],
    ) -> StoreResult<u64>;

    async fn rollups(
        &self,
        grain: AggregationGrain,
        period_start: NaiveDate,
    ) -> StoreResult<Vec<Rollup>>;

    async fn recent_aggregations(&self, limit: i64) -> StoreResult<Vec<AggregationLog>>;
}
