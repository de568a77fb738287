use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use deskpulse_adapters::{
    tickets_with_metrics, ApiEndpoints, FieldMapping, GroupsPage, IncrementalTicketsPage,
    OrganizationsPage, SnapshotPage, SnapshotRecord, UsersPage,
};
use deskpulse_core::EntityKind;
use deskpulse_storage::{CheckpointStore, FetchClient, RecordStore, StoreResult};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::CacheInvalidator;

#[derive(Debug, Clone, Copy)]
pub struct SyncerSettings {
    pub ticket_page_size: u32,
    /// Pages processed per incremental run before yielding.
    pub ticket_max_pages: u32,
    pub snapshot_page_size: u32,
    /// Safety stop for upstreams that keep returning full pages.
    pub snapshot_max_pages: u32,
    /// Window start used when no ticket cursor has been persisted yet.
    pub lookback: Duration,
    pub fields: FieldMapping,
}

impl Default for SyncerSettings {
    fn default() -> Self {
        Self {
            ticket_page_size: 1000,
            ticket_max_pages: 50,
            snapshot_page_size: 100,
            snapshot_max_pages: 100,
            lookback: Duration::days(90),
            fields: FieldMapping::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub entity: EntityKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages: u32,
    pub fetched: u64,
    pub upserted: u64,
    pub failed: u64,
    /// Cursor persisted by this run.
    pub cursor: String,
    /// Whether upstream reported there was nothing left to read.
    pub reached_end: bool,
}

/// Cursor to persist after an incremental run: `now` once upstream reports end of stream,
/// otherwise the end of the last processed window so the next run resumes exactly there.
pub fn next_ticket_cursor(
    reached_end: bool,
    last_end_time: Option<i64>,
    window_start: i64,
    now: DateTime<Utc>,
) -> i64 {
    if reached_end {
        now.timestamp()
    } else {
        last_end_time.unwrap_or(window_start)
    }
}

#[derive(Debug, Default)]
struct RunCounters {
    pages: u32,
    fetched: u64,
    upserted: u64,
    failed: u64,
}

pub struct EntitySyncer {
    client: FetchClient,
    api: ApiEndpoints,
    checkpoints: Arc<dyn CheckpointStore>,
    records: Arc<dyn RecordStore>,
    cache: CacheInvalidator,
    settings: SyncerSettings,
}

impl EntitySyncer {
    pub fn new(
        client: FetchClient,
        api: ApiEndpoints,
        checkpoints: Arc<dyn CheckpointStore>,
        records: Arc<dyn RecordStore>,
        cache: CacheInvalidator,
        settings: SyncerSettings,
    ) -> Self {
        Self {
            client,
            api,
            checkpoints,
            records,
            cache,
            settings,
        }
    }

    /// One sync run for `entity`. Failures land on the checkpoint and are returned; the
    /// cursor is left where the last successful run put it.
    pub async fn run(&self, entity: EntityKind) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, entity = %entity);
        async move {
            self.checkpoints
                .mark_syncing(entity)
                .await
                .with_context(|| format!("marking {entity} checkpoint as syncing"))?;

            let result = if entity.is_incremental() {
                self.sync_tickets(run_id).await
            } else {
                self.sync_snapshot(run_id, entity).await
            };

            match result {
                Ok(summary) => {
                    info!(
                        pages = summary.pages,
                        upserted = summary.upserted,
                        failed = summary.failed,
                        cursor = %summary.cursor,
                        reached_end = summary.reached_end,
                        "sync run complete"
                    );
                    Ok(summary)
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    error!(error = %message, "sync run failed");
                    if let Err(mark_err) = self.checkpoints.mark_error(entity, &message).await {
                        error!(error = %mark_err, "failed to record sync error on checkpoint");
                    }
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn sync_snapshot(&self, run_id: Uuid, entity: EntityKind) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let mut counters = RunCounters::default();
        let mut records = Vec::new();
        let mut page = 1u32;

        loop {
            if counters.pages >= self.settings.snapshot_max_pages {
                warn!(
                    max_pages = self.settings.snapshot_max_pages,
                    "snapshot page ceiling reached; stopping pagination"
                );
                break;
            }
            let url = self
                .api
                .snapshot_page(entity, page, self.settings.snapshot_page_size)?;
            let (batch, next_page) = match entity {
                EntityKind::Organizations => self.fetch_snapshot::<OrganizationsPage>(&url).await,
                EntityKind::Agents => self.fetch_snapshot::<UsersPage>(&url).await,
                _ => self.fetch_snapshot::<GroupsPage>(&url).await,
            }
            .with_context(|| format!("fetching {entity} page {page}"))?;
            counters.pages += 1;

            if batch.is_empty() {
                break;
            }
            counters.fetched += batch.len() as u64;
            records.extend(batch);
            if next_page.is_none() {
                break;
            }
            page += 1;
        }

        for record in &records {
            match self.upsert_snapshot_record(record).await {
                Ok(()) => counters.upserted += 1,
                Err(err) => {
                    counters.failed += 1;
                    warn!(
                        record_id = record.id(),
                        error = %err,
                        "skipping record that failed to persist"
                    );
                }
            }
        }

        let cursor = Utc::now().timestamp().to_string();
        let checkpoint = self
            .checkpoints
            .mark_success(entity, &cursor, counters.upserted)
            .await
            .with_context(|| format!("marking {entity} checkpoint as successful"))?;

        Ok(summary(run_id, entity, started_at, counters, checkpoint.cursor, true))
    }

    async fn fetch_snapshot<P: SnapshotPage>(
        &self,
        url: &str,
    ) -> Result<(Vec<SnapshotRecord>, Option<String>)> {
        let fetched = self.client.fetch_page::<P>(url).await?;
        Ok((fetched.payload.into_records(), fetched.next_page))
    }

    async fn upsert_snapshot_record(&self, record: &SnapshotRecord) -> StoreResult<()> {
        match record {
            SnapshotRecord::Organization(org) => self.records.upsert_organization(org).await,
            SnapshotRecord::Agent(agent) => self.records.upsert_agent(agent).await,
            SnapshotRecord::Group(group) => self.records.upsert_group(group).await,
        }
    }

    async fn sync_tickets(&self, run_id: Uuid) -> Result<SyncRunSummary> {
        let entity = EntityKind::Tickets;
        let started_at = Utc::now();
        let checkpoint = self
            .checkpoints
            .load(entity)
            .await
            .context("loading ticket checkpoint")?;
        let window_start = checkpoint
            .as_ref()
            .and_then(|cp| cp.cursor_timestamp())
            .unwrap_or_else(|| (started_at - self.settings.lookback).timestamp());

        let mut counters = RunCounters::default();
        let mut start_time = window_start;
        let mut last_end_time = None;
        let mut reached_end = false;

        while counters.pages < self.settings.ticket_max_pages {
            let url = self
                .api
                .incremental_tickets(start_time, self.settings.ticket_page_size);
            let fetched = self
                .client
                .fetch_page::<IncrementalTicketsPage>(&url)
                .await
                .with_context(|| format!("fetching ticket export from start_time {start_time}"))?;
            counters.pages += 1;

            let IncrementalTicketsPage {
                tickets,
                metric_sets,
                next_page,
                end_time,
                end_of_stream,
            } = fetched.payload;
            counters.fetched += tickets.len() as u64;

            // Each page is committed before the next is requested.
            for ticket in tickets_with_metrics(tickets, &metric_sets, &self.settings.fields) {
                match self.records.upsert_ticket(&ticket).await {
                    Ok(()) => counters.upserted += 1,
                    Err(err) => {
                        counters.failed += 1;
                        warn!(
                            record_id = ticket.id,
                            error = %err,
                            "skipping ticket that failed to persist"
                        );
                    }
                }
            }

            if end_time.is_some() {
                last_end_time = end_time;
            }
            if end_of_stream {
                reached_end = true;
                break;
            }
            match end_time {
                Some(end) if end > start_time => start_time = end,
                _ => {
                    warn!(
                        start_time,
                        ?end_time,
                        "ticket export window did not advance; stopping run"
                    );
                    break;
                }
            }
            if next_page.is_none() {
                break;
            }
        }

        if !reached_end && counters.pages >= self.settings.ticket_max_pages {
            info!(
                max_pages = self.settings.ticket_max_pages,
                "ticket page ceiling reached; resuming from last window next run"
            );
        }

        let cursor = next_ticket_cursor(reached_end, last_end_time, window_start, started_at);
        let checkpoint = self
            .checkpoints
            .mark_success(entity, &cursor.to_string(), counters.upserted)
            .await
            .context("marking ticket checkpoint as successful")?;
        self.cache.invalidate_analytics();

        Ok(summary(run_id, entity, started_at, counters, checkpoint.cursor, reached_end))
    }
}

fn summary(
    run_id: Uuid,
    entity: EntityKind,
    started_at: DateTime<Utc>,
    counters: RunCounters,
    cursor: Option<String>,
    reached_end: bool,
) -> SyncRunSummary {
    SyncRunSummary {
        run_id,
        entity,
        started_at,
        finished_at: Utc::now(),
        pages: counters.pages,
        fetched: counters.fetched,
        upserted: counters.upserted,
        failed: counters.failed,
        cursor: cursor.unwrap_or_default(),
        reached_end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deskpulse_core::{CheckpointStatus, SyncCheckpoint};
    use deskpulse_storage::{HttpClientConfig, MemoryStore, RateLimitPolicy};
    use serde_json::{json, Value};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    const TICKETS_PATH: &str = "/api/v2/incremental/tickets.json";

    fn syncer(server: &MockServer, store: &MemoryStore, settings: SyncerSettings) -> EntitySyncer {
        let client = FetchClient::new(HttpClientConfig {
            rate_limit: RateLimitPolicy {
                request_delay: std::time::Duration::ZERO,
                default_retry_after: std::time::Duration::from_secs(1),
                max_retries: 2,
            },
            ..Default::default()
        })
        .expect("client");
        EntitySyncer::new(
            client,
            ApiEndpoints::new(server.uri()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            CacheInvalidator::default(),
            settings,
        )
    }

    fn ticket_json(id: i64) -> Value {
        json!({
            "id": id,
            "status": "open",
            "priority": "high",
            "created_at": "2026-01-05T08:00:00Z",
            "updated_at": "2026-01-05T09:00:00Z"
        })
    }

    async fn seed_cursor(store: &MemoryStore, cursor: &str) {
        let mut cp = SyncCheckpoint::new(EntityKind::Tickets, Utc::now());
        cp.cursor = Some(cursor.to_string());
        cp.status = CheckpointStatus::Success;
        store.put_checkpoint(cp).await;
    }

    /// Each request returns one ticket and a window ending one second after its start.
    struct AdvancingWindow;

    impl Respond for AdvancingWindow {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let start: i64 = request
                .url
                .query_pairs()
                .find(|(k, _)| k == "start_time")
                .and_then(|(_, v)| v.parse().ok())
                .unwrap_or_default();
            ResponseTemplate::new(200).set_body_json(json!({
                "tickets": [ticket_json(start)],
                "metric_sets": [],
                "end_time": start + 1,
                "end_of_stream": false,
                "next_page": "more"
            }))
        }
    }

    #[tokio::test]
    async fn missing_cursor_starts_from_lookback_window() {
        let server = MockServer::start().await;
        let store = MemoryStore::new();
        Mock::given(method("GET"))
            .and(path(TICKETS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tickets": [ticket_json(1)],
                "metric_sets": [],
                "end_time": 1_700_000_000,
                "end_of_stream": true,
                "next_page": null
            })))
            .expect(1)
            .mount(&server)
            .await;

        let before = Utc::now();
        syncer(&server, &store, SyncerSettings::default())
            .run(EntityKind::Tickets)
            .await
            .expect("sync succeeds");

        let requests = server.received_requests().await.unwrap_or_default();
        let start: i64 = requests[0]
            .url
            .query_pairs()
            .find(|(k, _)| k == "start_time")
            .and_then(|(_, v)| v.parse().ok())
            .expect("start_time param");
        let expected = (before - Duration::days(90)).timestamp();
        assert!((start - expected).abs() <= 5, "start {start} vs expected {expected}");
    }

    #[tokio::test]
    async fn end_of_stream_moves_cursor_to_now() {
        let server = MockServer::start().await;
        let store = MemoryStore::new();
        seed_cursor(&store, "1690000000").await;
        Mock::given(method("GET"))
            .and(path(TICKETS_PATH))
            .and(query_param("start_time", "1690000000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tickets": [ticket_json(7), ticket_json(8)],
                "metric_sets": [{
                    "ticket_id": 7,
                    "replies": 2,
                    "reply_time_in_minutes": {"calendar": 30}
                }],
                "end_time": 1_700_000_000,
                "end_of_stream": true,
                "next_page": null
            })))
            .mount(&server)
            .await;

        let before = Utc::now().timestamp();
        let summary = syncer(&server, &store, SyncerSettings::default())
            .run(EntityKind::Tickets)
            .await
            .expect("sync succeeds");

        let cursor: i64 = summary.cursor.parse().expect("numeric cursor");
        assert!(cursor >= before - 1);
        assert_ne!(cursor, 1_700_000_000);
        assert!(summary.reached_end);
        assert_eq!(summary.upserted, 2);

        let cp = store.load(EntityKind::Tickets).await.unwrap().expect("checkpoint");
        assert_eq!(cp.status, CheckpointStatus::Success);
        assert_eq!(cp.records_synced, 2);
        let seven = store.ticket(7).await.expect("ticket 7");
        assert_eq!(seven.replies(), 2);
    }

    #[tokio::test]
    async fn page_ceiling_persists_last_window_end() {
        let server = MockServer::start().await;
        let store = MemoryStore::new();
        seed_cursor(&store, "1649999950").await;
        Mock::given(method("GET"))
            .and(path(TICKETS_PATH))
            .respond_with(AdvancingWindow)
            .expect(50)
            .mount(&server)
            .await;

        let summary = syncer(&server, &store, SyncerSettings::default())
            .run(EntityKind::Tickets)
            .await
            .expect("sync succeeds");

        assert_eq!(summary.pages, 50);
        assert!(!summary.reached_end);
        assert_eq!(summary.cursor, "1650000000");
        assert_eq!(store.all_tickets().await.len(), 50);
        let cp = store.load(EntityKind::Tickets).await.unwrap().expect("checkpoint");
        assert_eq!(cp.cursor.as_deref(), Some("1650000000"));
    }

    #[tokio::test]
    async fn stalled_window_stops_the_run() {
        let server = MockServer::start().await;
        let store = MemoryStore::new();
        seed_cursor(&store, "1650000000").await;
        Mock::given(method("GET"))
            .and(path(TICKETS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tickets": [],
                "metric_sets": [],
                "end_time": 1_650_000_000,
                "end_of_stream": false,
                "next_page": "same"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let summary = syncer(&server, &store, SyncerSettings::default())
            .run(EntityKind::Tickets)
            .await
            .expect("sync succeeds");
        assert_eq!(summary.pages, 1);
        assert_eq!(summary.cursor, "1650000000");
    }

    #[tokio::test]
    async fn replaying_a_window_is_idempotent() {
        let server = MockServer::start().await;
        let store = MemoryStore::new();
        Mock::given(method("GET"))
            .and(path(TICKETS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tickets": [ticket_json(21), ticket_json(22)],
                "metric_sets": [],
                "end_time": 1_700_000_000,
                "end_of_stream": true,
                "next_page": null
            })))
            .mount(&server)
            .await;

        let syncer = syncer(&server, &store, SyncerSettings::default());
        syncer.run(EntityKind::Tickets).await.expect("first run");
        let first = store.all_tickets().await;
        syncer.run(EntityKind::Tickets).await.expect("second run");
        assert_eq!(store.all_tickets().await, first);
    }

    #[tokio::test]
    async fn failing_record_is_skipped_not_fatal() {
        let server = MockServer::start().await;
        let store = MemoryStore::new();
        store.reject_writes_for(EntityKind::Tickets, 32).await;
        Mock::given(method("GET"))
            .and(path(TICKETS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tickets": [ticket_json(31), ticket_json(32), ticket_json(33)],
                "metric_sets": [],
                "end_time": 1_700_000_000,
                "end_of_stream": true,
                "next_page": null
            })))
            .mount(&server)
            .await;

        let summary = syncer(&server, &store, SyncerSettings::default())
            .run(EntityKind::Tickets)
            .await
            .expect("sync succeeds");
        assert_eq!(summary.upserted, 2);
        assert_eq!(summary.failed, 1);
        assert!(store.ticket(32).await.is_none());
        assert!(store.ticket(33).await.is_some());
    }

    #[tokio::test]
    async fn upstream_failure_marks_error_and_keeps_cursor() {
        let server = MockServer::start().await;
        let store = MemoryStore::new();
        seed_cursor(&store, "1700000000").await;
        Mock::given(method("GET"))
            .and(path(TICKETS_PATH))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(1)
            .mount(&server)
            .await;

        let err = syncer(&server, &store, SyncerSettings::default())
            .run(EntityKind::Tickets)
            .await
            .expect_err("sync fails");
        assert!(format!("{err:#}").contains("500"));

        let cp = store.load(EntityKind::Tickets).await.unwrap().expect("checkpoint");
        assert_eq!(cp.status, CheckpointStatus::Error);
        assert_eq!(cp.cursor.as_deref(), Some("1700000000"));
        assert!(cp.last_error.unwrap_or_default().contains("500"));
    }

    #[tokio::test]
    async fn successful_ticket_sync_invalidates_analytics_cache() {
        let server = MockServer::start().await;
        let store = MemoryStore::new();
        Mock::given(method("GET"))
            .and(path(TICKETS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tickets": [],
                "metric_sets": [],
                "end_time": 1_700_000_000,
                "end_of_stream": true,
                "next_page": null
            })))
            .mount(&server)
            .await;

        let syncer = syncer(&server, &store, SyncerSettings::default());
        let mut rx = syncer.cache.subscribe();
        syncer.run(EntityKind::Tickets).await.expect("sync succeeds");
        assert_eq!(rx.try_recv().ok(), Some(crate::CacheSignal::AnalyticsInvalidated));
    }

    #[tokio::test]
    async fn snapshot_walks_pages_until_no_next_page() {
        let server = MockServer::start().await;
        let store = MemoryStore::new();
        let group = |id: i64| {
            json!({
                "id": id,
                "name": format!("Group {id}"),
                "created_at": "2025-01-01T00:00:00Z",
                "updated_at": "2025-06-01T00:00:00Z"
            })
        };
        Mock::given(method("GET"))
            .and(path("/api/v2/groups.json"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "groups": [group(1), group(2)],
                "next_page": "page2"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2/groups.json"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "groups": [group(3)],
                "next_page": null
            })))
            .mount(&server)
            .await;

        let summary = syncer(&server, &store, SyncerSettings::default())
            .run(EntityKind::Groups)
            .await
            .expect("snapshot succeeds");
        assert_eq!(summary.pages, 2);
        assert_eq!(summary.upserted, 3);
        assert_eq!(store.count_records(EntityKind::Groups).await.unwrap(), 3);

        let cp = store.load(EntityKind::Groups).await.unwrap().expect("checkpoint");
        assert_eq!(cp.status, CheckpointStatus::Success);
        assert!(cp.cursor_timestamp().is_some());
    }

    #[tokio::test]
    async fn snapshot_respects_page_ceiling() {
        let server = MockServer::start().await;
        let store = MemoryStore::new();
        Mock::given(method("GET"))
            .and(path("/api/v2/organizations.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "organizations": [{
                    "id": 5,
                    "name": "Acme",
                    "created_at": "2025-01-01T00:00:00Z",
                    "updated_at": "2025-06-01T00:00:00Z"
                }],
                "next_page": "always"
            })))
            .expect(3)
            .mount(&server)
            .await;

        let settings = SyncerSettings {
            snapshot_max_pages: 3,
            ..Default::default()
        };
        let summary = syncer(&server, &store, settings)
            .run(EntityKind::Organizations)
            .await
            .expect("snapshot succeeds");
        assert_eq!(summary.pages, 3);
    }

    fn org_json(id: i64, name: &str) -> Value {
        json!({
            "id": id,
            "name": name,
            "created_at": "2025-01-01T00:00:00Z",
            "updated_at": "2025-06-01T00:00:00Z"
        })
    }

    #[tokio::test]
    async fn snapshot_rerun_leaves_records_unchanged() {
        let server = MockServer::start().await;
        let store = MemoryStore::new();
        Mock::given(method("GET"))
            .and(path("/api/v2/organizations.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "organizations": [org_json(5, "Acme"), org_json(6, "Globex")],
                "next_page": null
            })))
            .expect(2)
            .mount(&server)
            .await;

        let syncer = syncer(&server, &store, SyncerSettings::default());
        let first = syncer.run(EntityKind::Organizations).await.expect("first run");
        let after_first = store.all_organizations().await;
        let second = syncer.run(EntityKind::Organizations).await.expect("second run");
        let after_second = store.all_organizations().await;

        assert_eq!(first.upserted, 2);
        assert_eq!(second.upserted, 2);
        assert_eq!(after_first.len(), 2);
        assert_eq!(after_first, after_second);
        assert_eq!(store.count_records(EntityKind::Organizations).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn snapshot_stops_on_empty_page() {
        let server = MockServer::start().await;
        let store = MemoryStore::new();
        Mock::given(method("GET"))
            .and(path("/api/v2/organizations.json"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "organizations": [org_json(5, "Acme")],
                "next_page": "page-2"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2/organizations.json"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "organizations": [],
                "next_page": "page-3"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2/organizations.json"))
            .and(query_param("page", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "organizations": [org_json(7, "Initech")],
                "next_page": null
            })))
            .expect(0)
            .mount(&server)
            .await;

        let summary = syncer(&server, &store, SyncerSettings::default())
            .run(EntityKind::Organizations)
            .await
            .expect("snapshot succeeds");
        assert_eq!(summary.pages, 2);
        assert_eq!(summary.fetched, 1);
        assert_eq!(summary.upserted, 1);
        assert_eq!(store.count_records(EntityKind::Organizations).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn throttled_request_is_retried_after_server_wait() {
        let server = MockServer::start().await;
        let store = MemoryStore::new();
        Mock::given(method("GET"))
            .and(path("/api/v2/users.json"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2/users.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "users": [{
                    "id": 40,
                    "name": "Dana",
                    "role": "agent",
                    "created_at": "2025-01-01T00:00:00Z",
                    "updated_at": "2025-06-01T00:00:00Z"
                }],
                "next_page": null
            })))
            .with_priority(2)
            .mount(&server)
            .await;

        let started = std::time::Instant::now();
        let summary = syncer(&server, &store, SyncerSettings::default())
            .run(EntityKind::Agents)
            .await
            .expect("sync succeeds after retry");
        assert!(started.elapsed() >= std::time::Duration::from_secs(1));
        assert_eq!(summary.upserted, 1);
        assert_eq!(server.received_requests().await.unwrap_or_default().len(), 2);
    }

    #[test]
    fn cursor_choice_depends_on_end_of_stream() {
        let now = Utc::now();
        assert_eq!(
            next_ticket_cursor(true, Some(1_700_000_000), 1_600_000_000, now),
            now.timestamp()
        );
        assert_eq!(
            next_ticket_cursor(false, Some(1_650_000_000), 1_600_000_000, now),
            1_650_000_000
        );
        assert_eq!(next_ticket_cursor(false, None, 1_600_000_000, now), 1_600_000_000);
    }
}
