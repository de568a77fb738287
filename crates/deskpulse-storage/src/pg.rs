use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use deskpulse_core::{
    Agent, AggregationGrain, AggregationLog, EntityKind, Group, Organization, Rollup, RollupKey,
    RollupMetrics, SyncCheckpoint, Ticket, TicketMetrics,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::info;

use crate::{AggregationStore, CheckpointStore, RecordStore, StoreResult};

const CHECKPOINT_COLUMNS: &str =
    "entity_type, last_cursor, status, last_error, records_synced, updated_at";

const AGGREGATION_LOG_COLUMNS: &str =
    "aggregation_type, period_start, status, started_at, completed_at, \
     records_produced, error_message";

const UPSERT_TICKET: &str = r#"
    INSERT INTO tickets (
        id, subject, status, priority, ticket_type, requester_id, assignee_id,
        organization_id, group_id, tags, created_at, updated_at, time_spent_minutes,
        billable_minutes, has_metrics, reply_time_minutes, first_resolution_time_minutes,
        full_resolution_time_minutes, agent_wait_time_minutes, requester_wait_time_minutes,
        reopens, replies, solved_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18,
            $19, $20, $21, $22, $23)
    ON CONFLICT (id) DO UPDATE SET
        subject = EXCLUDED.subject,
        status = EXCLUDED.status,
        priority = EXCLUDED.priority,
        ticket_type = EXCLUDED.ticket_type,
        requester_id = EXCLUDED.requester_id,
        assignee_id = EXCLUDED.assignee_id,
        organization_id = EXCLUDED.organization_id,
        group_id = EXCLUDED.group_id,
        tags = EXCLUDED.tags,
        created_at = EXCLUDED.created_at,
        updated_at = EXCLUDED.updated_at,
        time_spent_minutes = EXCLUDED.time_spent_minutes,
        billable_minutes = EXCLUDED.billable_minutes,
        has_metrics = tickets.has_metrics OR EXCLUDED.has_metrics,
        reply_time_minutes = CASE WHEN EXCLUDED.has_metrics
            THEN EXCLUDED.reply_time_minutes ELSE tickets.reply_time_minutes END,
        first_resolution_time_minutes = CASE WHEN EXCLUDED.has_metrics
            THEN EXCLUDED.first_resolution_time_minutes
            ELSE tickets.first_resolution_time_minutes END,
        full_resolution_time_minutes = CASE WHEN EXCLUDED.has_metrics
            THEN EXCLUDED.full_resolution_time_minutes
            ELSE tickets.full_resolution_time_minutes END,
        agent_wait_time_minutes = CASE WHEN EXCLUDED.has_metrics
            THEN EXCLUDED.agent_wait_time_minutes ELSE tickets.agent_wait_time_minutes END,
        requester_wait_time_minutes = CASE WHEN EXCLUDED.has_metrics
            THEN EXCLUDED.requester_wait_time_minutes ELSE tickets.requester_wait_time_minutes END,
        reopens = CASE WHEN EXCLUDED.has_metrics THEN EXCLUDED.reopens ELSE tickets.reopens END,
        replies = CASE WHEN EXCLUDED.has_metrics THEN EXCLUDED.replies ELSE tickets.replies END,
        solved_at = CASE WHEN EXCLUDED.has_metrics
            THEN EXCLUDED.solved_at ELSE tickets.solved_at END
"#;

const UPSERT_ROLLUP: &str = r#"
    INSERT INTO ticket_rollups (
        grain, period_start, organization_id, agent_id, group_id, priority,
        tickets_created, tickets_solved, tickets_closed, tickets_reopened,
        total_minutes, billable_minutes, avg_first_reply_minutes, avg_full_resolution_minutes,
        sla_met, sla_breached, one_touch, two_touch, multi_touch, computed_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18,
            $19, $20)
    ON CONFLICT (grain, period_start, organization_id, agent_id, group_id, priority) DO UPDATE SET
        tickets_created = EXCLUDED.tickets_created,
        tickets_solved = EXCLUDED.tickets_solved,
        tickets_closed = EXCLUDED.tickets_closed,
        tickets_reopened = EXCLUDED.tickets_reopened,
        total_minutes = EXCLUDED.total_minutes,
        billable_minutes = EXCLUDED.billable_minutes,
        avg_first_reply_minutes = EXCLUDED.avg_first_reply_minutes,
        avg_full_resolution_minutes = EXCLUDED.avg_full_resolution_minutes,
        sla_met = EXCLUDED.sla_met,
        sla_breached = EXCLUDED.sla_breached,
        one_touch = EXCLUDED.one_touch,
        two_touch = EXCLUDED.two_touch,
        multi_touch = EXCLUDED.multi_touch,
        computed_at = EXCLUDED.computed_at
"#;

/// Postgres-backed implementation of every store trait.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    fn map_checkpoint(row: &PgRow) -> StoreResult<SyncCheckpoint> {
        let entity: String = row.try_get("entity_type")?;
        let status: String = row.try_get("status")?;
        Ok(SyncCheckpoint {
            entity: entity.parse()?,
            cursor: row.try_get("last_cursor")?,
            status: status.parse()?,
            last_error: row.try_get("last_error")?,
            records_synced: row.try_get("records_synced")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn map_ticket(row: &PgRow) -> StoreResult<Ticket> {
        let has_metrics: bool = row.try_get("has_metrics")?;
        let metrics = if has_metrics {
            Some(TicketMetrics {
                reply_time_minutes: row.try_get("reply_time_minutes")?,
                first_resolution_time_minutes: row.try_get("first_resolution_time_minutes")?,
                full_resolution_time_minutes: row.try_get("full_resolution_time_minutes")?,
                agent_wait_time_minutes: row.try_get("agent_wait_time_minutes")?,
                requester_wait_time_minutes: row.try_get("requester_wait_time_minutes")?,
                reopens: row.try_get("reopens")?,
                replies: row.try_get("replies")?,
                solved_at: row.try_get("solved_at")?,
            })
        } else {
            None
        };
        Ok(Ticket {
            id: row.try_get("id")?,
            subject: row.try_get("subject")?,
            status: row.try_get("status")?,
            priority: row.try_get("priority")?,
            ticket_type: row.try_get("ticket_type")?,
            requester_id: row.try_get("requester_id")?,
            assignee_id: row.try_get("assignee_id")?,
            organization_id: row.try_get("organization_id")?,
            group_id: row.try_get("group_id")?,
            tags: row.try_get("tags")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            time_spent_minutes: row.try_get("time_spent_minutes")?,
            billable_minutes: row.try_get("billable_minutes")?,
            metrics,
        })
    }

    fn map_aggregation_log(row: &PgRow) -> StoreResult<AggregationLog> {
        let grain: String = row.try_get("aggregation_type")?;
        let status: String = row.try_get("status")?;
        Ok(AggregationLog {
            grain: grain.parse()?,
            period_start: row.try_get("period_start")?,
            status: status.parse()?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            records_produced: row.try_get("records_produced")?,
            error_message: row.try_get("error_message")?,
        })
    }

    fn map_rollup(row: &PgRow) -> StoreResult<Rollup> {
        let grain: String = row.try_get("grain")?;
        Ok(Rollup {
            key: RollupKey {
                grain: grain.parse()?,
                period_start: row.try_get("period_start")?,
                organization_id: row.try_get("organization_id")?,
                agent_id: row.try_get("agent_id")?,
                group_id: row.try_get("group_id")?,
                priority: row.try_get("priority")?,
            },
            metrics: RollupMetrics {
                tickets_created: row.try_get("tickets_created")?,
                tickets_solved: row.try_get("tickets_solved")?,
                tickets_closed: row.try_get("tickets_closed")?,
                tickets_reopened: row.try_get("tickets_reopened")?,
                total_minutes: row.try_get("total_minutes")?,
                billable_minutes: row.try_get("billable_minutes")?,
                avg_first_reply_minutes: row.try_get("avg_first_reply_minutes")?,
                avg_full_resolution_minutes: row.try_get("avg_full_resolution_minutes")?,
                sla_met: row.try_get("sla_met")?,
                sla_breached: row.try_get("sla_breached")?,
                one_touch: row.try_get("one_touch")?,
                two_touch: row.try_get("two_touch")?,
                multi_touch: row.try_get("multi_touch")?,
            },
        })
    }
}

#[async_trait]
impl CheckpointStore for PgStore {
    async fn load(&self, entity: EntityKind) -> StoreResult<Option<SyncCheckpoint>> {
        let row = sqlx::query(&format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM sync_checkpoints WHERE entity_type = $1"
        ))
        .bind(entity.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::map_checkpoint).transpose()
    }

    async fn list(&self) -> StoreResult<Vec<SyncCheckpoint>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM sync_checkpoints ORDER BY entity_type"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::map_checkpoint).collect()
    }

    async fn mark_syncing(&self, entity: EntityKind) -> StoreResult<SyncCheckpoint> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO sync_checkpoints (entity_type, status, updated_at)
            VALUES ($1, 'syncing', $2)
            ON CONFLICT (entity_type) DO UPDATE SET
                status = 'syncing',
                updated_at = EXCLUDED.updated_at
            RETURNING {CHECKPOINT_COLUMNS}
            "#
        ))
        .bind(entity.as_str())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Self::map_checkpoint(&row)
    }

    async fn mark_success(
        &self,
        entity: EntityKind,
        cursor: &str,
        records: u64,
    ) -> StoreResult<SyncCheckpoint> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO sync_checkpoints
                (entity_type, last_cursor, status, last_error, records_synced, updated_at)
            VALUES ($1, $2, 'success', NULL, $3, $4)
            ON CONFLICT (entity_type) DO UPDATE SET
                last_cursor = CASE
                    WHEN sync_checkpoints.last_cursor ~ '^[0-9]+$'
                     AND EXCLUDED.last_cursor ~ '^[0-9]+$'
                    THEN GREATEST(sync_checkpoints.last_cursor::BIGINT,
                                  EXCLUDED.last_cursor::BIGINT)::TEXT
                    ELSE EXCLUDED.last_cursor
                END,
                status = 'success',
                last_error = NULL,
                records_synced = sync_checkpoints.records_synced + EXCLUDED.records_synced,
                updated_at = EXCLUDED.updated_at
            RETURNING {CHECKPOINT_COLUMNS}
            "#
        ))
        .bind(entity.as_str())
        .bind(cursor)
        .bind(records as i64)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Self::map_checkpoint(&row)
    }

    async fn mark_error(&self, entity: EntityKind, message: &str) -> StoreResult<SyncCheckpoint> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO sync_checkpoints (entity_type, status, last_error, updated_at)
            VALUES ($1, 'error', $2, $3)
            ON CONFLICT (entity_type) DO UPDATE SET
                status = 'error',
                last_error = EXCLUDED.last_error,
                updated_at = EXCLUDED.updated_at
            RETURNING {CHECKPOINT_COLUMNS}
            "#
        ))
        .bind(entity.as_str())
        .bind(message)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Self::map_checkpoint(&row)
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn upsert_ticket(&self, ticket: &Ticket) -> StoreResult<()> {
        let metrics = ticket.metrics.clone().unwrap_or_default();
        sqlx::query(UPSERT_TICKET)
            .bind(ticket.id)
            .bind(&ticket.subject)
            .bind(&ticket.status)
            .bind(&ticket.priority)
            .bind(&ticket.ticket_type)
            .bind(ticket.requester_id)
            .bind(ticket.assignee_id)
            .bind(ticket.organization_id)
            .bind(ticket.group_id)
            .bind(&ticket.tags)
            .bind(ticket.created_at)
            .bind(ticket.updated_at)
            .bind(ticket.time_spent_minutes)
            .bind(ticket.billable_minutes)
            .bind(ticket.metrics.is_some())
            .bind(metrics.reply_time_minutes)
            .bind(metrics.first_resolution_time_minutes)
            .bind(metrics.full_resolution_time_minutes)
            .bind(metrics.agent_wait_time_minutes)
            .bind(metrics.requester_wait_time_minutes)
            .bind(metrics.reopens)
            .bind(metrics.replies)
            .bind(metrics.solved_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_organization(&self, organization: &Organization) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO organizations
                (id, name, domain_names, group_id, tags, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                domain_names = EXCLUDED.domain_names,
                group_id = EXCLUDED.group_id,
                tags = EXCLUDED.tags,
                created_at = EXCLUDED.created_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(organization.id)
        .bind(&organization.name)
        .bind(&organization.domain_names)
        .bind(organization.group_id)
        .bind(&organization.tags)
        .bind(organization.created_at)
        .bind(organization.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_agent(&self, agent: &Agent) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO agents
                (id, name, email, role, active, default_group_id, organization_id,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                email = EXCLUDED.email,
                role = EXCLUDED.role,
                active = EXCLUDED.active,
                default_group_id = EXCLUDED.default_group_id,
                organization_id = EXCLUDED.organization_id,
                created_at = EXCLUDED.created_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(agent.id)
        .bind(&agent.name)
        .bind(&agent.email)
        .bind(&agent.role)
        .bind(agent.active)
        .bind(agent.default_group_id)
        .bind(agent.organization_id)
        .bind(agent.created_at)
        .bind(agent.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_group(&self, group: &Group) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO groups (id, name, description, is_default, deleted, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                is_default = EXCLUDED.is_default,
                deleted = EXCLUDED.deleted,
                created_at = EXCLUDED.created_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(group.id)
        .bind(&group.name)
        .bind(&group.description)
        .bind(group.is_default)
        .bind(group.deleted)
        .bind(group.created_at)
        .bind(group.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn tickets_touching(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<Ticket>> {
        let rows = sqlx::query(
            r#"
            SELECT *
              FROM tickets
             WHERE (created_at >= $1 AND created_at < $2)
                OR (updated_at >= $1 AND updated_at < $2)
                OR (solved_at >= $1 AND solved_at < $2)
             ORDER BY id
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::map_ticket).collect()
    }

    async fn count_records(&self, entity: EntityKind) -> StoreResult<i64> {
        let table = match entity {
            EntityKind::Tickets => "tickets",
            EntityKind::Organizations => "organizations",
            EntityKind::Agents => "agents",
            EntityKind::Groups => "groups",
        };
        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

#[async_trait]
impl AggregationStore for PgStore {
    async fn begin_aggregation(
        &self,
        grain: AggregationGrain,
        period_start: NaiveDate,
    ) -> StoreResult<AggregationLog> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO aggregation_log
                (aggregation_type, period_start, status, started_at, completed_at,
                 records_produced, error_message)
            VALUES ($1, $2, 'running', $3, NULL, 0, NULL)
            ON CONFLICT (aggregation_type, period_start) DO UPDATE SET
                status = 'running',
                started_at = EXCLUDED.started_at,
                completed_at = NULL,
                records_produced = 0,
                error_message = NULL
            RETURNING {AGGREGATION_LOG_COLUMNS}
            "#
        ))
        .bind(grain.as_str())
        .bind(period_start)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Self::map_aggregation_log(&row)
    }

    async fn complete_aggregation(
        &self,
        grain: AggregationGrain,
        period_start: NaiveDate,
        records_produced: i64,
    ) -> StoreResult<AggregationLog> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE aggregation_log
               SET status = 'success',
                   completed_at = $3,
                   records_produced = $4,
                   error_message = NULL
             WHERE aggregation_type = $1 AND period_start = $2
            RETURNING {AGGREGATION_LOG_COLUMNS}
            "#
        ))
        .bind(grain.as_str())
        .bind(period_start)
        .bind(Utc::now())
        .bind(records_produced)
        .fetch_one(&self.pool)
        .await?;
        Self::map_aggregation_log(&row)
    }

    async fn fail_aggregation(
        &self,
        grain: AggregationGrain,
        period_start: NaiveDate,
        message: &str,
    ) -> StoreResult<AggregationLog> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO aggregation_log
                (aggregation_type, period_start, status, started_at, completed_at,
                 records_produced, error_message)
            VALUES ($1, $2, 'error', $3, $3, 0, $4)
            ON CONFLICT (aggregation_type, period_start) DO UPDATE SET
                status = 'error',
                completed_at = EXCLUDED.completed_at,
                error_message = EXCLUDED.error_message
            RETURNING {AGGREGATION_LOG_COLUMNS}
            "#
        ))
        .bind(grain.as_str())
        .bind(period_start)
        .bind(now)
        .bind(message)
        .fetch_one(&self.pool)
        .await?;
        Self::map_aggregation_log(&row)
    }

    async fn replace_rollups(
        &self,
        grain: AggregationGrain,
        period_start: NaiveDate,
        rows: &[Rollup],
    ) -> StoreResult<u64> {
        let computed_at = Utc::now();
        let mut tx = self.pool.begin().await?;
        for row in rows {
            let m = &row.metrics;
            sqlx::query(UPSERT_ROLLUP)
                .bind(row.key.grain.as_str())
                .bind(row.key.period_start)
                .bind(row.key.organization_id)
                .bind(row.key.agent_id)
                .bind(row.key.group_id)
                .bind(&row.key.priority)
                .bind(m.tickets_created)
                .bind(m.tickets_solved)
                .bind(m.tickets_closed)
                .bind(m.tickets_reopened)
                .bind(m.total_minutes)
                .bind(m.billable_minutes)
                .bind(m.avg_first_reply_minutes)
                .bind(m.avg_full_resolution_minutes)
                .bind(m.sla_met)
                .bind(m.sla_breached)
                .bind(m.one_touch)
                .bind(m.two_touch)
                .bind(m.multi_touch)
                .bind(computed_at)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(
            r#"
            DELETE FROM ticket_rollups
             WHERE grain = $1 AND period_start = $2 AND computed_at <> $3
            "#,
        )
        .bind(grain.as_str())
        .bind(period_start)
        .bind(computed_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(rows.len() as u64)
    }

    async fn rollups(
        &self,
        grain: AggregationGrain,
        period_start: NaiveDate,
    ) -> StoreResult<Vec<Rollup>> {
        let rows = sqlx::query(
            r#"
            SELECT *
              FROM ticket_rollups
             WHERE grain = $1 AND period_start = $2
             ORDER BY organization_id, agent_id, group_id, priority
            "#,
        )
        .bind(grain.as_str())
        .bind(period_start)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::map_rollup).collect()
    }

    async fn recent_aggregations(&self, limit: i64) -> StoreResult<Vec<AggregationLog>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {AGGREGATION_LOG_COLUMNS}
              FROM aggregation_log
             ORDER BY started_at DESC
             LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::map_aggregation_log).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn test_store() -> Option<PgStore> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let store = PgStore::connect(&url).await.expect("db should connect");
        store.migrate().await.expect("migrations");
        Some(store)
    }

    fn ticket(id: i64) -> Ticket {
        let at = Utc.with_ymd_and_hms(2026, 1, 10, 9, 0, 0).unwrap();
        Ticket {
            id,
            subject: Some("Printer on fire".into()),
            status: "open".into(),
            priority: Some("urgent".into()),
            ticket_type: Some("incident".into()),
            requester_id: Some(1),
            assignee_id: Some(2),
            organization_id: Some(3),
            group_id: Some(4),
            tags: vec!["hardware".into()],
            created_at: at,
            updated_at: at,
            time_spent_minutes: Some(30),
            billable_minutes: Some(15),
            metrics: Some(TicketMetrics {
                reply_time_minutes: Some(12),
                replies: 1,
                ..Default::default()
            }),
        }
    }

    #[tokio::test]
    async fn ticket_upsert_is_idempotent() {
        let Some(store) = test_store().await else {
            return;
        };
        let id = 9_000_000_000 + (Utc::now().timestamp_subsec_micros() as i64);
        store.upsert_ticket(&ticket(id)).await.expect("first upsert");
        store.upsert_ticket(&ticket(id)).await.expect("second upsert");

        let at = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        let found = store
            .tickets_touching(at, at + chrono::Duration::days(1))
            .await
            .expect("query");
        let mine = found.into_iter().filter(|t| t.id == id).collect::<Vec<_>>();
        assert_eq!(mine, vec![ticket(id)]);
    }

    #[tokio::test]
    async fn checkpoint_cursor_does_not_rewind() {
        let Some(store) = test_store().await else {
            return;
        };
        store
            .mark_success(EntityKind::Groups, "1700000000", 1)
            .await
            .expect("advance");
        let cp = store
            .mark_success(EntityKind::Groups, "1600000000", 1)
            .await
            .expect("stale advance");
        assert!(cp.cursor_timestamp().unwrap() >= 1_700_000_000);

        let failed = store
            .mark_error(EntityKind::Groups, "boom")
            .await
            .expect("mark error");
        assert_eq!(failed.cursor, cp.cursor);
        assert_eq!(failed.last_error.as_deref(), Some("boom"));
    }
}
