use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use deskpulse_core::{
    advance_cursor, Agent, AggregationGrain, AggregationLog, AggregationStatus, CheckpointStatus,
    EntityKind, Group, Organization, Rollup, RollupKey, SyncCheckpoint, Ticket,
};
use tokio::sync::Mutex;

use crate::{AggregationStore, CheckpointStore, RecordStore, StoreError, StoreResult};

/// In-process store for local runs and unit tests.
///
/// Mirrors the Postgres upsert semantics, including cursor monotonicity and
/// metric retention on ticket upserts.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    checkpoints: BTreeMap<EntityKind, SyncCheckpoint>,
    tickets: BTreeMap<i64, Ticket>,
    organizations: BTreeMap<i64, Organization>,
    agents: BTreeMap<i64, Agent>,
    groups: BTreeMap<i64, Group>,
    aggregation_logs: BTreeMap<(AggregationGrain, NaiveDate), AggregationLog>,
    rollups: BTreeMap<RollupKey, Rollup>,
    rejected: BTreeSet<(EntityKind, i64)>,
    reject_completions: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every future upsert of this record fail (fault injection for tests).
    pub async fn reject_writes_for(&self, entity: EntityKind, id: i64) {
        self.state.lock().await.rejected.insert((entity, id));
    }

    /// Makes every future `complete_aggregation` call fail.
    pub async fn reject_aggregation_completions(&self) {
        self.state.lock().await.reject_completions = true;
    }

    pub async fn ticket(&self, id: i64) -> Option<Ticket> {
        self.state.lock().await.tickets.get(&id).cloned()
    }

    pub async fn all_tickets(&self) -> Vec<Ticket> {
        self.state.lock().await.tickets.values().cloned().collect()
    }

    pub async fn all_organizations(&self) -> Vec<Organization> {
        self.state.lock().await.organizations.values().cloned().collect()
    }

    /// Seeds a checkpoint row directly, bypassing run bookkeeping.
    pub async fn put_checkpoint(&self, checkpoint: SyncCheckpoint) {
        self.state
            .lock()
            .await
            .checkpoints
            .insert(checkpoint.entity, checkpoint);
    }

    pub async fn aggregation_log(
        &self,
        grain: AggregationGrain,
        period_start: NaiveDate,
    ) -> Option<AggregationLog> {
        self.state
            .lock()
            .await
            .aggregation_logs
            .get(&(grain, period_start))
            .cloned()
    }
}

impl MemoryState {
    fn checkpoint_mut(&mut self, entity: EntityKind) -> &mut SyncCheckpoint {
        self.checkpoints
            .entry(entity)
            .or_insert_with(|| SyncCheckpoint::new(entity, Utc::now()))
    }

    fn ensure_accepted(&self, entity: EntityKind, id: i64) -> StoreResult<()> {
        if self.rejected.contains(&(entity, id)) {
            return Err(StoreError::Rejected(format!("{entity} {id}")));
        }
        Ok(())
    }

    fn log_mut(&mut self, grain: AggregationGrain, period_start: NaiveDate) -> &mut AggregationLog {
        self.aggregation_logs
            .entry((grain, period_start))
            .or_insert_with(|| AggregationLog {
                grain,
                period_start,
                status: AggregationStatus::Running,
                started_at: Utc::now(),
                completed_at: None,
                records_produced: 0,
                error_message: None,
            })
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn load(&self, entity: EntityKind) -> StoreResult<Option<SyncCheckpoint>> {
        Ok(self.state.lock().await.checkpoints.get(&entity).cloned())
    }

    async fn list(&self) -> StoreResult<Vec<SyncCheckpoint>> {
        Ok(self.state.lock().await.checkpoints.values().cloned().collect())
    }

    async fn mark_syncing(&self, entity: EntityKind) -> StoreResult<SyncCheckpoint> {
        let mut state = self.state.lock().await;
        let cp = state.checkpoint_mut(entity);
        cp.status = CheckpointStatus::Syncing;
        cp.updated_at = Utc::now();
        Ok(cp.clone())
    }

    async fn mark_success(
        &self,
        entity: EntityKind,
        cursor: &str,
        records: u64,
    ) -> StoreResult<SyncCheckpoint> {
        let mut state = self.state.lock().await;
        let cp = state.checkpoint_mut(entity);
        cp.cursor = Some(advance_cursor(cp.cursor.as_deref(), cursor));
        cp.status = CheckpointStatus::Success;
        cp.last_error = None;
        cp.records_synced += records as i64;
        cp.updated_at = Utc::now();
        Ok(cp.clone())
    }

    async fn mark_error(&self, entity: EntityKind, message: &str) -> StoreResult<SyncCheckpoint> {
        let mut state = self.state.lock().await;
        let cp = state.checkpoint_mut(entity);
        cp.status = CheckpointStatus::Error;
        cp.last_error = Some(message.to_string());
        cp.updated_at = Utc::now();
        Ok(cp.clone())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn upsert_ticket(&self, ticket: &Ticket) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.ensure_accepted(EntityKind::Tickets, ticket.id)?;
        let mut next = ticket.clone();
        if next.metrics.is_none() {
            next.metrics = state.tickets.get(&ticket.id).and_then(|t| t.metrics.clone());
        }
        state.tickets.insert(ticket.id, next);
        Ok(())
    }

    async fn upsert_organization(&self, organization: &Organization) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.ensure_accepted(EntityKind::Organizations, organization.id)?;
        state.organizations.insert(organization.id, organization.clone());
        Ok(())
    }

    async fn upsert_agent(&self, agent: &Agent) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.ensure_accepted(EntityKind::Agents, agent.id)?;
        state.agents.insert(agent.id, agent.clone());
        Ok(())
    }

    async fn upsert_group(&self, group: &Group) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.ensure_accepted(EntityKind::Groups, group.id)?;
        state.groups.insert(group.id, group.clone());
        Ok(())
    }

    async fn tickets_touching(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<Ticket>> {
        let within = |ts: DateTime<Utc>| ts >= start && ts < end;
        Ok(self
            .state
            .lock()
            .await
            .tickets
            .values()
            .filter(|t| {
                within(t.created_at) || within(t.updated_at) || t.solved_at().is_some_and(within)
            })
            .cloned()
            .collect())
    }

    async fn count_records(&self, entity: EntityKind) -> StoreResult<i64> {
        let state = self.state.lock().await;
        let n = match entity {
            EntityKind::Tickets => state.tickets.len(),
            EntityKind::Organizations => state.organizations.len(),
            EntityKind::Agents => state.agents.len(),
            EntityKind::Groups => state.groups.len(),
        };
        Ok(n as i64)
    }
}

#[async_trait]
impl AggregationStore for MemoryStore {
    async fn begin_aggregation(
        &self,
        grain: AggregationGrain,
        period_start: NaiveDate,
    ) -> StoreResult<AggregationLog> {
        let mut state = self.state.lock().await;
        let log = state.log_mut(grain, period_start);
        log.status = AggregationStatus::Running;
        log.started_at = Utc::now();
        log.completed_at = None;
        log.records_produced = 0;
        log.error_message = None;
        Ok(log.clone())
    }

    async fn complete_aggregation(
        &self,
        grain: AggregationGrain,
        period_start: NaiveDate,
        records_produced: i64,
    ) -> StoreResult<AggregationLog> {
        let mut state = self.state.lock().await;
        if state.reject_completions {
            return Err(StoreError::Rejected(format!("{grain} {period_start} completion")));
        }
        let log = state.log_mut(grain, period_start);
        log.status = AggregationStatus::Success;
        log.completed_at = Some(Utc::now());
        log.records_produced = records_produced;
        log.error_message = None;
        Ok(log.clone())
    }

    async fn fail_aggregation(
        &self,
        grain: AggregationGrain,
        period_start: NaiveDate,
        message: &str,
    ) -> StoreResult<AggregationLog> {
        let mut state = self.state.lock().await;
        let log = state.log_mut(grain, period_start);
        log.status = AggregationStatus::Error;
        log.completed_at = Some(Utc::now());
        log.error_message = Some(message.to_string());
        Ok(log.clone())
    }

    async fn replace_rollups(
        &self,
        grain: AggregationGrain,
        period_start: NaiveDate,
        rows: &[Rollup],
    ) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        state
            .rollups
            .retain(|key, _| !(key.grain == grain && key.period_start == period_start));
        for row in rows {
            state.rollups.insert(row.key.clone(), row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn rollups(
        &self,
        grain: AggregationGrain,
        period_start: NaiveDate,
    ) -> StoreResult<Vec<Rollup>> {
        Ok(self
            .state
            .lock()
            .await
            .rollups
            .values()
            .filter(|r| r.key.grain == grain && r.key.period_start == period_start)
            .cloned()
            .collect())
    }

    async fn recent_aggregations(&self, limit: i64) -> StoreResult<Vec<AggregationLog>> {
        let mut logs = self
            .state
            .lock()
            .await
            .aggregation_logs
            .values()
            .cloned()
            .collect::<Vec<_>>();
        logs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        logs.truncate(limit.max(0) as usize);
        Ok(logs)
    }
}
