//! Core domain model for deskpulse: mirrored helpdesk records, sync checkpoints and rollups.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "deskpulse-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} `{value}`")]
pub struct ParseKindError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseKindError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Upstream entity families mirrored locally. Each owns exactly one checkpoint row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Tickets,
    Organizations,
    Agents,
    Groups,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Tickets,
        EntityKind::Organizations,
        EntityKind::Agents,
        EntityKind::Groups,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Tickets => "tickets",
            EntityKind::Organizations => "organizations",
            EntityKind::Agents => "agents",
            EntityKind::Groups => "groups",
        }
    }

    /// Tickets are synced by cursor; everything else is re-read in full.
    pub fn is_incremental(&self) -> bool {
        matches!(self, EntityKind::Tickets)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tickets" | "ticket" => Ok(EntityKind::Tickets),
            "organizations" | "organization" | "orgs" => Ok(EntityKind::Organizations),
            "agents" | "agent" | "users" => Ok(EntityKind::Agents),
            "groups" | "group" => Ok(EntityKind::Groups),
            other => Err(ParseKindError::new("entity type", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Idle,
    Syncing,
    Success,
    Error,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Idle => "idle",
            CheckpointStatus::Syncing => "syncing",
            CheckpointStatus::Success => "success",
            CheckpointStatus::Error => "error",
        }
    }
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointStatus {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(CheckpointStatus::Idle),
            "syncing" => Ok(CheckpointStatus::Syncing),
            "success" => Ok(CheckpointStatus::Success),
            "error" => Ok(CheckpointStatus::Error),
            other => Err(ParseKindError::new("checkpoint status", other)),
        }
    }
}

/// Last known sync position for one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub entity: EntityKind,
    pub cursor: Option<String>,
    pub status: CheckpointStatus,
    pub last_error: Option<String>,
    pub records_synced: i64,
    pub updated_at: DateTime<Utc>,
}

impl SyncCheckpoint {
    pub fn new(entity: EntityKind, now: DateTime<Utc>) -> Self {
        Self {
            entity,
            cursor: None,
            status: CheckpointStatus::Idle,
            last_error: None,
            records_synced: 0,
            updated_at: now,
        }
    }

    /// Cursor interpreted as a Unix timestamp, when it is one.
    pub fn cursor_timestamp(&self) -> Option<i64> {
        self.cursor.as_deref().and_then(|c| c.trim().parse::<i64>().ok())
    }
}

/// Picks the cursor to persist. Timestamp cursors never move backwards; opaque
/// tokens are replaced as given.
pub fn advance_cursor(previous: Option<&str>, next: &str) -> String {
    let prev = previous.and_then(|p| p.trim().parse::<i64>().ok());
    match (prev, next.trim().parse::<i64>().ok()) {
        (Some(prev), Some(next_ts)) if prev > next_ts => prev.to_string(),
        _ => next.to_string(),
    }
}

/// Derived per-ticket metrics delivered by the upstream metric side-channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketMetrics {
    pub reply_time_minutes: Option<i64>,
    pub first_resolution_time_minutes: Option<i64>,
    pub full_resolution_time_minutes: Option<i64>,
    pub agent_wait_time_minutes: Option<i64>,
    pub requester_wait_time_minutes: Option<i64>,
    pub reopens: i32,
    pub replies: i32,
    pub solved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: i64,
    pub subject: Option<String>,
    pub status: String,
    pub priority: Option<String>,
    pub ticket_type: Option<String>,
    pub requester_id: Option<i64>,
    pub assignee_id: Option<i64>,
    pub organization_id: Option<i64>,
    pub group_id: Option<i64>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub time_spent_minutes: Option<i64>,
    pub billable_minutes: Option<i64>,
    pub metrics: Option<TicketMetrics>,
}

impl Ticket {
    pub fn solved_at(&self) -> Option<DateTime<Utc>> {
        self.metrics.as_ref().and_then(|m| m.solved_at)
    }

    pub fn is_closed(&self) -> bool {
        self.status.eq_ignore_ascii_case("closed")
    }

    pub fn replies(&self) -> i32 {
        self.metrics.as_ref().map(|m| m.replies).unwrap_or(0)
    }

    pub fn reopens(&self) -> i32 {
        self.metrics.as_ref().map(|m| m.reopens).unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: i64,
    pub name: String,
    pub domain_names: Vec<String>,
    pub group_id: Option<i64>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
    pub role: String,
    pub active: bool,
    pub default_group_id: Option<i64>,
    pub organization_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub is_default: bool,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Priority → first-reply threshold table, in minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaPolicy {
    pub urgent_minutes: i64,
    pub high_minutes: i64,
    pub normal_minutes: i64,
    pub fallback_minutes: i64,
}

impl Default for SlaPolicy {
    fn default() -> Self {
        Self {
            urgent_minutes: 60,
            high_minutes: 240,
            normal_minutes: 480,
            fallback_minutes: 1440,
        }
    }
}

impl SlaPolicy {
    pub fn threshold_minutes(&self, priority: Option<&str>) -> i64 {
        match priority.map(|p| p.trim().to_ascii_lowercase()).as_deref() {
            Some("urgent") => self.urgent_minutes,
            Some("high") => self.high_minutes,
            Some("normal") => self.normal_minutes,
            _ => self.fallback_minutes,
        }
    }

    pub fn is_met(&self, priority: Option<&str>, minutes: i64) -> bool {
        minutes <= self.threshold_minutes(priority)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchBucket {
    One,
    Two,
    Multi,
}

impl TouchBucket {
    /// Zero replies count as a one-touch resolution.
    pub fn from_replies(replies: i32) -> Self {
        match replies {
            i32::MIN..=1 => TouchBucket::One,
            2 => TouchBucket::Two,
            _ => TouchBucket::Multi,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationGrain {
    Daily,
    Weekly,
    Monthly,
}

/// Which ticket dimensions survive into a grain's rollup key. Organization is always kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub agent: bool,
    pub group: bool,
    pub priority: bool,
}

impl AggregationGrain {
    pub const ALL: [AggregationGrain; 3] = [
        AggregationGrain::Daily,
        AggregationGrain::Weekly,
        AggregationGrain::Monthly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationGrain::Daily => "daily",
            AggregationGrain::Weekly => "weekly",
            AggregationGrain::Monthly => "monthly",
        }
    }

    pub fn dimensions(&self) -> Dimensions {
        match self {
            AggregationGrain::Daily => Dimensions {
                agent: true,
                group: true,
                priority: true,
            },
            AggregationGrain::Weekly => Dimensions {
                agent: true,
                group: true,
                priority: false,
            },
            AggregationGrain::Monthly => Dimensions {
                agent: false,
                group: true,
                priority: false,
            },
        }
    }

    /// Normalizes any date to the first day of its period (ISO weeks start on Monday).
    pub fn period_start(&self, date: NaiveDate) -> NaiveDate {
        match self {
            AggregationGrain::Daily => date,
            AggregationGrain::Weekly => {
                date - Duration::days(date.weekday().num_days_from_monday() as i64)
            }
            AggregationGrain::Monthly => first_of_month(date),
        }
    }

    /// Exclusive end date of the period containing `date`.
    pub fn period_end(&self, date: NaiveDate) -> NaiveDate {
        let start = self.period_start(date);
        match self {
            AggregationGrain::Daily => start + Duration::days(1),
            AggregationGrain::Weekly => start + Duration::days(7),
            AggregationGrain::Monthly => first_of_month(start + Duration::days(32)),
        }
    }

    /// The last fully elapsed period before `today`.
    pub fn previous_period(&self, today: NaiveDate) -> NaiveDate {
        let current = self.period_start(today);
        self.period_start(current - Duration::days(1))
    }

    /// UTC instants bounding the period: `[start, end)`.
    pub fn window(&self, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        (
            midnight_utc(self.period_start(date)),
            midnight_utc(self.period_end(date)),
        )
    }
}

impl fmt::Display for AggregationGrain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationGrain {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" | "day" => Ok(AggregationGrain::Daily),
            "weekly" | "week" => Ok(AggregationGrain::Weekly),
            "monthly" | "month" => Ok(AggregationGrain::Monthly),
            other => Err(ParseKindError::new("aggregation grain", other)),
        }
    }
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.day0() as i64)
}

pub fn midnight_utc(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStatus {
    Running,
    Success,
    Error,
}

impl AggregationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationStatus::Running => "running",
            AggregationStatus::Success => "success",
            AggregationStatus::Error => "error",
        }
    }
}

impl FromStr for AggregationStatus {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(AggregationStatus::Running),
            "success" => Ok(AggregationStatus::Success),
            "error" => Ok(AggregationStatus::Error),
            other => Err(ParseKindError::new("aggregation status", other)),
        }
    }
}

/// Run-log row, unique per (grain, period_start).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationLog {
    pub grain: AggregationGrain,
    pub period_start: NaiveDate,
    pub status: AggregationStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub records_produced: i64,
    pub error_message: Option<String>,
}

/// Dimension value stored when a ticket has no organization/agent/group, or when the
/// grain collapses that dimension.
pub const NO_DIMENSION: i64 = 0;
pub const NO_PRIORITY: &str = "none";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RollupKey {
    pub grain: AggregationGrain,
    pub period_start: NaiveDate,
    pub organization_id: i64,
    pub agent_id: i64,
    pub group_id: i64,
    pub priority: String,
}

impl RollupKey {
    pub fn for_ticket(grain: AggregationGrain, period_start: NaiveDate, ticket: &Ticket) -> Self {
        let dims = grain.dimensions();
        let priority = if dims.priority {
            ticket
                .priority
                .as_deref()
                .map(|p| p.trim().to_ascii_lowercase())
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| NO_PRIORITY.to_string())
        } else {
            NO_PRIORITY.to_string()
        };
        Self {
            grain,
            period_start,
            organization_id: ticket.organization_id.unwrap_or(NO_DIMENSION),
            agent_id: if dims.agent {
                ticket.assignee_id.unwrap_or(NO_DIMENSION)
            } else {
                NO_DIMENSION
            },
            group_id: if dims.group {
                ticket.group_id.unwrap_or(NO_DIMENSION)
            } else {
                NO_DIMENSION
            },
            priority,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollupMetrics {
    pub tickets_created: i64,
    pub tickets_solved: i64,
    pub tickets_closed: i64,
    pub tickets_reopened: i64,
    pub total_minutes: i64,
    pub billable_minutes: i64,
    pub avg_first_reply_minutes: Option<f64>,
    pub avg_full_resolution_minutes: Option<f64>,
    pub sla_met: i64,
    pub sla_breached: i64,
    pub one_touch: i64,
    pub two_touch: i64,
    pub multi_touch: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rollup {
    pub key: RollupKey,
    pub metrics: RollupMetrics,
}
