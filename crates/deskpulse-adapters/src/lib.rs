//! Upstream helpdesk API contracts: wire payloads, endpoint URLs and record mapping.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use deskpulse_core::{Agent, EntityKind, Group, Organization, Ticket, TicketMetrics};
use deskpulse_storage::Paginated;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "deskpulse-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0} has no full-snapshot endpoint")]
    NotSnapshot(EntityKind),
}

/// URL builder for the upstream REST API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiEndpoints {
    base_url: String,
}

impl ApiEndpoints {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn snapshot_page(
        &self,
        entity: EntityKind,
        page: u32,
        per_page: u32,
    ) -> Result<String, AdapterError> {
        let path = match entity {
            EntityKind::Organizations => "organizations.json?",
            EntityKind::Agents => "users.json?role[]=agent&role[]=admin&",
            EntityKind::Groups => "groups.json?",
            EntityKind::Tickets => return Err(AdapterError::NotSnapshot(entity)),
        };
        Ok(format!(
            "{}/api/v2/{path}page={page}&per_page={per_page}",
            self.base_url
        ))
    }

    /// Time-based incremental export; metric sets ride along as a side-channel.
    pub fn incremental_tickets(&self, start_time: i64, per_page: u32) -> String {
        format!(
            "{}/api/v2/incremental/tickets.json\
             ?start_time={start_time}&per_page={per_page}&include=metric_sets",
            self.base_url
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOrganization {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub domain_names: Vec<String>,
    #[serde(default)]
    pub group_id: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawUser {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    pub role: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub default_group_id: Option<i64>,
    #[serde(default)]
    pub organization_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawGroup {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCustomField {
    pub id: i64,
    #[serde(default)]
    pub value: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTicket {
    pub id: i64,
    #[serde(default)]
    pub subject: Option<String>,
    pub status: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default, rename = "type")]
    pub ticket_type: Option<String>,
    #[serde(default)]
    pub requester_id: Option<i64>,
    #[serde(default)]
    pub assignee_id: Option<i64>,
    #[serde(default)]
    pub organization_id: Option<i64>,
    #[serde(default)]
    pub group_id: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub custom_fields: Vec<RawCustomField>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinutesPair {
    #[serde(default)]
    pub calendar: Option<i64>,
    #[serde(default)]
    pub business: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMetricSet {
    pub ticket_id: i64,
    #[serde(default)]
    pub reopens: Option<i32>,
    #[serde(default)]
    pub replies: Option<i32>,
    #[serde(default)]
    pub reply_time_in_minutes: Option<MinutesPair>,
    #[serde(default)]
    pub first_resolution_time_in_minutes: Option<MinutesPair>,
    #[serde(default)]
    pub full_resolution_time_in_minutes: Option<MinutesPair>,
    #[serde(default)]
    pub agent_wait_time_in_minutes: Option<MinutesPair>,
    #[serde(default)]
    pub requester_wait_time_in_minutes: Option<MinutesPair>,
    #[serde(default)]
    pub solved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrganizationsPage {
    #[serde(default)]
    pub organizations: Vec<RawOrganization>,
    #[serde(default)]
    pub next_page: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UsersPage {
    #[serde(default)]
    pub users: Vec<RawUser>,
    #[serde(default)]
    pub next_page: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupsPage {
    #[serde(default)]
    pub groups: Vec<RawGroup>,
    #[serde(default)]
    pub next_page: Option<String>,
}

/// One window of the incremental ticket export.
#[derive(Debug, Clone, Deserialize)]
pub struct IncrementalTicketsPage {
    #[serde(default)]
    pub tickets: Vec<RawTicket>,
    #[serde(default)]
    pub metric_sets: Vec<RawMetricSet>,
    #[serde(default)]
    pub next_page: Option<String>,
    /// Server-side end of the window covered by this page; the next `start_time`.
    #[serde(default)]
    pub end_time: Option<i64>,
    #[serde(default)]
    pub end_of_stream: bool,
}

impl Paginated for OrganizationsPage {
    fn next_page(&self) -> Option<&str> {
        self.next_page.as_deref()
    }

    fn item_count(&self) -> usize {
        self.organizations.len()
    }
}

impl Paginated for UsersPage {
    fn next_page(&self) -> Option<&str> {
        self.next_page.as_deref()
    }

    fn item_count(&self) -> usize {
        self.users.len()
    }
}

impl Paginated for GroupsPage {
    fn next_page(&self) -> Option<&str> {
        self.next_page.as_deref()
    }

    fn item_count(&self) -> usize {
        self.groups.len()
    }
}

impl Paginated for IncrementalTicketsPage {
    fn next_page(&self) -> Option<&str> {
        self.next_page.as_deref()
    }

    fn item_count(&self) -> usize {
        self.tickets.len()
    }
}

/// A mapped record from one of the full-snapshot entity families.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotRecord {
    Organization(Organization),
    Agent(Agent),
    Group(Group),
}

impl SnapshotRecord {
    pub fn id(&self) -> i64 {
        match self {
            SnapshotRecord::Organization(o) => o.id,
            SnapshotRecord::Agent(a) => a.id,
            SnapshotRecord::Group(g) => g.id,
        }
    }
}

pub trait SnapshotPage: Paginated + DeserializeOwned + Send {
    fn into_records(self) -> Vec<SnapshotRecord>;
}

impl SnapshotPage for OrganizationsPage {
    fn into_records(self) -> Vec<SnapshotRecord> {
        self.organizations
            .into_iter()
            .map(|o| SnapshotRecord::Organization(map_organization(o)))
            .collect()
    }
}

impl SnapshotPage for UsersPage {
    fn into_records(self) -> Vec<SnapshotRecord> {
        self.users
            .into_iter()
            .map(|u| SnapshotRecord::Agent(map_agent(u)))
            .collect()
    }
}

impl SnapshotPage for GroupsPage {
    fn into_records(self) -> Vec<SnapshotRecord> {
        self.groups
            .into_iter()
            .map(|g| SnapshotRecord::Group(map_group(g)))
            .collect()
    }
}

pub fn map_organization(raw: RawOrganization) -> Organization {
    Organization {
        id: raw.id,
        name: raw.name,
        domain_names: raw.domain_names,
        group_id: raw.group_id,
        tags: raw.tags,
        created_at: raw.created_at,
        updated_at: raw.updated_at,
    }
}

pub fn map_agent(raw: RawUser) -> Agent {
    Agent {
        id: raw.id,
        name: raw.name,
        email: raw.email,
        role: raw.role,
        active: raw.active,
        default_group_id: raw.default_group_id,
        organization_id: raw.organization_id,
        created_at: raw.created_at,
        updated_at: raw.updated_at,
    }
}

pub fn map_group(raw: RawGroup) -> Group {
    Group {
        id: raw.id,
        name: raw.name,
        description: raw.description,
        is_default: raw.default,
        deleted: raw.deleted,
        created_at: raw.created_at,
        updated_at: raw.updated_at,
    }
}

/// Custom ticket fields that carry durations, in minutes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FieldMapping {
    pub time_spent_field_id: Option<i64>,
    pub billable_field_id: Option<i64>,
}

/// Accepts numeric or numeric-string values; fractional minutes are rounded.
pub fn custom_field_minutes(fields: &[RawCustomField], field_id: i64) -> Option<i64> {
    let value = &fields.iter().find(|f| f.id == field_id)?.value;
    let minutes = match value {
        JsonValue::Number(n) => n.as_f64()?,
        JsonValue::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    minutes.is_finite().then(|| minutes.round() as i64)
}

pub fn map_metric_set(raw: &RawMetricSet) -> TicketMetrics {
    let calendar = |pair: &Option<MinutesPair>| pair.and_then(|p| p.calendar);
    TicketMetrics {
        reply_time_minutes: calendar(&raw.reply_time_in_minutes),
        first_resolution_time_minutes: calendar(&raw.first_resolution_time_in_minutes),
        full_resolution_time_minutes: calendar(&raw.full_resolution_time_in_minutes),
        agent_wait_time_minutes: calendar(&raw.agent_wait_time_in_minutes),
        requester_wait_time_minutes: calendar(&raw.requester_wait_time_in_minutes),
        reopens: raw.reopens.unwrap_or(0),
        replies: raw.replies.unwrap_or(0),
        solved_at: raw.solved_at,
    }
}

pub fn map_ticket(raw: RawTicket, metrics: Option<&RawMetricSet>, fields: &FieldMapping) -> Ticket {
    let time_spent_minutes = fields
        .time_spent_field_id
        .and_then(|id| custom_field_minutes(&raw.custom_fields, id));
    let billable_minutes = fields
        .billable_field_id
        .and_then(|id| custom_field_minutes(&raw.custom_fields, id));
    Ticket {
        id: raw.id,
        subject: raw.subject,
        status: raw.status,
        priority: raw.priority,
        ticket_type: raw.ticket_type,
        requester_id: raw.requester_id,
        assignee_id: raw.assignee_id,
        organization_id: raw.organization_id,
        group_id: raw.group_id,
        tags: raw.tags,
        created_at: raw.created_at,
        updated_at: raw.updated_at,
        time_spent_minutes,
        billable_minutes,
        metrics: metrics.map(map_metric_set),
    }
}

/// Joins the metric side-channel onto the page's tickets by ticket id.
pub fn tickets_with_metrics(
    tickets: Vec<RawTicket>,
    metric_sets: &[RawMetricSet],
    fields: &FieldMapping,
) -> Vec<Ticket> {
    let by_ticket: HashMap<i64, &RawMetricSet> =
        metric_sets.iter().map(|m| (m.ticket_id, m)).collect();
    tickets
        .into_iter()
        .map(|raw| {
            let metrics = by_ticket.get(&raw.id).copied();
            map_ticket(raw, metrics, fields)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incremental_fixture() -> JsonValue {
        serde_json::json!({
            "tickets": [
                {
                    "id": 11,
                    "subject": "VPN down",
                    "status": "solved",
                    "priority": "urgent",
                    "type": "incident",
                    "requester_id": 1,
                    "assignee_id": 2,
                    "organization_id": 3,
                    "group_id": 4,
                    "tags": ["network"],
                    "created_at": "2026-01-05T08:00:00Z",
                    "updated_at": "2026-01-05T10:00:00Z",
                    "custom_fields": [
                        {"id": 900, "value": "45"},
                        {"id": 901, "value": 30.4},
                        {"id": 902, "value": null}
                    ]
                },
                {
                    "id": 12,
                    "status": "new",
                    "created_at": "2026-01-05T09:00:00Z",
                    "updated_at": "2026-01-05T09:00:00Z"
                }
            ],
            "metric_sets": [
                {
                    "ticket_id": 11,
                    "reopens": 1,
                    "replies": 3,
                    "reply_time_in_minutes": {"calendar": 14, "business": 10},
                    "full_resolution_time_in_minutes": {"calendar": 120, "business": 90},
                    "solved_at": "2026-01-05T10:00:00Z"
                }
            ],
            "end_time": 1767607200,
            "end_of_stream": true,
            "next_page": null,
            "count": 2
        })
    }

    #[test]
    fn incremental_page_joins_metrics_by_ticket_id() {
        let page: IncrementalTicketsPage =
            serde_json::from_value(incremental_fixture()).expect("page parses");
        assert!(page.end_of_stream);
        assert_eq!(page.end_time, Some(1_767_607_200));
        assert_eq!(page.item_count(), 2);

        let fields = FieldMapping {
            time_spent_field_id: Some(900),
            billable_field_id: Some(901),
        };
        let tickets = tickets_with_metrics(page.tickets, &page.metric_sets, &fields);

        let solved = &tickets[0];
        assert_eq!(solved.ticket_type.as_deref(), Some("incident"));
        assert_eq!(solved.time_spent_minutes, Some(45));
        assert_eq!(solved.billable_minutes, Some(30));
        let metrics = solved.metrics.as_ref().expect("metrics joined");
        assert_eq!(metrics.reply_time_minutes, Some(14));
        assert_eq!(metrics.full_resolution_time_minutes, Some(120));
        assert_eq!(metrics.first_resolution_time_minutes, None);
        assert_eq!(metrics.replies, 3);
        assert!(solved.solved_at().is_some());

        assert!(tickets[1].metrics.is_none());
        assert!(tickets[1].tags.is_empty());
    }

    #[test]
    fn custom_field_minutes_ignores_non_numeric_values() {
        let fields = vec![
            RawCustomField { id: 1, value: serde_json::json!("n/a") },
            RawCustomField { id: 2, value: serde_json::json!(true) },
            RawCustomField { id: 3, value: serde_json::json!(12) },
        ];
        assert_eq!(custom_field_minutes(&fields, 1), None);
        assert_eq!(custom_field_minutes(&fields, 2), None);
        assert_eq!(custom_field_minutes(&fields, 3), Some(12));
        assert_eq!(custom_field_minutes(&fields, 4), None);
    }

    #[test]
    fn snapshot_pages_map_to_records() {
        let page: UsersPage = serde_json::from_value(serde_json::json!({
            "users": [{
                "id": 5,
                "name": "Ada",
                "email": "ada@example.com",
                "role": "agent",
                "default_group_id": 4,
                "created_at": "2025-06-01T00:00:00Z",
                "updated_at": "2026-01-01T00:00:00Z"
            }],
            "next_page": "https://acme.example/api/v2/users.json?page=2"
        }))
        .expect("users parse");
        assert!(page.next_page().is_some());

        let records = page.into_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id(), 5);
        match &records[0] {
            SnapshotRecord::Agent(agent) => {
                assert!(agent.active);
                assert_eq!(agent.default_group_id, Some(4));
            }
            other => panic!("unexpected record {other:?}"),
        }

        let groups: GroupsPage = serde_json::from_value(serde_json::json!({
            "groups": [{
                "id": 4, "name": "Tier 1", "default": true,
                "created_at": "2025-06-01T00:00:00Z", "updated_at": "2025-06-01T00:00:00Z"
            }],
            "next_page": null
        }))
        .expect("groups parse");
        match &groups.into_records()[0] {
            SnapshotRecord::Group(group) => assert!(group.is_default && !group.deleted),
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn endpoints_build_paginated_urls() {
        let api = ApiEndpoints::new("https://acme.zendesk.com/");
        assert_eq!(
            api.snapshot_page(EntityKind::Groups, 2, 100).unwrap(),
            "https://acme.zendesk.com/api/v2/groups.json?page=2&per_page=100"
        );
        assert_eq!(
            api.snapshot_page(EntityKind::Agents, 1, 100).unwrap(),
            "https://acme.zendesk.com/api/v2/users.json\
             ?role[]=agent&role[]=admin&page=1&per_page=100"
        );
        assert!(api.snapshot_page(EntityKind::Tickets, 1, 100).is_err());
        assert_eq!(
            api.incremental_tickets(1_700_000_000, 1000),
            "https://acme.zendesk.com/api/v2/incremental/tickets.json\
             ?start_time=1700000000&per_page=1000&include=metric_sets"
        );
    }
}
