use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use deskpulse_core::{
    AggregationGrain, Rollup, RollupKey, RollupMetrics, SlaPolicy, Ticket, TouchBucket,
};
use deskpulse_storage::{AggregationStore, RecordStore};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Serialize)]
pub struct AggregationOutcome {
    pub grain: AggregationGrain,
    pub period_start: NaiveDate,
    pub tickets_considered: usize,
    pub rows_written: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackfillSummary {
    pub days: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub rows_written: u64,
}

#[derive(Debug, Default)]
struct Accumulator {
    metrics: RollupMetrics,
    first_reply_sum: i64,
    first_reply_count: i64,
    full_resolution_sum: i64,
    full_resolution_count: i64,
}

impl Accumulator {
    fn finish(mut self) -> RollupMetrics {
        self.metrics.avg_first_reply_minutes =
            average(self.first_reply_sum, self.first_reply_count);
        self.metrics.avg_full_resolution_minutes =
            average(self.full_resolution_sum, self.full_resolution_count);
        self.metrics
    }
}

fn average(sum: i64, count: i64) -> Option<f64> {
    if count == 0 {
        return None;
    }
    let avg = sum as f64 / count as f64;
    Some((avg * 100.0).round() / 100.0)
}

/// Rolls tickets up for one period. Pure: tickets are visited in id order and rows come back
/// sorted by key, so the same input always yields the same rows.
///
/// Attribution per ticket:
/// - created, first reply average and SLA: tickets created in the period
/// - solved, resolution average, touch buckets and logged minutes: tickets solved in the period
/// - closed and reopened: tickets last updated in the period
pub fn compute_rollups(
    grain: AggregationGrain,
    period_start: NaiveDate,
    tickets: &[Ticket],
    sla: &SlaPolicy,
) -> Vec<Rollup> {
    let period_start = grain.period_start(period_start);
    let (start, end) = grain.window(period_start);
    let within = |ts: DateTime<Utc>| ts >= start && ts < end;

    let mut ordered: Vec<&Ticket> = tickets.iter().collect();
    ordered.sort_by_key(|t| t.id);

    let mut groups: BTreeMap<RollupKey, Accumulator> = BTreeMap::new();
    for ticket in ordered {
        let created = within(ticket.created_at);
        let solved = ticket.solved_at().is_some_and(within);
        let updated = within(ticket.updated_at);
        if !(created || solved || updated) {
            continue;
        }

        let acc = groups
            .entry(RollupKey::for_ticket(grain, period_start, ticket))
            .or_default();
        let metrics = ticket.metrics.as_ref();

        if created {
            acc.metrics.tickets_created += 1;
            if let Some(reply) = metrics.and_then(|m| m.reply_time_minutes) {
                acc.first_reply_sum += reply;
                acc.first_reply_count += 1;
                if sla.is_met(ticket.priority.as_deref(), reply) {
                    acc.metrics.sla_met += 1;
                } else {
                    acc.metrics.sla_breached += 1;
                }
            }
        }

        if solved {
            acc.metrics.tickets_solved += 1;
            if let Some(full) = metrics.and_then(|m| m.full_resolution_time_minutes) {
                acc.full_resolution_sum += full;
                acc.full_resolution_count += 1;
            }
            match TouchBucket::from_replies(ticket.replies()) {
                TouchBucket::One => acc.metrics.one_touch += 1,
                TouchBucket::Two => acc.metrics.two_touch += 1,
                TouchBucket::Multi => acc.metrics.multi_touch += 1,
            }
            acc.metrics.total_minutes += ticket.time_spent_minutes.unwrap_or(0);
            acc.metrics.billable_minutes += ticket.billable_minutes.unwrap_or(0);
        }

        if updated {
            if ticket.is_closed() {
                acc.metrics.tickets_closed += 1;
            }
            if ticket.reopens() > 0 {
                acc.metrics.tickets_reopened += 1;
            }
        }
    }

    groups
        .into_iter()
        .map(|(key, acc)| Rollup {
            key,
            metrics: acc.finish(),
        })
        .collect()
}

pub struct Aggregator {
    records: Arc<dyn RecordStore>,
    rollups: Arc<dyn AggregationStore>,
    sla: SlaPolicy,
}

impl Aggregator {
    pub fn new(
        records: Arc<dyn RecordStore>,
        rollups: Arc<dyn AggregationStore>,
        sla: SlaPolicy,
    ) -> Self {
        Self {
            records,
            rollups,
            sla,
        }
    }

    /// Recomputes the period containing `date`. Safe to repeat: rows for the period are
    /// replaced, and the run-log row is reused.
    pub async fn run(
        &self,
        grain: AggregationGrain,
        date: NaiveDate,
    ) -> Result<AggregationOutcome> {
        let period_start = grain.period_start(date);
        let span = info_span!("aggregate", grain = %grain, period = %period_start);
        async move {
            self.rollups
                .begin_aggregation(grain, period_start)
                .await
                .context("opening aggregation log")?;

            match self.compute_and_store(grain, period_start).await {
                Ok(outcome) => {
                    info!(
                        tickets = outcome.tickets_considered,
                        rows = outcome.rows_written,
                        "aggregation complete"
                    );
                    Ok(outcome)
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    error!(error = %message, "aggregation failed");
                    if let Err(log_err) = self
                        .rollups
                        .fail_aggregation(grain, period_start, &message)
                        .await
                    {
                        error!(error = %log_err, "failed to record aggregation error");
                    }
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn compute_and_store(
        &self,
        grain: AggregationGrain,
        period_start: NaiveDate,
    ) -> Result<AggregationOutcome> {
        let (start, end) = grain.window(period_start);
        let tickets = self
            .records
            .tickets_touching(start, end)
            .await
            .context("loading tickets for period")?;
        let rows = compute_rollups(grain, period_start, &tickets, &self.sla);
        let rows_written = self
            .rollups
            .replace_rollups(grain, period_start, &rows)
            .await
            .context("writing rollups")?;
        self.rollups
            .complete_aggregation(grain, period_start, rows_written as i64)
            .await
            .context("closing aggregation log")?;
        Ok(AggregationOutcome {
            grain,
            period_start,
            tickets_considered: tickets.len(),
            rows_written,
        })
    }

    /// Daily aggregation for every day in `[from, to]`. A failed day is logged and the
    /// backfill moves on.
    pub async fn backfill(&self, from: NaiveDate, to: NaiveDate) -> Result<BackfillSummary> {
        if from > to {
            bail!("backfill range is empty: {from} is after {to}");
        }
        let mut summary = BackfillSummary::default();
        for day in from.iter_days().take_while(|d| *d <= to) {
            summary.days += 1;
            match self.run(AggregationGrain::Daily, day).await {
                Ok(outcome) => {
                    summary.succeeded += 1;
                    summary.rows_written += outcome.rows_written;
                }
                Err(err) => {
                    summary.failed += 1;
                    warn!(%day, error = %format!("{err:#}"), "backfill day failed; continuing");
                }
            }
        }
        info!(
            days = summary.days,
            failed = summary.failed,
            rows = summary.rows_written,
            "backfill complete"
        );
        Ok(summary)
    }
}
