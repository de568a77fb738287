use std::fmt;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc, Weekday};
use deskpulse_core::{AggregationGrain, EntityKind};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::SyncEngine;

/// When a task fires. Fixed-time triggers are UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    Interval { seconds: u64 },
    Daily { hour: u32, minute: u32 },
    Weekly { weekday: Weekday, hour: u32, minute: u32 },
    Monthly { day: u32, hour: u32, minute: u32 },
}

impl Trigger {
    pub fn validate(&self) -> Result<()> {
        let (hour, minute) = match self {
            Trigger::Interval { seconds } => {
                if *seconds == 0 {
                    bail!("interval trigger needs a positive number of seconds");
                }
                return Ok(());
            }
            Trigger::Daily { hour, minute } | Trigger::Weekly { hour, minute, .. } => {
                (*hour, *minute)
            }
            Trigger::Monthly { day, hour, minute } => {
                if !(1..=28).contains(day) {
                    bail!("monthly trigger day must be between 1 and 28, got {day}");
                }
                (*hour, *minute)
            }
        };
        if hour > 23 || minute > 59 {
            bail!("invalid trigger time {hour:02}:{minute:02}");
        }
        Ok(())
    }

    /// Six-field cron expression (seconds first) for fixed-time triggers.
    pub fn cron_expression(&self) -> Option<String> {
        match self {
            Trigger::Interval { .. } => None,
            Trigger::Daily { hour, minute } => Some(format!("0 {minute} {hour} * * *")),
            Trigger::Weekly {
                weekday,
                hour,
                minute,
            } => Some(format!("0 {minute} {hour} * * {weekday}")),
            Trigger::Monthly { day, hour, minute } => {
                Some(format!("0 {minute} {hour} {day} * *"))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum TaskKind {
    Sync(EntityKind),
    Aggregate(AggregationGrain),
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Sync(entity) => write!(f, "sync:{entity}"),
            TaskKind::Aggregate(grain) => write!(f, "aggregate:{grain}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub name: String,
    pub task: TaskKind,
    pub trigger: Trigger,
}

impl ScheduledTask {
    pub fn new(name: impl Into<String>, task: TaskKind, trigger: Trigger) -> Self {
        Self {
            name: name.into(),
            task,
            trigger,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ScheduleFile {
    tasks: Vec<ScheduledTask>,
}

/// Tickets every 5 minutes, reference data hourly, rollups shortly after each
/// period closes.
pub fn default_schedule() -> Vec<ScheduledTask> {
    let every = |seconds| Trigger::Interval { seconds };
    vec![
        ScheduledTask::new("tickets", TaskKind::Sync(EntityKind::Tickets), every(300)),
        ScheduledTask::new(
            "organizations",
            TaskKind::Sync(EntityKind::Organizations),
            every(3600),
        ),
        ScheduledTask::new("agents", TaskKind::Sync(EntityKind::Agents), every(3600)),
        ScheduledTask::new("groups", TaskKind::Sync(EntityKind::Groups), every(3600)),
        ScheduledTask::new(
            "daily-rollup",
            TaskKind::Aggregate(AggregationGrain::Daily),
            Trigger::Daily { hour: 1, minute: 0 },
        ),
        ScheduledTask::new(
            "weekly-rollup",
            TaskKind::Aggregate(AggregationGrain::Weekly),
            Trigger::Weekly {
                weekday: Weekday::Mon,
                hour: 2,
                minute: 0,
            },
        ),
        ScheduledTask::new(
            "monthly-rollup",
            TaskKind::Aggregate(AggregationGrain::Monthly),
            Trigger::Monthly {
                day: 1,
                hour: 3,
                minute: 0,
            },
        ),
    ]
}

pub fn load_schedule(path: &Path) -> Result<Vec<ScheduledTask>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let file: ScheduleFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    for task in &file.tasks {
        task.trigger
            .validate()
            .with_context(|| format!("task {} in {}", task.name, path.display()))?;
    }
    Ok(file.tasks)
}

/// Runs one task to completion. Aggregations target the last fully elapsed period.
pub async fn run_task(engine: &SyncEngine, task: TaskKind, today: NaiveDate) -> Result<()> {
    match task {
        TaskKind::Sync(entity) => engine.sync(entity).await.map(|_| ()),
        TaskKind::Aggregate(grain) => engine
            .aggregate(grain, grain.previous_period(today))
            .await
            .map(|_| ()),
    }
}

async fn run_logged(engine: &SyncEngine, name: &str, task: TaskKind) {
    if let Err(err) = run_task(engine, task, Utc::now().date_naive()).await {
        error!(task = name, kind = %task, error = %format!("{err:#}"), "scheduled task failed");
    }
}

pub fn startup_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Periodic runner over (task, trigger) pairs.
pub struct Scheduler {
    engine: Arc<SyncEngine>,
    tasks: Vec<ScheduledTask>,
    max_startup_jitter: Duration,
}

impl Scheduler {
    pub fn new(
        engine: Arc<SyncEngine>,
        tasks: Vec<ScheduledTask>,
        max_startup_jitter: Duration,
    ) -> Self {
        Self {
            engine,
            tasks,
            max_startup_jitter,
        }
    }

    pub fn tasks(&self) -> &[ScheduledTask] {
        &self.tasks
    }

    /// Syncs every entity once. Failures are logged and do not stop the pass.
    pub async fn initial_pass(&self) {
        for entity in EntityKind::ALL {
            run_logged(&self.engine, entity.as_str(), TaskKind::Sync(entity)).await;
        }
    }

    /// Waits a random jitter, runs the initial pass, then registers and starts every job.
    /// The returned scheduler keeps running until shut down.
    pub async fn start(self) -> Result<JobScheduler> {
        let jitter = startup_jitter(self.max_startup_jitter);
        info!(jitter_ms = jitter.as_millis() as u64, "delaying first sync pass");
        tokio::time::sleep(jitter).await;
        self.initial_pass().await;

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for task in &self.tasks {
            task.trigger
                .validate()
                .with_context(|| format!("invalid trigger for task {}", task.name))?;
            let job = build_job(self.engine.clone(), task)
                .with_context(|| format!("creating scheduler job for task {}", task.name))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        sched.start().await.context("starting scheduler")?;
        info!(tasks = self.tasks.len(), "scheduler started");
        Ok(sched)
    }
}

type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn job_run(engine: Arc<SyncEngine>, name: String, kind: TaskKind) -> JobFuture {
    Box::pin(async move {
        run_logged(&engine, &name, kind).await;
    })
}

fn build_job(engine: Arc<SyncEngine>, task: &ScheduledTask) -> Result<Job> {
    let name = task.name.clone();
    let kind = task.task;
    let job = match task.trigger.cron_expression() {
        None => {
            let Trigger::Interval { seconds } = task.trigger else {
                bail!("trigger for task {} has no schedule", task.name);
            };
            Job::new_repeated_async(Duration::from_secs(seconds), move |_uuid, _l| {
                job_run(engine.clone(), name.clone(), kind)
            })?
        }
        Some(cron) => Job::new_async(cron.as_str(), move |_uuid, _l| {
            job_run(engine.clone(), name.clone(), kind)
        })?,
    };
    Ok(job)
}
