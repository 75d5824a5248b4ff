//! Registry of job definitions.
//!
//! The registry is an explicit object built once at startup and handed to the
//! host by reference; there is no process-global function table, so several
//! independent hosts can coexist in one process (which the tests rely on).

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{QuartzError, Result};

/// Ordering class for dispatch within one due-set batch.
///
/// `Normal` sorts before `High`; `LongRunning` is exempt from batch ordering
/// entirely because it bypasses the pooled workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Normal,
    High,
    LongRunning,
}

/// Error type job bodies report failure with.
pub type JobError = Box<dyn std::error::Error + Send + Sync>;

/// What the invocable sees about the occurrence it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub occurrence_id: Uuid,
    pub function_name: String,
    pub retry_count: u32,
    pub scheduled_for: DateTime<Utc>,
    /// True when the occurrence was reclaimed by the orphan sweep.
    pub recovered: bool,
}

pub type Invocable =
    Arc<dyn Fn(JobContext, CancellationToken) -> BoxFuture<'static, std::result::Result<(), JobError>> + Send + Sync>;

/// Retry budget and backoff ladder for one function.
///
/// A failed occurrence with retries remaining is re-materialized at
/// `now + backoff[retry_count]`; once the ladder is exhausted the last
/// interval keeps applying.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Vec<Duration>,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            retries: 0,
            backoff: Vec::new(),
        }
    }

    pub fn new(retries: u32, backoff: Vec<Duration>) -> Self {
        Self { retries, backoff }
    }

    /// Backoff for the given retry ordinal, clamped to the last interval.
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        if self.backoff.is_empty() {
            return Duration::from_secs(30);
        }
        let idx = (retry_count as usize).min(self.backoff.len() - 1);
        self.backoff[idx]
    }
}

/// One registered function: unique name, optional cron schedule (none means
/// one-shot only), priority class, retry policy, and the opaque body.
#[derive(Clone)]
pub struct JobDefinition {
    pub name: String,
    pub schedule: Option<Schedule>,
    pub priority: Priority,
    pub retry: RetryPolicy,
    pub invocable: Invocable,
}

impl std::fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDefinition")
            .field("name", &self.name)
            .field("recurring", &self.schedule.is_some())
            .field("priority", &self.priority)
            .field("retries", &self.retry.retries)
            .finish()
    }
}

impl JobDefinition {
    pub fn recurring(
        name: impl Into<String>,
        cron_expr: &str,
        priority: Priority,
        invocable: Invocable,
    ) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            schedule: Some(parse_cron(cron_expr)?),
            priority,
            retry: RetryPolicy::none(),
            invocable,
        })
    }

    pub fn one_shot(name: impl Into<String>, priority: Priority, invocable: Invocable) -> Self {
        Self {
            name: name.into(),
            schedule: None,
            priority,
            retry: RetryPolicy::none(),
            invocable,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Next firing of this definition's schedule at or after `after`.
    pub fn next_occurrence_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.as_ref().and_then(|s| s.after(&after).next())
    }
}

/// Parse a cron expression, accepting both the classic 5-field form and the
/// 6/7-field form the `cron` crate expects (a missing seconds field is
/// normalized to `0`).
pub fn parse_cron(expr: &str) -> Result<Schedule> {
    let trimmed = expr.trim();
    let fields = trimmed.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| QuartzError::InvalidCron {
        expression: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Immutable name -> definition table.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: HashMap<String, Arc<JobDefinition>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition. Duplicate names are rejected.
    pub fn register(&mut self, def: JobDefinition) -> Result<()> {
        if self.jobs.contains_key(&def.name) {
            return Err(QuartzError::DuplicateFunction(def.name));
        }
        self.jobs.insert(def.name.clone(), Arc::new(def));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<JobDefinition>> {
        self.jobs.get(name).cloned()
    }

    /// Definitions that carry a cron schedule, for the recurring planner.
    pub fn recurring(&self) -> impl Iterator<Item = &Arc<JobDefinition>> {
        self.jobs.values().filter(|d| d.schedule.is_some())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
