//! Calendar scheduling of recurring probe jobs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use mirrorprobe_core::{BoxFuture, ScheduleSpec};

use crate::error::{CollectorError, CollectorResult};

/// Work run on every matching tick.
pub type Job = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Identifies a scheduled job for cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle {
    pub id: u64,
    pub name: String,
}

/// Fires jobs on a [`ScheduleSpec`] until cancelled.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, name: &str, spec: &ScheduleSpec, job: Job) -> CollectorResult<JobHandle>;

    /// Stop a job. Ticks already running are left to finish.
    fn cancel(&self, handle: &JobHandle) -> bool;

    fn cancel_all(&self);
}

/// Next tick to fire. Never at or before the tick fired last, even when
/// the wall clock reads slightly behind the timer that woke us.
fn next_tick(
    spec: &ScheduleSpec,
    now: DateTime<Utc>,
    last_fired: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    let from = last_fired.map_or(now, |fired| fired.max(now));
    spec.next_after(from)
}

/// One tokio task per job. Each tick runs as its own task, so a slow tick
/// never delays the next one.
#[derive(Debug, Default)]
pub struct TokioScheduler {
    next_id: AtomicU64,
    jobs: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live jobs.
    pub fn len(&self) -> usize {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, name: &str, spec: &ScheduleSpec, job: Job) -> CollectorResult<JobHandle> {
        spec.validate().map_err(|e| CollectorError::Schedule {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let spec = spec.clone();
        let job_name = name.to_string();
        let task = tokio::spawn(async move {
            let mut last_fired = None;
            loop {
                let now = Utc::now();
                let Some(next) = next_tick(&spec, now, last_fired) else {
                    warn!(job = %job_name, %spec, "schedule has no upcoming tick, stopping");
                    break;
                };
                let wait = (next - now).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;
                debug!(job = %job_name, at = %next, "tick");
                tokio::spawn(job());
                last_fired = Some(next);
            }
        });

        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, task);
        Ok(JobHandle {
            id,
            name: name.to_string(),
        })
    }

    fn cancel(&self, handle: &JobHandle) -> bool {
        match self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.id)
        {
            Some(task) => {
                task.abort();
                debug!(job = %handle.name, "job cancelled");
                true
            }
            None => false,
        }
    }

    fn cancel_all(&self) {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, task) in jobs.drain() {
            task.abort();
        }
    }
}
