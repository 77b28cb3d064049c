//! Durable job storage behind the queue service.
//!
//! The [`Broker`] trait holds the storage primitives the service and its
//! workers are written against. Two backends ship with the crate:
//!
//! - [`redis::RedisBroker`] (feature `redis`, on by default) for production,
//! - [`memory::MemoryBroker`] for tests and local development.
//!
//! Brokers own job state transitions and retention; the retry decision and
//! event emission live in the worker.

use crate::{
    Result,
    job::{Job, JobId},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

/// Number of jobs in each state for one queue.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobCounts {
    /// Jobs that still have work ahead of them.
    pub fn pending(&self) -> u64 {
        self.waiting + self.delayed + self.active
    }
}

/// Failure reason recorded on a job whose lock expired on its last attempt.
pub const STALLED_TOO_MANY_TIMES: &str = "Job stalled too many times";

/// Failure reason recorded on a job whose lock expired with attempts left.
pub const LOCK_EXPIRED: &str = "Job lock expired";

/// Result of one stall sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StalledJobs {
    /// Moved back to waiting
    pub recovered: Vec<JobId>,
    /// Out of attempts, moved to failed
    pub failed: Vec<JobId>,
}

impl StalledJobs {
    pub fn is_empty(&self) -> bool {
        self.recovered.is_empty() && self.failed.is_empty()
    }
}

/// How many finished jobs a queue keeps around for inspection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Retention {
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            keep_completed: 1000,
            keep_failed: 500,
        }
    }
}

/// Storage operations for queued jobs.
///
/// All queue names are fully qualified (`{env}-{name}`). Operations that
/// finish or extend an active job take the lock token handed out by
/// [`claim`](Broker::claim); a mismatched token means the lock expired and
/// the job was handed to someone else, reported as `QueueError::LockLost`.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Current time as the broker sees it. Ready times are compared against
    /// this clock.
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Persist a new job and return the id the broker assigned to it.
    async fn enqueue(&self, job: Job) -> Result<JobId>;

    /// Take the next eligible job and lock it for `lock_duration`.
    async fn claim(&self, queue_name: &str, lock_duration: Duration) -> Result<Option<Job>>;

    /// Push an active job's lock deadline forward. Returns false when the
    /// caller no longer owns the lock.
    async fn extend_lock(
        &self,
        queue_name: &str,
        job_id: &str,
        token: &str,
        lock_duration: Duration,
    ) -> Result<bool>;

    /// Mark an active job completed, trimming old completed jobs.
    async fn complete(
        &self,
        queue_name: &str,
        job_id: &str,
        token: &str,
        retention: &Retention,
    ) -> Result<()>;

    /// Record a failed attempt and park the job until `retry_at`.
    async fn retry(
        &self,
        queue_name: &str,
        job_id: &str,
        token: &str,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Record the final failed attempt, trimming old failed jobs.
    async fn fail(
        &self,
        queue_name: &str,
        job_id: &str,
        token: &str,
        error: &str,
        retention: &Retention,
    ) -> Result<()>;

    /// Delete a job that is not active. `Ok(false)` when it no longer exists.
    async fn remove(&self, queue_name: &str, job_id: &str) -> Result<bool>;

    async fn get_job(&self, queue_name: &str, job_id: &str) -> Result<Option<Job>>;

    /// Append a line to a job's log.
    async fn add_log(&self, queue_name: &str, job_id: &str, line: &str) -> Result<()>;

    async fn get_logs(&self, queue_name: &str, job_id: &str) -> Result<Vec<String>>;

    /// Handle active jobs whose lock expired. Each stall counts as an
    /// attempt: jobs with attempts left go back to waiting, the rest fail
    /// with [`STALLED_TOO_MANY_TIMES`].
    async fn recover_stalled(
        &self,
        queue_name: &str,
        retention: &Retention,
    ) -> Result<StalledJobs>;

    async fn job_counts(&self, queue_name: &str) -> Result<JobCounts>;

    /// Release connections. Safe to call more than once.
    async fn close(&self) -> Result<()>;
}
