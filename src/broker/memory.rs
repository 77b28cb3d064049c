//! In-memory broker for tests and local development.
//!
//! `MemoryBroker` keeps every queue in process memory behind a single
//! `RwLock`. Time comes from a [`Clock`] built on `tokio::time`, so tests that
//! run with a paused runtime (`#[tokio::test(start_paused = true)]`) see
//! delays, backoff and lock expiry play out instantly and deterministically.
//!
//! # Examples
//!
//! ```rust
//! use bellwork::broker::{Broker, memory::MemoryBroker};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> bellwork::Result<()> {
//! let broker = MemoryBroker::new();
//! assert!(broker.claim("test-default", Duration::from_secs(30)).await?.is_none());
//! # Ok(())
//! # }
//! ```

use crate::{
    QueueError, Result,
    broker::{Broker, JobCounts, LOCK_EXPIRED, Retention, STALLED_TOO_MANY_TIMES, StalledJobs},
    job::{Job, JobId, JobState},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Wall clock that advances with `tokio::time`.
///
/// Outside a paused runtime this tracks real time; inside one it jumps
/// forward whenever the runtime auto-advances.
#[derive(Clone, Debug)]
pub struct Clock {
    origin_wall: DateTime<Utc>,
    origin: tokio::time::Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin_wall: Utc::now(),
            origin: tokio::time::Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.origin_wall + elapsed
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct QueueStore {
    next_id: u64,
    jobs: HashMap<JobId, Job>,
    logs: HashMap<JobId, Vec<String>>,
    /// Newest first
    completed: VecDeque<JobId>,
    /// Newest first
    failed: VecDeque<JobId>,
}

impl QueueStore {
    fn active_job_mut(&mut self, job_id: &str, token: &str) -> Result<&mut Job> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::JobNotFound {
                id: job_id.to_string(),
            })?;

        if job.state != JobState::Active || job.lock_token.as_deref() != Some(token) {
            return Err(QueueError::LockLost {
                id: job_id.to_string(),
            });
        }

        Ok(job)
    }

    fn forget(&mut self, job_id: &str) {
        self.jobs.remove(job_id);
        self.logs.remove(job_id);
    }

    fn trim_completed(&mut self, keep: usize) {
        while self.completed.len() > keep {
            if let Some(old) = self.completed.pop_back() {
                self.forget(&old);
            }
        }
    }

    fn trim_failed(&mut self, keep: usize) {
        while self.failed.len() > keep {
            if let Some(old) = self.failed.pop_back() {
                self.forget(&old);
            }
        }
    }

    /// Oldest eligible job by ready time, then by id.
    fn next_ready(&self, now: DateTime<Utc>) -> Option<JobId> {
        self.jobs
            .values()
            .filter(|job| matches!(job.state, JobState::Waiting | JobState::Delayed))
            .filter(|job| job.ready_at <= now)
            .min_by_key(|job| (job.ready_at, job.id.parse::<u64>().unwrap_or(u64::MAX)))
            .map(|job| job.id.clone())
    }
}

/// Broker that keeps all jobs in process memory.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    queues: Arc<RwLock<HashMap<String, QueueStore>>>,
    clock: Clock,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share a clock with other test components.
    pub fn with_clock(clock: Clock) -> Self {
        Self {
            queues: Arc::default(),
            clock,
        }
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Every job currently stored for a queue, in id order.
    pub async fn jobs(&self, queue_name: &str) -> Vec<Job> {
        let queues = self.queues.read().await;
        let mut jobs: Vec<Job> = queues
            .get(queue_name)
            .map(|store| store.jobs.values().cloned().collect())
            .unwrap_or_default();
        jobs.sort_by_key(|job| job.id.parse::<u64>().unwrap_or(u64::MAX));
        jobs
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::MAX)
}

#[async_trait]
impl Broker for MemoryBroker {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn enqueue(&self, mut job: Job) -> Result<JobId> {
        let now = self.clock.now();
        let mut queues = self.queues.write().await;
        let store = queues.entry(job.queue_name.clone()).or_default();

        store.next_id += 1;
        job.id = store.next_id.to_string();
        job.state = if job.ready_at > now {
            JobState::Delayed
        } else {
            JobState::Waiting
        };
        job.lock_token = None;
        job.locked_until = None;

        let id = job.id.clone();
        store.jobs.insert(id.clone(), job);
        Ok(id)
    }

    async fn claim(&self, queue_name: &str, lock_duration: Duration) -> Result<Option<Job>> {
        let now = self.clock.now();
        let mut queues = self.queues.write().await;
        let Some(store) = queues.get_mut(queue_name) else {
            return Ok(None);
        };

        let Some(job_id) = store.next_ready(now) else {
            return Ok(None);
        };

        let job = store
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| QueueError::JobNotFound { id: job_id.clone() })?;
        job.state = JobState::Active;
        job.started_at = Some(now);
        job.lock_token = Some(Uuid::new_v4().to_string());
        job.locked_until = Some(now + chrono_duration(lock_duration));

        Ok(Some(job.clone()))
    }

    async fn extend_lock(
        &self,
        queue_name: &str,
        job_id: &str,
        token: &str,
        lock_duration: Duration,
    ) -> Result<bool> {
        let now = self.clock.now();
        let mut queues = self.queues.write().await;
        let Some(store) = queues.get_mut(queue_name) else {
            return Ok(false);
        };

        match store.active_job_mut(job_id, token) {
            Ok(job) => {
                job.locked_until = Some(now + chrono_duration(lock_duration));
                Ok(true)
            }
            Err(QueueError::LockLost { .. }) | Err(QueueError::JobNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn complete(
        &self,
        queue_name: &str,
        job_id: &str,
        token: &str,
        retention: &Retention,
    ) -> Result<()> {
        let now = self.clock.now();
        let mut queues = self.queues.write().await;
        let store = queues
            .get_mut(queue_name)
            .ok_or_else(|| QueueError::JobNotFound {
                id: job_id.to_string(),
            })?;

        let job = store.active_job_mut(job_id, token)?;
        job.state = JobState::Completed;
        job.finished_at = Some(now);
        job.lock_token = None;
        job.locked_until = None;

        store.completed.push_front(job_id.to_string());
        store.trim_completed(retention.keep_completed);
        Ok(())
    }

    async fn retry(
        &self,
        queue_name: &str,
        job_id: &str,
        token: &str,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut queues = self.queues.write().await;
        let store = queues
            .get_mut(queue_name)
            .ok_or_else(|| QueueError::JobNotFound {
                id: job_id.to_string(),
            })?;

        let job = store.active_job_mut(job_id, token)?;
        job.state = JobState::Delayed;
        job.attempts_made += 1;
        job.failed_reason = Some(error.to_string());
        job.ready_at = retry_at;
        job.lock_token = None;
        job.locked_until = None;
        Ok(())
    }

    async fn fail(
        &self,
        queue_name: &str,
        job_id: &str,
        token: &str,
        error: &str,
        retention: &Retention,
    ) -> Result<()> {
        let now = self.clock.now();
        let mut queues = self.queues.write().await;
        let store = queues
            .get_mut(queue_name)
            .ok_or_else(|| QueueError::JobNotFound {
                id: job_id.to_string(),
            })?;

        let job = store.active_job_mut(job_id, token)?;
        job.state = JobState::Failed;
        job.attempts_made += 1;
        job.failed_reason = Some(error.to_string());
        job.finished_at = Some(now);
        job.lock_token = None;
        job.locked_until = None;

        store.failed.push_front(job_id.to_string());
        store.trim_failed(retention.keep_failed);
        Ok(())
    }

    async fn remove(&self, queue_name: &str, job_id: &str) -> Result<bool> {
        let mut queues = self.queues.write().await;
        let Some(store) = queues.get_mut(queue_name) else {
            return Ok(false);
        };

        match store.jobs.get(job_id).map(|job| job.state) {
            None => Ok(false),
            Some(JobState::Active) => Err(QueueError::JobActive {
                id: job_id.to_string(),
            }),
            Some(_) => {
                store.completed.retain(|id| id != job_id);
                store.failed.retain(|id| id != job_id);
                store.forget(job_id);
                Ok(true)
            }
        }
    }

    async fn get_job(&self, queue_name: &str, job_id: &str) -> Result<Option<Job>> {
        let now = self.clock.now();
        let queues = self.queues.read().await;
        let job = queues
            .get(queue_name)
            .and_then(|store| store.jobs.get(job_id))
            .cloned()
            .map(|mut job| {
                if job.state == JobState::Delayed && job.ready_at <= now {
                    job.state = JobState::Waiting;
                }
                job
            });
        Ok(job)
    }

    async fn add_log(&self, queue_name: &str, job_id: &str, line: &str) -> Result<()> {
        let mut queues = self.queues.write().await;
        let store = queues
            .get_mut(queue_name)
            .filter(|store| store.jobs.contains_key(job_id))
            .ok_or_else(|| QueueError::JobNotFound {
                id: job_id.to_string(),
            })?;

        store
            .logs
            .entry(job_id.to_string())
            .or_default()
            .push(line.to_string());
        Ok(())
    }

    async fn get_logs(&self, queue_name: &str, job_id: &str) -> Result<Vec<String>> {
        let queues = self.queues.read().await;
        Ok(queues
            .get(queue_name)
            .and_then(|store| store.logs.get(job_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn recover_stalled(
        &self,
        queue_name: &str,
        retention: &Retention,
    ) -> Result<StalledJobs> {
        let now = self.clock.now();
        let mut queues = self.queues.write().await;
        let Some(store) = queues.get_mut(queue_name) else {
            return Ok(StalledJobs::default());
        };

        let mut stalled = StalledJobs::default();
        for job in store.jobs.values_mut() {
            let expired = job.locked_until.is_some_and(|until| until < now);
            if job.state != JobState::Active || !expired {
                continue;
            }

            job.attempts_made += 1;
            job.lock_token = None;
            job.locked_until = None;

            if job.attempts_made >= job.max_attempts {
                job.state = JobState::Failed;
                job.finished_at = Some(now);
                job.failed_reason = Some(STALLED_TOO_MANY_TIMES.to_string());
                stalled.failed.push(job.id.clone());
            } else {
                job.state = JobState::Waiting;
                job.ready_at = now;
                job.failed_reason = Some(LOCK_EXPIRED.to_string());
                stalled.recovered.push(job.id.clone());
            }
        }

        let numeric = |id: &JobId| id.parse::<u64>().unwrap_or(u64::MAX);
        stalled.recovered.sort_by_key(numeric);
        stalled.failed.sort_by_key(numeric);

        for id in &stalled.failed {
            store.failed.push_front(id.clone());
        }
        store.trim_failed(retention.keep_failed);

        Ok(stalled)
    }

    async fn job_counts(&self, queue_name: &str) -> Result<JobCounts> {
        let now = self.clock.now();
        let queues = self.queues.read().await;
        let mut counts = JobCounts::default();

        if let Some(store) = queues.get(queue_name) {
            for job in store.jobs.values() {
                match job.state {
                    JobState::Waiting | JobState::Delayed if job.ready_at > now => {
                        counts.delayed += 1
                    }
                    JobState::Waiting | JobState::Delayed => counts.waiting += 1,
                    JobState::Active => counts.active += 1,
                    JobState::Completed => counts.completed += 1,
                    JobState::Failed => counts.failed += 1,
                }
            }
        }

        Ok(counts)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Backoff;
    use serde_json::json;

    const QUEUE: &str = "test-default";
    const LOCK: Duration = Duration::from_secs(30);

    fn job_at(broker: &MemoryBroker, delay: Duration) -> Job {
        let now = broker.now();
        Job {
            id: JobId::new(),
            queue_name: QUEUE.to_string(),
            name: "user.reminder".to_string(),
            data: json!({"type": "user.reminder"}),
            state: JobState::Waiting,
            attempts_made: 0,
            max_attempts: 3,
            backoff: Backoff::default(),
            repeat: None,
            created_at: now,
            ready_at: now + chrono_duration(delay),
            started_at: None,
            finished_at: None,
            failed_reason: None,
            lock_token: None,
            locked_until: None,
        }
    }

    #[tokio::test]
    async fn test_ids_are_sequential_per_queue() {
        let broker = MemoryBroker::new();
        let first = broker.enqueue(job_at(&broker, Duration::ZERO)).await.unwrap();
        let second = broker.enqueue(job_at(&broker, Duration::ZERO)).await.unwrap();

        assert_eq!(first, "1");
        assert_eq!(second, "2");
    }

    #[tokio::test]
    async fn test_claim_order_and_lock() {
        let broker = MemoryBroker::new();
        let first = broker.enqueue(job_at(&broker, Duration::ZERO)).await.unwrap();
        let second = broker.enqueue(job_at(&broker, Duration::ZERO)).await.unwrap();

        let claimed = broker.claim(QUEUE, LOCK).await.unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.state, JobState::Active);
        assert!(claimed.lock_token.is_some());

        let claimed = broker.claim(QUEUE, LOCK).await.unwrap().unwrap();
        assert_eq!(claimed.id, second);
        assert!(broker.claim(QUEUE, LOCK).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_job_not_claimable_early() {
        let broker = MemoryBroker::new();
        let id = broker
            .enqueue(job_at(&broker, Duration::from_secs(2)))
            .await
            .unwrap();

        let job = broker.get_job(QUEUE, &id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Delayed);
        assert!(broker.claim(QUEUE, LOCK).await.unwrap().is_none());

        tokio::time::advance(Duration::from_millis(2001)).await;
        let job = broker.claim(QUEUE, LOCK).await.unwrap().unwrap();
        assert_eq!(job.id, id);
    }

    #[tokio::test]
    async fn test_complete_requires_lock_token() {
        let broker = MemoryBroker::new();
        broker.enqueue(job_at(&broker, Duration::ZERO)).await.unwrap();
        let job = broker.claim(QUEUE, LOCK).await.unwrap().unwrap();

        let result = broker
            .complete(QUEUE, &job.id, "not-the-token", &Retention::default())
            .await;
        assert!(matches!(result, Err(QueueError::LockLost { .. })));

        let token = job.lock_token.clone().unwrap();
        broker
            .complete(QUEUE, &job.id, &token, &Retention::default())
            .await
            .unwrap();
        let done = broker.get_job(QUEUE, &job.id).await.unwrap().unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert!(done.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_retry_then_fail() {
        let broker = MemoryBroker::new();
        broker.enqueue(job_at(&broker, Duration::ZERO)).await.unwrap();

        let job = broker.claim(QUEUE, LOCK).await.unwrap().unwrap();
        let token = job.lock_token.clone().unwrap();
        let retry_at = broker.now() + chrono::Duration::seconds(5);
        broker
            .retry(QUEUE, &job.id, &token, "smtp timeout", retry_at)
            .await
            .unwrap();

        let parked = broker.get_job(QUEUE, &job.id).await.unwrap().unwrap();
        assert_eq!(parked.state, JobState::Delayed);
        assert_eq!(parked.attempts_made, 1);
        assert_eq!(parked.failed_reason.as_deref(), Some("smtp timeout"));
        assert!(broker.claim(QUEUE, LOCK).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retention_trims_oldest_completed() {
        let broker = MemoryBroker::new();
        let retention = Retention {
            keep_completed: 2,
            keep_failed: 1,
        };

        let mut ids = Vec::new();
        for _ in 0..3 {
            broker.enqueue(job_at(&broker, Duration::ZERO)).await.unwrap();
            let job = broker.claim(QUEUE, LOCK).await.unwrap().unwrap();
            let token = job.lock_token.clone().unwrap();
            broker.complete(QUEUE, &job.id, &token, &retention).await.unwrap();
            ids.push(job.id);
        }

        assert!(broker.get_job(QUEUE, &ids[0]).await.unwrap().is_none());
        assert!(broker.get_job(QUEUE, &ids[1]).await.unwrap().is_some());
        assert_eq!(broker.job_counts(QUEUE).await.unwrap().completed, 2);
    }

    #[tokio::test]
    async fn test_remove_semantics() {
        let broker = MemoryBroker::new();
        let waiting = broker.enqueue(job_at(&broker, Duration::from_secs(60))).await.unwrap();
        let active = broker.enqueue(job_at(&broker, Duration::ZERO)).await.unwrap();
        broker.claim(QUEUE, LOCK).await.unwrap();

        assert!(broker.remove(QUEUE, &waiting).await.unwrap());
        assert!(!broker.remove(QUEUE, &waiting).await.unwrap());
        assert!(matches!(
            broker.remove(QUEUE, &active).await,
            Err(QueueError::JobActive { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_stalled() {
        let broker = MemoryBroker::new();
        let id = broker.enqueue(job_at(&broker, Duration::ZERO)).await.unwrap();
        let job = broker.claim(QUEUE, Duration::from_secs(1)).await.unwrap().unwrap();

        let retention = Retention::default();
        assert!(broker.recover_stalled(QUEUE, &retention).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        let stalled = broker.recover_stalled(QUEUE, &retention).await.unwrap();
        assert_eq!(stalled.recovered, vec![id.clone()]);
        assert!(stalled.failed.is_empty());

        let token = job.lock_token.unwrap();
        assert!(!broker.extend_lock(QUEUE, &id, &token, LOCK).await.unwrap());

        let again = broker.claim(QUEUE, LOCK).await.unwrap().unwrap();
        assert_eq!(again.id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalling_uses_up_attempts() {
        let broker = MemoryBroker::new();
        let retention = Retention::default();
        let id = broker.enqueue(job_at(&broker, Duration::ZERO)).await.unwrap();

        for stall in 1..=2 {
            broker.claim(QUEUE, LOCK).await.unwrap().unwrap();
            tokio::time::advance(LOCK + Duration::from_secs(1)).await;
            let stalled = broker.recover_stalled(QUEUE, &retention).await.unwrap();
            assert_eq!(stalled.recovered, vec![id.clone()]);

            let job = broker.get_job(QUEUE, &id).await.unwrap().unwrap();
            assert_eq!(job.state, JobState::Waiting);
            assert_eq!(job.attempts_made, stall);
            assert_eq!(job.failed_reason.as_deref(), Some(LOCK_EXPIRED));
        }

        broker.claim(QUEUE, LOCK).await.unwrap().unwrap();
        tokio::time::advance(LOCK + Duration::from_secs(1)).await;
        let stalled = broker.recover_stalled(QUEUE, &retention).await.unwrap();
        assert!(stalled.recovered.is_empty());
        assert_eq!(stalled.failed, vec![id.clone()]);

        let job = broker.get_job(QUEUE, &id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts_made, 3);
        assert_eq!(job.failed_reason.as_deref(), Some(STALLED_TOO_MANY_TIMES));
        assert!(job.lock_token.is_none());

        let counts = broker.job_counts(QUEUE).await.unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.active, 0);
        assert!(broker.claim(QUEUE, LOCK).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_logs() {
        let broker = MemoryBroker::new();
        let id = broker.enqueue(job_at(&broker, Duration::ZERO)).await.unwrap();

        broker.add_log(QUEUE, &id, "first").await.unwrap();
        broker.add_log(QUEUE, &id, "second").await.unwrap();
        assert_eq!(broker.get_logs(QUEUE, &id).await.unwrap(), vec!["first", "second"]);

        assert!(broker.add_log(QUEUE, "999", "nope").await.is_err());
    }
}
