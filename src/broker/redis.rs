//! Redis-backed broker.
//!
//! Every queue lives under the `bellwork:{queue}:` key prefix:
//!
//! | key              | type | contents                                        |
//! |------------------|------|-------------------------------------------------|
//! | `id`             | str  | counter for job ids                             |
//! | `job:{id}`       | hash | one job, payload stored as a JSON string        |
//! | `wait`           | zset | waiting and delayed job ids scored by ready ms  |
//! | `active`         | zset | locked job ids scored by lock deadline ms       |
//! | `completed`      | list | finished job ids, newest first                  |
//! | `failed`         | list | failed job ids, newest first                    |
//! | `logs:{id}`      | list | handler log lines                               |
//!
//! State transitions that must be atomic run as Lua scripts. The connection
//! is opened lazily on first use, so a broker built from an unreachable or
//! placeholder URL only fails once something actually talks to it. Once open
//! it is a [`ConnectionManager`], which reconnects after the server drops it.

use crate::{
    QueueError, Result,
    broker::{Broker, JobCounts, LOCK_EXPIRED, Retention, STALLED_TOO_MANY_TIMES, StalledJobs},
    config::ConnectionConfig,
    job::{Job, JobId, JobState, Repeat},
    retry::Backoff,
};
use ::redis::{AsyncCommands, Client, Script, aio::ConnectionManager};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

const KEY_PREFIX: &str = "bellwork";

const CLAIM_LUA: &str = include_str!("lua/claim.lua");
const EXTEND_LOCK_LUA: &str = include_str!("lua/extend_lock.lua");
const FINISH_LUA: &str = include_str!("lua/finish.lua");
const RETRY_LUA: &str = include_str!("lua/retry.lua");
const RECOVER_STALLED_LUA: &str = include_str!("lua/recover_stalled.lua");
const REMOVE_LUA: &str = include_str!("lua/remove.lua");

/// Key names for one queue.
struct Keys {
    prefix: String,
}

impl Keys {
    fn new(queue_name: &str) -> Self {
        Self {
            prefix: format!("{}:{}:", KEY_PREFIX, queue_name),
        }
    }

    fn id(&self) -> String {
        format!("{}id", self.prefix)
    }

    fn job(&self, id: &str) -> String {
        format!("{}job:{}", self.prefix, id)
    }

    fn logs(&self, id: &str) -> String {
        format!("{}logs:{}", self.prefix, id)
    }

    fn wait(&self) -> String {
        format!("{}wait", self.prefix)
    }

    fn active(&self) -> String {
        format!("{}active", self.prefix)
    }

    fn completed(&self) -> String {
        format!("{}completed", self.prefix)
    }

    fn failed(&self) -> String {
        format!("{}failed", self.prefix)
    }
}

/// Broker storing jobs in Redis.
pub struct RedisBroker {
    client: Client,
    redacted_url: String,
    /// Created on first use; reconnects on its own after the link drops
    conn: Mutex<Option<ConnectionManager>>,
    claim_script: Script,
    extend_lock_script: Script,
    finish_script: Script,
    retry_script: Script,
    recover_stalled_script: Script,
    remove_script: Script,
}

impl RedisBroker {
    /// Build a broker for the given connection. No network I/O happens here.
    pub fn new(config: &ConnectionConfig) -> Result<Self> {
        let client = Client::open(config.to_url())?;

        Ok(Self {
            client,
            redacted_url: config.redacted(),
            conn: Mutex::new(None),
            claim_script: Script::new(CLAIM_LUA),
            extend_lock_script: Script::new(EXTEND_LOCK_LUA),
            finish_script: Script::new(FINISH_LUA),
            retry_script: Script::new(RETRY_LUA),
            recover_stalled_script: Script::new(RECOVER_STALLED_LUA),
            remove_script: Script::new(REMOVE_LUA),
        })
    }

    /// Shorthand for `RedisBroker::new(&ConnectionConfig::from_url(Some(url)))`.
    pub fn from_url(url: &str) -> Result<Self> {
        Self::new(&ConnectionConfig::from_url(Some(url)))
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        debug!(url = %self.redacted_url, "Connecting to Redis");
        let conn = self.client.get_connection_manager().await?;
        info!(url = %self.redacted_url, "Connected to Redis");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn finish(
        &self,
        queue_name: &str,
        job_id: &str,
        token: &str,
        state: JobState,
        reason: &str,
        keep: usize,
    ) -> Result<()> {
        let keys = Keys::new(queue_name);
        let list = match state {
            JobState::Failed => keys.failed(),
            _ => keys.completed(),
        };
        let mut conn = self.connection().await?;

        let outcome: i64 = self
            .finish_script
            .key(keys.active())
            .key(keys.job(job_id))
            .key(list)
            .arg(job_id)
            .arg(token)
            .arg(state.as_str())
            .arg(self.now().timestamp_millis())
            .arg(keep)
            .arg(reason)
            .arg(&keys.prefix)
            .invoke_async(&mut conn)
            .await?;

        script_outcome(outcome, job_id)
    }
}

/// Map the `-1 / 0 / 1` convention the scripts share onto errors.
fn script_outcome(outcome: i64, job_id: &str) -> Result<()> {
    match outcome {
        1 => Ok(()),
        -1 => Err(QueueError::JobNotFound {
            id: job_id.to_string(),
        }),
        _ => Err(QueueError::LockLost {
            id: job_id.to_string(),
        }),
    }
}

fn lock_millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

fn encode_job(job: &Job) -> Result<Vec<(&'static str, String)>> {
    let mut fields = vec![
        ("id", job.id.clone()),
        ("name", job.name.clone()),
        ("data", serde_json::to_string(&job.data)?),
        ("state", job.state.as_str().to_string()),
        ("attempts_made", job.attempts_made.to_string()),
        ("max_attempts", job.max_attempts.to_string()),
        ("backoff", serde_json::to_string(&job.backoff)?),
        ("created_at", job.created_at.timestamp_millis().to_string()),
        ("ready_at", job.ready_at.timestamp_millis().to_string()),
    ];

    if let Some(repeat) = &job.repeat {
        fields.push(("repeat", serde_json::to_string(repeat)?));
    }

    Ok(fields)
}

fn decode_job(queue_name: &str, mut fields: HashMap<String, String>) -> Result<Job> {
    let mut take = |name: &str| {
        fields.remove(name).ok_or_else(|| {
            QueueError::broker(format!("job hash in {} is missing `{}`", queue_name, name))
        })
    };

    let id = take("id")?;
    let name = take("name")?;
    let data: serde_json::Value = serde_json::from_str(&take("data")?)?;
    let state: JobState = take("state")?.parse()?;
    let attempts_made = parse_number(&take("attempts_made")?)? as u32;
    let max_attempts = parse_number(&take("max_attempts")?)? as u32;
    let backoff: Backoff = serde_json::from_str(&take("backoff")?)?;
    let created_at = parse_millis(&take("created_at")?)?;
    let ready_at = parse_millis(&take("ready_at")?)?;

    let repeat: Option<Repeat> = fields
        .remove("repeat")
        .map(|raw| serde_json::from_str(&raw))
        .transpose()?;
    let started_at = fields.remove("started_at").map(|v| parse_millis(&v)).transpose()?;
    let finished_at = fields.remove("finished_at").map(|v| parse_millis(&v)).transpose()?;
    let locked_until = fields.remove("locked_until").map(|v| parse_millis(&v)).transpose()?;

    Ok(Job {
        id,
        queue_name: queue_name.to_string(),
        name,
        data,
        state,
        attempts_made,
        max_attempts,
        backoff,
        repeat,
        created_at,
        ready_at,
        started_at,
        finished_at,
        failed_reason: fields.remove("failed_reason"),
        lock_token: fields.remove("lock_token"),
        locked_until,
    })
}

fn parse_number(raw: &str) -> Result<i64> {
    raw.parse::<i64>()
        .map_err(|e| QueueError::broker(format!("invalid number {:?} in job hash: {}", raw, e)))
}

fn parse_millis(raw: &str) -> Result<DateTime<Utc>> {
    let millis = parse_number(raw)?;
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| QueueError::broker(format!("timestamp out of range: {}", millis)))
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, mut job: Job) -> Result<JobId> {
        let keys = Keys::new(&job.queue_name);
        let mut conn = self.connection().await?;

        let next: u64 = conn.incr(keys.id(), 1).await?;
        job.id = next.to_string();
        job.state = if job.ready_at > self.now() {
            JobState::Delayed
        } else {
            JobState::Waiting
        };

        let fields = encode_job(&job)?;
        let _: () = ::redis::pipe()
            .atomic()
            .hset_multiple(keys.job(&job.id), &fields[..])
            .ignore()
            .zadd(keys.wait(), &job.id, job.ready_at.timestamp_millis())
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(job.id)
    }

    async fn claim(&self, queue_name: &str, lock_duration: Duration) -> Result<Option<Job>> {
        let keys = Keys::new(queue_name);
        let mut conn = self.connection().await?;

        let claimed: Option<String> = self
            .claim_script
            .key(keys.wait())
            .key(keys.active())
            .arg(self.now().timestamp_millis())
            .arg(lock_millis(lock_duration))
            .arg(Uuid::new_v4().to_string())
            .arg(&keys.prefix)
            .invoke_async(&mut conn)
            .await?;

        match claimed {
            Some(id) => self.get_job(queue_name, &id).await,
            None => Ok(None),
        }
    }

    async fn extend_lock(
        &self,
        queue_name: &str,
        job_id: &str,
        token: &str,
        lock_duration: Duration,
    ) -> Result<bool> {
        let keys = Keys::new(queue_name);
        let mut conn = self.connection().await?;
        let deadline = self.now().timestamp_millis() + lock_millis(lock_duration) as i64;

        let extended: i64 = self
            .extend_lock_script
            .key(keys.active())
            .key(keys.job(job_id))
            .arg(job_id)
            .arg(token)
            .arg(deadline)
            .invoke_async(&mut conn)
            .await?;

        Ok(extended == 1)
    }

    async fn complete(
        &self,
        queue_name: &str,
        job_id: &str,
        token: &str,
        retention: &Retention,
    ) -> Result<()> {
        self.finish(
            queue_name,
            job_id,
            token,
            JobState::Completed,
            "",
            retention.keep_completed,
        )
        .await
    }

    async fn retry(
        &self,
        queue_name: &str,
        job_id: &str,
        token: &str,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<()> {
        let keys = Keys::new(queue_name);
        let mut conn = self.connection().await?;

        let outcome: i64 = self
            .retry_script
            .key(keys.active())
            .key(keys.wait())
            .key(keys.job(job_id))
            .arg(job_id)
            .arg(token)
            .arg(error)
            .arg(retry_at.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        script_outcome(outcome, job_id)
    }

    async fn fail(
        &self,
        queue_name: &str,
        job_id: &str,
        token: &str,
        error: &str,
        retention: &Retention,
    ) -> Result<()> {
        self.finish(
            queue_name,
            job_id,
            token,
            JobState::Failed,
            error,
            retention.keep_failed,
        )
        .await
    }

    async fn remove(&self, queue_name: &str, job_id: &str) -> Result<bool> {
        let keys = Keys::new(queue_name);
        let mut conn = self.connection().await?;

        let outcome: i64 = self
            .remove_script
            .key(keys.wait())
            .key(keys.completed())
            .key(keys.failed())
            .key(keys.job(job_id))
            .key(keys.logs(job_id))
            .arg(job_id)
            .invoke_async(&mut conn)
            .await?;

        match outcome {
            1 => Ok(true),
            -1 => Err(QueueError::JobActive {
                id: job_id.to_string(),
            }),
            _ => Ok(false),
        }
    }

    async fn get_job(&self, queue_name: &str, job_id: &str) -> Result<Option<Job>> {
        let keys = Keys::new(queue_name);
        let mut conn = self.connection().await?;

        let fields: HashMap<String, String> = conn.hgetall(keys.job(job_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let mut job = decode_job(queue_name, fields)?;
        if job.state == JobState::Delayed && job.ready_at <= self.now() {
            job.state = JobState::Waiting;
        }
        Ok(Some(job))
    }

    async fn add_log(&self, queue_name: &str, job_id: &str, line: &str) -> Result<()> {
        let keys = Keys::new(queue_name);
        let mut conn = self.connection().await?;

        let exists: bool = conn.exists(keys.job(job_id)).await?;
        if !exists {
            return Err(QueueError::JobNotFound {
                id: job_id.to_string(),
            });
        }

        let _: i64 = conn.rpush(keys.logs(job_id), line).await?;
        Ok(())
    }

    async fn get_logs(&self, queue_name: &str, job_id: &str) -> Result<Vec<String>> {
        let keys = Keys::new(queue_name);
        let mut conn = self.connection().await?;
        let lines: Vec<String> = conn.lrange(keys.logs(job_id), 0, -1).await?;
        Ok(lines)
    }

    async fn recover_stalled(
        &self,
        queue_name: &str,
        retention: &Retention,
    ) -> Result<StalledJobs> {
        let keys = Keys::new(queue_name);
        let mut conn = self.connection().await?;

        let (recovered, failed): (Vec<String>, Vec<String>) = self
            .recover_stalled_script
            .key(keys.active())
            .key(keys.wait())
            .key(keys.failed())
            .arg(self.now().timestamp_millis())
            .arg(&keys.prefix)
            .arg(retention.keep_failed)
            .arg(STALLED_TOO_MANY_TIMES)
            .arg(LOCK_EXPIRED)
            .invoke_async(&mut conn)
            .await?;

        Ok(StalledJobs { recovered, failed })
    }

    async fn job_counts(&self, queue_name: &str) -> Result<JobCounts> {
        let keys = Keys::new(queue_name);
        let mut conn = self.connection().await?;
        let now = self.now().timestamp_millis();

        let (waiting, delayed, active, completed, failed): (u64, u64, u64, u64, u64) =
            ::redis::pipe()
                .zcount(keys.wait(), "-inf", now)
                .zcount(keys.wait(), format!("({}", now), "+inf")
                .zcard(keys.active())
                .llen(keys.completed())
                .llen(keys.failed())
                .query_async(&mut conn)
                .await?;

        Ok(JobCounts {
            waiting,
            delayed,
            active,
            completed,
            failed,
        })
    }

    async fn close(&self) -> Result<()> {
        if self.conn.lock().await.take().is_some() {
            info!(url = %self.redacted_url, "Closed Redis connection");
        }
        Ok(())
    }
}
