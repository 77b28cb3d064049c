//! Lifecycle events for jobs on a queue.
//!
//! Each queue owns an [`EventManager`] wrapping a `tokio::sync::broadcast`
//! channel. The worker and the service publish a [`QueueEvent`] whenever a job
//! changes state, and the service spawns one logger task per queue that turns
//! every event into a structured `tracing` record. Tests and operators can
//! [`subscribe`](EventManager::subscribe) to the same stream.
//!
//! # Examples
//!
//! ```rust
//! use bellwork::events::{EventManager, QueueEvent, QueueEventKind};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let events = EventManager::new("production-default", 64);
//! let mut receiver = events.subscribe();
//!
//! events.publish(QueueEvent::removed("production-default", "42"));
//!
//! let event = receiver.recv().await.unwrap();
//! assert_eq!(event.kind, QueueEventKind::Removed);
//! assert_eq!(event.job_id.as_deref(), Some("42"));
//! # }
//! ```

use crate::{
    QueueError,
    job::{Job, JobId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default capacity of a queue's event channel.
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEventKind {
    /// Job was enqueued and can run now
    Waiting,
    /// Job was enqueued with a delay or a cron schedule
    Delayed,
    /// A worker picked the job up
    Active,
    Completed,
    /// Job used up its attempts
    Failed,
    /// Attempt failed, another one is scheduled
    Retrying,
    /// Lock expired while active; job went back to waiting
    Stalled,
    Removed,
    /// Queue-level problem not tied to one job, e.g. the broker is unreachable
    Error,
}

impl QueueEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueEventKind::Waiting => "waiting",
            QueueEventKind::Delayed => "delayed",
            QueueEventKind::Active => "active",
            QueueEventKind::Completed => "completed",
            QueueEventKind::Failed => "failed",
            QueueEventKind::Retrying => "retrying",
            QueueEventKind::Stalled => "stalled",
            QueueEventKind::Removed => "removed",
            QueueEventKind::Error => "error",
        }
    }
}

impl std::fmt::Display for QueueEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lifecycle event on one queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueEvent {
    pub event_id: Uuid,
    pub queue_name: String,
    pub kind: QueueEventKind,
    pub job_id: Option<JobId>,
    pub job_name: Option<String>,
    /// Attempt number (1-based) the event refers to
    pub attempt: Option<u32>,
    pub error: Option<String>,
    /// Set on `Error` events caused by an exhausted broker quota
    pub quota_exceeded: bool,
    /// Wait before the job becomes eligible, for `Delayed` and `Retrying`
    pub delay_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl QueueEvent {
    fn new(queue_name: &str, kind: QueueEventKind) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            queue_name: queue_name.to_string(),
            kind,
            job_id: None,
            job_name: None,
            attempt: None,
            error: None,
            quota_exceeded: false,
            delay_ms: None,
            timestamp: Utc::now(),
        }
    }

    fn for_job(job: &Job, kind: QueueEventKind) -> Self {
        Self {
            job_id: Some(job.id.clone()),
            job_name: Some(job.name.clone()),
            attempt: Some(job.attempts_made + 1),
            ..Self::new(&job.queue_name, kind)
        }
    }

    /// A freshly enqueued job, `Waiting` or `Delayed` depending on `delay`.
    pub fn enqueued(job: &Job, delay: Duration) -> Self {
        if delay.is_zero() {
            Self::for_job(job, QueueEventKind::Waiting)
        } else {
            Self {
                delay_ms: Some(delay.as_millis() as u64),
                ..Self::for_job(job, QueueEventKind::Delayed)
            }
        }
    }

    pub fn active(job: &Job) -> Self {
        Self::for_job(job, QueueEventKind::Active)
    }

    pub fn completed(job: &Job) -> Self {
        Self::for_job(job, QueueEventKind::Completed)
    }

    pub fn failed(job: &Job, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::for_job(job, QueueEventKind::Failed)
        }
    }

    pub fn retrying(job: &Job, error: impl Into<String>, delay: Duration) -> Self {
        Self {
            error: Some(error.into()),
            delay_ms: Some(delay.as_millis() as u64),
            ..Self::for_job(job, QueueEventKind::Retrying)
        }
    }

    pub fn stalled(queue_name: &str, job_id: impl Into<JobId>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Self::new(queue_name, QueueEventKind::Stalled)
        }
    }

    pub fn removed(queue_name: &str, job_id: impl Into<JobId>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Self::new(queue_name, QueueEventKind::Removed)
        }
    }

    pub fn error(queue_name: &str, err: &QueueError) -> Self {
        Self {
            error: Some(err.to_string()),
            quota_exceeded: err.is_quota_exceeded(),
            ..Self::new(queue_name, QueueEventKind::Error)
        }
    }
}

/// Publisher side of one queue's event stream.
#[derive(Debug, Clone)]
pub struct EventManager {
    queue_name: String,
    sender: broadcast::Sender<QueueEvent>,
}

impl EventManager {
    pub fn new(queue_name: impl Into<String>, buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self {
            queue_name: queue_name.into(),
            sender,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Deliver an event to every current subscriber. Returns how many received
    /// it; having none is not an error.
    pub fn publish(&self, event: QueueEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }
}

/// Write one event as a structured log record.
///
/// Completed jobs log at info, terminal failures and broker errors at error,
/// retries and stalls at warn. Quota errors are expected on shared broker
/// tiers and log at warn too. Everything else logs at debug.
pub fn log_event(event: &QueueEvent) {
    let queue = event.queue_name.as_str();
    let job_id = event.job_id.as_deref().unwrap_or("-");
    let name = event.job_name.as_deref().unwrap_or("-");
    let attempt = event.attempt.unwrap_or(0);
    let reason = event.error.as_deref().unwrap_or("");

    match event.kind {
        QueueEventKind::Completed => {
            info!(queue, job_id, name, attempt, "Job completed")
        }
        QueueEventKind::Failed => {
            error!(queue, job_id, name, attempt, error = reason, "Job failed")
        }
        QueueEventKind::Retrying => warn!(
            queue,
            job_id,
            name,
            attempt,
            delay_ms = event.delay_ms.unwrap_or(0),
            error = reason,
            "Job attempt failed, retry scheduled"
        ),
        QueueEventKind::Stalled => {
            warn!(queue, job_id, "Job lock expired, moved back to waiting")
        }
        QueueEventKind::Error if event.quota_exceeded => {
            warn!(queue, error = reason, "Broker quota exceeded")
        }
        QueueEventKind::Error => error!(queue, error = reason, "Queue error"),
        kind => debug!(
            queue,
            job_id,
            name,
            event = kind.as_str(),
            delay_ms = event.delay_ms.unwrap_or(0),
            "Job event"
        ),
    }
}

/// Log every event from `receiver` until `shutdown` flips to true or the
/// channel closes. Events already buffered at shutdown are still logged.
pub fn spawn_event_logger(
    mut receiver: broadcast::Receiver<QueueEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            // A receiver subscribed after shutdown was sent never sees a change
            if *shutdown.borrow_and_update() {
                while let Ok(event) = receiver.try_recv() {
                    log_event(&event);
                }
                break;
            }

            tokio::select! {
                received = receiver.recv() => match received {
                    Ok(event) => log_event(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event logger fell behind, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        while let Ok(event) = receiver.try_recv() {
                            log_event(&event);
                        }
                        break;
                    }
                }
            }
        }
    })
}
