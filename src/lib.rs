//! # Bellwork
//!
//! Background job queue behind a school platform's notifications: reminders
//! and scheduled messages delivered by email or WhatsApp, run later, retried
//! on failure, and never run twice at the same time.
//!
//! ## Features
//!
//! - **Redis broker**: jobs, locks and logs in Redis, state changes in Lua (feature `redis`, on by default)
//! - **In-memory broker**: same semantics in process, driven by tokio time for deterministic tests
//! - **Fixed retry policy**: 3 attempts, exponential backoff from 5 seconds
//! - **Delays and cron**: run once after a delay or on a cron schedule in any IANA timezone
//! - **Bounded workers**: one worker per queue, 5 jobs at a time by default, locks renewed while running
//! - **Stall recovery**: jobs whose lock expired go back to waiting (at-least-once delivery)
//! - **Lifecycle events**: per-queue broadcast stream, logged through `tracing`
//! - **Environment namespacing**: `production-default` and `staging-default` never mix
//!
//! ## Quick Start
//!
//! ```rust
//! use bellwork::{
//!     BrokerQueueService, NewJob, QueueService, TaskRunner,
//!     broker::memory::MemoryBroker,
//!     notify::SimulatedNotifier,
//!     tasks::ReminderJob,
//! };
//! use std::{sync::Arc, time::Duration};
//!
//! # #[tokio::main]
//! # async fn main() -> bellwork::Result<()> {
//! let service = BrokerQueueService::new(Arc::new(MemoryBroker::new()), "development");
//!
//! let runner = TaskRunner::new(Arc::new(SimulatedNotifier::default()));
//! service.process_job("default", runner.into_handler(), 5).await?;
//!
//! let reminder = ReminderJob::new("u1", "Buy milk", chrono::Utc::now())
//!     .with_email("u1@example.com");
//! let id = service
//!     .add_job("default", NewJob::new(reminder).with_delay(Duration::from_secs(2)))
//!     .await?;
//! println!("queued reminder {}", id);
//!
//! service.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod cron;
pub mod error;
pub mod events;
pub mod job;
pub mod logging;
pub mod notify;
pub mod provider;
pub mod retry;
pub mod service;
pub mod shutdown;
pub mod tasks;
pub mod worker;

pub use broker::{Broker, JobCounts, Retention, StalledJobs};
pub use config::{BellworkConfig, ConnectionConfig, DEFAULT_CONCURRENCY, WorkerConfig};
pub use cron::{CronError, CronSchedule};
pub use error::QueueError;
pub use events::{EventManager, QueueEvent, QueueEventKind};
pub use job::{Job, JobData, JobId, JobOptions, JobState, NewJob};
pub use provider::{BrokerQueueService, Queue};
pub use retry::{Backoff, RetryPolicy};
pub use service::QueueService;
pub use tasks::{Task, TaskKind, TaskRunner};
pub use worker::{JobContext, JobHandler, Worker, WorkerHandle, handler_fn};

#[cfg(feature = "redis")]
pub use broker::redis::RedisBroker;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, QueueError>;
