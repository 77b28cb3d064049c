//! Broker-backed [`QueueService`].
//!
//! `BrokerQueueService` owns one [`Queue`] per logical name (created on first
//! use and cached), one event logger per queue and at most one worker per
//! queue. Queue names are prefixed with the deployment environment so several
//! environments can share a broker without seeing each other's jobs.
//!
//! # Examples
//!
//! ```rust
//! use bellwork::{
//!     broker::memory::MemoryBroker,
//!     job::NewJob,
//!     provider::BrokerQueueService,
//!     service::QueueService,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> bellwork::Result<()> {
//! let service = BrokerQueueService::new(Arc::new(MemoryBroker::new()), "staging");
//! assert_eq!(service.qualified_name("Default"), "staging-default");
//!
//! let id = service
//!     .add_job("default", NewJob::new(json!({"type": "user.reminder", "userId": "u1"})))
//!     .await?;
//! assert_eq!(id, "1");
//!
//! service.close().await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    QueueError, Result,
    broker::{Broker, JobCounts, Retention},
    config::{BellworkConfig, WorkerConfig},
    cron::CronSchedule,
    events::{DEFAULT_EVENT_BUFFER, EventManager, QueueEvent, spawn_event_logger},
    job::{Job, JobData, JobId, JobState, NewJob, encode_payload},
    retry::RetryPolicy,
    service::QueueService,
    worker::{JobHandler, Worker, WorkerHandle},
};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{
    sync::{Mutex, RwLock, broadcast, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

/// A named queue and its event stream.
#[derive(Debug)]
pub struct Queue {
    name: String,
    logical_name: String,
    events: EventManager,
}

impl Queue {
    /// Fully qualified name, e.g. `production-default`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name the caller asked for, e.g. `default`.
    pub fn logical_name(&self) -> &str {
        &self.logical_name
    }

    pub fn events(&self) -> &EventManager {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }
}

pub struct BrokerQueueService {
    broker: Arc<dyn Broker>,
    environment: String,
    worker_settings: WorkerConfig,
    retention: Retention,
    retry: RetryPolicy,
    event_buffer: usize,
    queues: RwLock<HashMap<String, Arc<Queue>>>,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    loggers: Mutex<Vec<JoinHandle<()>>>,
    logger_shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl BrokerQueueService {
    pub fn new(broker: Arc<dyn Broker>, environment: impl Into<String>) -> Self {
        let (logger_shutdown, _) = watch::channel(false);
        Self {
            broker,
            environment: environment.into(),
            worker_settings: WorkerConfig::default(),
            retention: Retention::default(),
            retry: RetryPolicy::default(),
            event_buffer: DEFAULT_EVENT_BUFFER,
            queues: RwLock::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
            loggers: Mutex::new(Vec::new()),
            logger_shutdown,
            closed: AtomicBool::new(false),
        }
    }

    pub fn from_config(broker: Arc<dyn Broker>, config: &BellworkConfig) -> Self {
        Self::new(broker, config.environment.clone())
            .with_worker_settings(config.worker.clone())
            .with_retention(config.retention)
            .with_event_buffer(config.event_buffer)
    }

    pub fn with_worker_settings(mut self, settings: WorkerConfig) -> Self {
        self.worker_settings = settings;
        self
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_event_buffer(mut self, buffer: usize) -> Self {
        self.event_buffer = buffer;
        self
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// `{environment}-{logical}`, lower-cased.
    pub fn qualified_name(&self, logical_name: &str) -> String {
        format!("{}-{}", self.environment, logical_name).to_lowercase()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    /// The queue for `logical_name`, created and subscribed on first use.
    /// Every call with the same name returns the same `Arc`.
    pub async fn queue(&self, logical_name: &str) -> Result<Arc<Queue>> {
        self.ensure_open()?;
        let name = self.qualified_name(logical_name);

        if let Some(queue) = self.queues.read().await.get(&name) {
            return Ok(Arc::clone(queue));
        }

        let mut queues = self.queues.write().await;
        if let Some(queue) = queues.get(&name) {
            return Ok(Arc::clone(queue));
        }
        // close() may have run while we waited for the lock
        self.ensure_open()?;

        let events = EventManager::new(name.clone(), self.event_buffer);
        let logger = spawn_event_logger(events.subscribe(), self.logger_shutdown.subscribe());
        self.loggers.lock().await.push(logger);

        let queue = Arc::new(Queue {
            name: name.clone(),
            logical_name: logical_name.to_string(),
            events,
        });
        queues.insert(name.clone(), Arc::clone(&queue));
        debug!(queue = %name, "Created queue");

        Ok(queue)
    }

    pub async fn subscribe(&self, logical_name: &str) -> Result<broadcast::Receiver<QueueEvent>> {
        Ok(self.queue(logical_name).await?.subscribe())
    }

    pub async fn get_job(&self, logical_name: &str, job_id: &str) -> Result<Option<Job>> {
        self.broker
            .get_job(&self.qualified_name(logical_name), job_id)
            .await
    }

    pub async fn job_logs(&self, logical_name: &str, job_id: &str) -> Result<Vec<String>> {
        self.broker
            .get_logs(&self.qualified_name(logical_name), job_id)
            .await
    }

    pub async fn job_counts(&self, logical_name: &str) -> Result<JobCounts> {
        self.broker
            .job_counts(&self.qualified_name(logical_name))
            .await
    }

    /// Queues that currently have a worker.
    pub async fn worker_queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl QueueService for BrokerQueueService {
    async fn add_job<T>(&self, queue_name: &str, job: NewJob<T>) -> Result<JobId>
    where
        T: JobData + 'static,
    {
        let queue = self.queue(queue_name).await?;
        let data = encode_payload(&job.data)?;

        let now = self.broker.now();
        let not_before = now + to_chrono(job.options.delay.unwrap_or_default());
        let repeat = job.options.repeat();
        let ready_at = match &repeat {
            Some(repeat) => {
                let timezone = repeat.timezone.as_deref().unwrap_or("UTC");
                CronSchedule::with_timezone(&repeat.cron, timezone)?.require_next(not_before)?
            }
            None => not_before,
        };

        let mut job = Job {
            id: JobId::new(),
            queue_name: queue.name().to_string(),
            name: job.name,
            data,
            state: JobState::Waiting,
            attempts_made: 0,
            max_attempts: self.retry.attempts,
            backoff: self.retry.backoff,
            repeat,
            created_at: now,
            ready_at,
            started_at: None,
            finished_at: None,
            failed_reason: None,
            lock_token: None,
            locked_until: None,
        };

        self.ensure_open()?;
        let id = self.broker.enqueue(job.clone()).await?;
        if id.is_empty() {
            return Err(QueueError::broker(format!(
                "broker returned an empty id for a job on {}",
                queue.name()
            )));
        }

        job.id = id.clone();
        let delay = (ready_at - now).to_std().unwrap_or_default();
        queue.events().publish(QueueEvent::enqueued(&job, delay));
        debug!(queue = %queue.name(), job_id = %id, name = %job.name, "Added job");

        Ok(id)
    }

    async fn process_job(
        &self,
        queue_name: &str,
        handler: JobHandler,
        concurrency: usize,
    ) -> Result<()> {
        let queue = self.queue(queue_name).await?;
        let mut workers = self.workers.lock().await;
        self.ensure_open()?;

        if workers.contains_key(queue.name()) {
            warn!(queue = %queue.name(), "Worker already registered for queue, ignoring");
            return Ok(());
        }

        let settings = WorkerConfig {
            concurrency,
            ..self.worker_settings.clone()
        };
        let worker = Worker::new(
            Arc::clone(&self.broker),
            queue.name(),
            handler,
            queue.events().clone(),
        )
        .with_settings(settings)
        .with_retention(self.retention);

        workers.insert(queue.name().to_string(), worker.spawn());
        info!(queue = %queue.name(), concurrency, "Registered worker");
        Ok(())
    }

    async fn remove_job(&self, queue_name: &str, job_id: &str) -> Result<()> {
        let queue = self.queue(queue_name).await?;

        if self.broker.remove(queue.name(), job_id).await? {
            queue
                .events()
                .publish(QueueEvent::removed(queue.name(), job_id));
            info!(queue = %queue.name(), job_id, "Removed job");
        } else {
            warn!(queue = %queue.name(), job_id, "Job not found, nothing to remove");
        }

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Queue service already closed");
            return Ok(());
        }

        info!(environment = %self.environment, "Closing queue service");

        let workers: Vec<WorkerHandle> = self
            .workers
            .lock()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect();

        let results = join_all(workers.into_iter().map(|handle| async move {
            let queue = handle.queue_name().to_string();
            (queue, handle.shutdown().await)
        }))
        .await;

        for (queue, result) in results {
            if let Err(e) = result {
                error!(queue = %queue, error = %e, "Worker did not shut down cleanly");
            }
        }

        // Holding the queue map keeps a concurrent queue() from spawning a
        // logger after the shutdown signal
        let queues = self.queues.write().await;
        let _ = self.logger_shutdown.send(true);
        drop(queues);
        let loggers: Vec<JoinHandle<()>> = self.loggers.lock().await.drain(..).collect();
        for logger in loggers {
            let _ = logger.await;
        }

        self.broker.close().await?;
        info!(environment = %self.environment, "Queue service closed");
        Ok(())
    }
}

fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{broker::memory::MemoryBroker, job::JobOptions, worker::handler_fn};
    use serde_json::json;
    use std::time::Duration;

    fn service(environment: &str) -> (Arc<MemoryBroker>, BrokerQueueService) {
        let broker = Arc::new(MemoryBroker::new());
        let service = BrokerQueueService::new(broker.clone(), environment);
        (broker, service)
    }

    #[test]
    fn test_qualified_name_is_lower_cased() {
        let (_, service) = service("Production");
        assert_eq!(service.qualified_name("Default"), "production-default");
    }

    #[tokio::test]
    async fn test_add_job_stamps_retry_policy() {
        let (broker, service) = service("test");
        let id = service
            .add_job("default", NewJob::new(json!({"type": "user.reminder"})))
            .await
            .unwrap();

        let job = broker.get_job("test-default", &id).await.unwrap().unwrap();
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.backoff, crate::retry::Backoff::exponential(Duration::from_millis(5000)));
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.name, "user.reminder");
    }

    #[tokio::test]
    async fn test_add_job_rejects_bad_payloads() {
        let (_, service) = service("test");

        let missing_type = service.add_job("default", NewJob::new(json!({"x": 1}))).await;
        assert!(matches!(missing_type, Err(QueueError::InvalidJobPayload { .. })));

        let not_object = service.add_job("default", NewJob::new(json!("hello"))).await;
        assert!(not_object.is_err());

        let bad_cron = service
            .add_job(
                "default",
                NewJob::new(json!({"type": "user.reminder"}))
                    .with_options(JobOptions::repeating("not a cron")),
            )
            .await;
        assert!(matches!(bad_cron, Err(QueueError::Cron(_))));
    }

    #[tokio::test]
    async fn test_cron_job_waits_for_next_occurrence() {
        let (broker, service) = service("test");
        let id = service
            .add_job(
                "default",
                NewJob::new(json!({"type": "message.scheduled"}))
                    .with_options(JobOptions::repeating("0 9 * * *").with_timezone("Asia/Kolkata")),
            )
            .await
            .unwrap();

        let job = broker.get_job("test-default", &id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Delayed);
        assert!(job.ready_at > broker.now());
        assert_eq!(job.repeat.unwrap().timezone.as_deref(), Some("Asia/Kolkata"));
    }

    #[tokio::test]
    async fn test_remove_missing_job_is_ok() {
        let (_, service) = service("test");
        service.remove_job("default", "404").await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_service_rejects_work() {
        let (_, service) = service("test");
        service.close().await.unwrap();

        let added = service
            .add_job("default", NewJob::new(json!({"type": "user.reminder"})))
            .await;
        assert!(matches!(added, Err(QueueError::Closed)));

        let handler = handler_fn(|_ctx| async { Ok(()) });
        let processed = service.process_job("default", handler, 5).await;
        assert!(matches!(processed, Err(QueueError::Closed)));

        service.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_racing_close_starts_no_worker() {
        let (broker, service) = service("test");
        let service = Arc::new(service);
        let runs = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        // Park process_job behind the queue map while close() runs
        let queues = service.queues.write().await;
        let registering = tokio::spawn({
            let service = Arc::clone(&service);
            let runs = Arc::clone(&runs);
            async move {
                let handler = handler_fn(move |_ctx| {
                    let runs = Arc::clone(&runs);
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                });
                service.process_job("default", handler, 5).await
            }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let closing = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.close().await }
        });
        while !service.is_closed() {
            tokio::task::yield_now().await;
        }
        drop(queues);

        let registered = registering.await.unwrap();
        assert!(matches!(registered, Err(QueueError::Closed)));
        closing.await.unwrap().unwrap();
        assert!(service.worker_queues().await.is_empty());

        let now = broker.now();
        broker
            .enqueue(Job {
                id: JobId::new(),
                queue_name: "test-default".to_string(),
                name: "user.reminder".to_string(),
                data: json!({"type": "user.reminder"}),
                state: JobState::Waiting,
                attempts_made: 0,
                max_attempts: 3,
                backoff: crate::retry::Backoff::default(),
                repeat: None,
                created_at: now,
                ready_at: now,
                started_at: None,
                finished_at: None,
                failed_reason: None,
                lock_token: None,
                locked_until: None,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        for logger in service.loggers.lock().await.iter() {
            assert!(logger.is_finished());
        }
    }
}
