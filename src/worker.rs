use crate::{
    QueueError, Result,
    broker::{Broker, Retention, STALLED_TOO_MANY_TIMES},
    config::WorkerConfig,
    cron::CronSchedule,
    events::{EventManager, QueueEvent, QueueEventKind},
    job::Job,
    retry::RetryPolicy,
};
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use std::{any::Any, future::Future, panic::AssertUnwindSafe, pin::Pin, sync::Arc, time::Duration};
use tokio::{
    sync::{Semaphore, watch},
    task::{JoinHandle, JoinSet},
    time::{Instant, MissedTickBehavior, interval, interval_at, sleep},
};
use tracing::{Level, debug, error, info, warn};

/// Async function run for every job a worker claims.
pub type JobHandler = Arc<
    dyn Fn(JobContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync,
>;

/// Wrap an async closure as a [`JobHandler`].
///
/// ```rust
/// use bellwork::worker::{JobHandler, handler_fn};
///
/// let handler: JobHandler = handler_fn(|ctx| async move {
///     ctx.log("hello").await?;
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> JobHandler
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// What a handler sees: the claimed job plus a log sink that writes back to it.
#[derive(Clone)]
pub struct JobContext {
    job: Job,
    broker: Arc<dyn Broker>,
}

impl JobContext {
    pub fn new(job: Job, broker: Arc<dyn Broker>) -> Self {
        Self { job, broker }
    }

    pub fn id(&self) -> &str {
        &self.job.id
    }

    pub fn name(&self) -> &str {
        &self.job.name
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    /// 1-based number of the attempt in progress.
    pub fn attempt(&self) -> u32 {
        self.job.attempts_made + 1
    }

    pub fn task_type(&self) -> Option<&str> {
        self.job.task_type()
    }

    pub fn data<T: DeserializeOwned>(&self) -> Result<T> {
        self.job.data_as()
    }

    /// Append a line to the job's log and mirror it to tracing.
    pub async fn log(&self, line: impl Into<String>) -> Result<()> {
        let line = line.into();
        info!(queue = %self.job.queue_name, job_id = %self.job.id, "{}", line);
        self.broker
            .add_log(&self.job.queue_name, &self.job.id, &line)
            .await
    }
}

/// Shortest pause after a broker error that is not a quota error.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Consumer for one queue.
///
/// Claims up to `concurrency` jobs at a time, renews their locks while the
/// handler runs, and records the outcome: completion, a retry after backoff,
/// or a terminal failure once the attempt budget is spent.
pub struct Worker {
    broker: Arc<dyn Broker>,
    queue_name: String,
    handler: JobHandler,
    events: EventManager,
    settings: WorkerConfig,
    retention: Retention,
}

impl Worker {
    pub fn new(
        broker: Arc<dyn Broker>,
        queue_name: impl Into<String>,
        handler: JobHandler,
        events: EventManager,
    ) -> Self {
        Self {
            broker,
            queue_name: queue_name.into(),
            handler,
            events,
            settings: WorkerConfig::default(),
            retention: Retention::default(),
        }
    }

    pub fn with_settings(mut self, settings: WorkerConfig) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.settings.concurrency = concurrency;
        self
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Run on a background task until the returned handle is shut down.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue_name = self.queue_name.clone();
        let task = tokio::spawn(self.run(shutdown_rx));

        WorkerHandle {
            queue_name,
            shutdown: shutdown_tx,
            task,
        }
    }

    /// Claim and process jobs until `shutdown` turns true, then drain.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let concurrency = self.settings.concurrency.max(1);
        let worker = Arc::new(self);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut in_flight = JoinSet::new();

        let mut stall_check = interval(worker.settings.stalled_interval);
        stall_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            queue = %worker.queue_name,
            concurrency,
            "Worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_join_result(&worker.queue_name, joined);
                }
                _ = stall_check.tick() => {
                    worker.recover_stalled().await;
                }
                permit = semaphore.clone().acquire_owned() => {
                    let permit = permit.map_err(|_| QueueError::Closed)?;

                    match worker.broker.claim(&worker.queue_name, worker.settings.lock_duration).await {
                        Ok(Some(job)) => {
                            debug!(queue = %worker.queue_name, job_id = %job.id, "Claimed job");
                            worker.events.publish(QueueEvent::active(&job));
                            let processor = Arc::clone(&worker);
                            in_flight.spawn(async move {
                                processor.process(job).await;
                                drop(permit);
                            });
                        }
                        Ok(None) => {
                            drop(permit);
                            pause(worker.settings.poll_interval, &mut shutdown).await;
                        }
                        Err(e) => {
                            drop(permit);
                            let backoff = worker.broker_error(&e);
                            pause(backoff, &mut shutdown).await;
                        }
                    }
                }
            }
        }

        info!(
            queue = %worker.queue_name,
            in_flight = in_flight.len(),
            "Worker stopping, draining in-flight jobs"
        );

        let drained = tokio::time::timeout(
            worker.settings.drain_timeout,
            drain(&worker.queue_name, &mut in_flight),
        )
        .await;

        if drained.is_err() {
            warn!(
                queue = %worker.queue_name,
                remaining = in_flight.len(),
                "Drain timed out, aborting remaining jobs; their locks will expire"
            );
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
        }

        info!(queue = %worker.queue_name, "Worker stopped");
        Ok(())
    }

    async fn process(&self, job: Job) {
        let Some(token) = job.lock_token.clone() else {
            error!(queue = %self.queue_name, job_id = %job.id, "Claimed job has no lock token");
            return;
        };

        let ctx = JobContext::new(job.clone(), Arc::clone(&self.broker));
        let handler = AssertUnwindSafe((self.handler)(ctx)).catch_unwind();
        tokio::pin!(handler);

        let lock_duration = self.settings.lock_duration;
        let renew_every = (lock_duration / 2).max(Duration::from_millis(1));
        let mut renew = interval_at(Instant::now() + renew_every, renew_every);

        let outcome = loop {
            tokio::select! {
                result = &mut handler => {
                    break match result {
                        Ok(result) => result,
                        Err(panic) => Err(QueueError::Handler(format!(
                            "Handler panicked: {}",
                            panic_message(panic)
                        ))),
                    };
                }
                _ = renew.tick() => {
                    match self.broker.extend_lock(&self.queue_name, &job.id, &token, lock_duration).await {
                        Ok(true) => debug!(queue = %self.queue_name, job_id = %job.id, "Extended job lock"),
                        Ok(false) => warn!(queue = %self.queue_name, job_id = %job.id, "Job lock lost while running"),
                        Err(e) => warn!(queue = %self.queue_name, job_id = %job.id, error = %e, "Failed to extend job lock"),
                    }
                }
            }
        };

        match outcome {
            Ok(()) => self.on_success(&job, &token).await,
            Err(e) => self.on_failure(&job, &token, e).await,
        }
    }

    async fn on_success(&self, job: &Job, token: &str) {
        match self
            .broker
            .complete(&self.queue_name, &job.id, token, &self.retention)
            .await
        {
            Ok(()) => {
                self.events.publish(QueueEvent::completed(job));
                self.schedule_next(job).await;
            }
            Err(e) => self.record_error(job, e),
        }
    }

    async fn on_failure(&self, job: &Job, token: &str, err: QueueError) {
        let message = err.to_string();
        let attempts_made = job.attempts_made + 1;
        error!(
            queue = %self.queue_name,
            job_id = %job.id,
            attempt = attempts_made,
            max_attempts = job.max_attempts,
            error = %message,
            "Job attempt failed"
        );

        let policy = RetryPolicy {
            attempts: job.max_attempts,
            backoff: job.backoff,
        };

        if policy.should_retry(attempts_made) {
            let delay = policy.backoff.delay_for_attempt(attempts_made);
            let retry_at = self.broker.now() + to_chrono(delay);

            match self
                .broker
                .retry(&self.queue_name, &job.id, token, &message, retry_at)
                .await
            {
                Ok(()) => {
                    self.events
                        .publish(QueueEvent::retrying(job, message, delay));
                }
                Err(e) => self.record_error(job, e),
            }
        } else {
            match self
                .broker
                .fail(&self.queue_name, &job.id, token, &message, &self.retention)
                .await
            {
                Ok(()) => {
                    self.events.publish(QueueEvent::failed(job, message));
                    self.schedule_next(job).await;
                }
                Err(e) => self.record_error(job, e),
            }
        }
    }

    /// Enqueue the next occurrence of a cron job.
    async fn schedule_next(&self, job: &Job) {
        let Some(repeat) = &job.repeat else {
            return;
        };

        let now = self.broker.now();
        let timezone = repeat.timezone.as_deref().unwrap_or("UTC");
        let next_at = match CronSchedule::with_timezone(&repeat.cron, timezone)
            .and_then(|schedule| schedule.require_next(now))
        {
            Ok(at) => at,
            Err(e) => {
                warn!(queue = %self.queue_name, job_id = %job.id, error = %e, "Recurring job not rescheduled");
                return;
            }
        };

        let mut next = job.next_occurrence(now, next_at);
        match self.broker.enqueue(next.clone()).await {
            Ok(id) => {
                info!(
                    queue = %self.queue_name,
                    job_id = %job.id,
                    next_job_id = %id,
                    next_run = %next_at,
                    "Rescheduled recurring job"
                );
                next.id = id;
                let delay = (next_at - now).to_std().unwrap_or_default();
                self.events.publish(QueueEvent::enqueued(&next, delay));
            }
            Err(e) => self.record_error(job, e),
        }
    }

    async fn recover_stalled(&self) {
        let stalled = match self
            .broker
            .recover_stalled(&self.queue_name, &self.retention)
            .await
        {
            Ok(stalled) => stalled,
            Err(e) => {
                self.broker_error(&e);
                return;
            }
        };

        for id in stalled.recovered {
            self.events.publish(QueueEvent::stalled(&self.queue_name, id));
        }

        for id in stalled.failed {
            warn!(queue = %self.queue_name, job_id = %id, "Job stalled too many times");
            match self.broker.get_job(&self.queue_name, &id).await {
                Ok(Some(job)) => {
                    self.events.publish(QueueEvent {
                        attempt: Some(job.attempts_made),
                        ..QueueEvent::failed(&job, STALLED_TOO_MANY_TIMES)
                    });
                    self.schedule_next(&job).await;
                }
                // Already trimmed by retention
                Ok(None) => {
                    self.events.publish(QueueEvent {
                        kind: QueueEventKind::Failed,
                        error: Some(STALLED_TOO_MANY_TIMES.to_string()),
                        ..QueueEvent::stalled(&self.queue_name, id)
                    });
                }
                Err(e) => {
                    self.broker_error(&e);
                }
            }
        }
    }

    fn record_error(&self, job: &Job, err: QueueError) {
        if let QueueError::LockLost { .. } = err {
            warn!(
                queue = %self.queue_name,
                job_id = %job.id,
                "Job lock lost before the result was recorded; it will be retried elsewhere"
            );
            return;
        }

        if record_error_level(&err) == Level::WARN {
            warn!(queue = %self.queue_name, job_id = %job.id, error = %err, "Failed to record job result");
        } else {
            error!(queue = %self.queue_name, job_id = %job.id, error = %err, "Failed to record job result");
        }
        self.events.publish(QueueEvent::error(&self.queue_name, &err));
    }

    /// Publish a broker error and return how long to hold off before the
    /// next claim.
    fn broker_error(&self, err: &QueueError) -> Duration {
        self.events.publish(QueueEvent::error(&self.queue_name, err));
        if err.is_quota_exceeded() {
            self.settings.quota_backoff
        } else {
            self.settings.poll_interval.max(ERROR_BACKOFF)
        }
    }
}

/// Handle to a spawned [`Worker`].
pub struct WorkerHandle {
    queue_name: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl WorkerHandle {
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop claiming, wait for in-flight jobs (bounded by the drain timeout)
    /// and return once the worker task has exited.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(QueueError::Handler(format!(
                "worker for {} ended abnormally: {}",
                self.queue_name, e
            ))),
        }
    }
}

/// Level a broker error is logged at when a job result cannot be recorded.
/// Quota exhaustion is expected on shared tiers and is a warning.
fn record_error_level(err: &QueueError) -> Level {
    if err.is_quota_exceeded() {
        Level::WARN
    } else {
        Level::ERROR
    }
}

async fn pause(duration: Duration, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = sleep(duration) => {}
        _ = shutdown.changed() => {}
    }
}

async fn drain(queue_name: &str, in_flight: &mut JoinSet<()>) {
    while let Some(joined) = in_flight.join_next().await {
        log_join_result(queue_name, joined);
    }
}

fn log_join_result(queue_name: &str, joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(queue = %queue_name, error = %e, "Job task panicked");
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::memory::MemoryBroker,
        job::JobState,
        retry::Backoff,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const QUEUE: &str = "test-default";

    fn new_job(broker: &MemoryBroker) -> Job {
        let now = broker.now();
        Job {
            id: String::new(),
            queue_name: QUEUE.to_string(),
            name: "ping".to_string(),
            data: json!({"type": "ping"}),
            state: JobState::Waiting,
            attempts_made: 0,
            max_attempts: 3,
            backoff: Backoff::default(),
            repeat: None,
            created_at: now,
            ready_at: now,
            started_at: None,
            finished_at: None,
            failed_reason: None,
            lock_token: None,
            locked_until: None,
        }
    }

    async fn wait_for(
        receiver: &mut tokio::sync::broadcast::Receiver<QueueEvent>,
        kind: QueueEventKind,
    ) -> QueueEvent {
        loop {
            let event = receiver.recv().await.unwrap();
            if event.kind == kind {
                return event;
            }
        }
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new("owned".to_string())), "owned");
        assert_eq!(panic_message(Box::new(7u8)), "unknown panic payload");
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_handler_is_retried() {
        let broker = Arc::new(MemoryBroker::new());
        let id = broker.enqueue(new_job(&broker)).await.unwrap();
        let events = EventManager::new(QUEUE, 64);
        let mut receiver = events.subscribe();

        let handler = handler_fn(|_ctx| async move {
            if true {
                panic!("handler exploded");
            }
            Ok(())
        });
        let handle = Worker::new(broker.clone(), QUEUE, handler, events).spawn();

        let retrying = wait_for(&mut receiver, QueueEventKind::Retrying).await;
        assert_eq!(retrying.job_id.as_deref(), Some(id.as_str()));
        assert!(retrying.error.unwrap().contains("handler exploded"));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_is_renewed_for_long_handlers() {
        let broker = Arc::new(MemoryBroker::new());
        broker.enqueue(new_job(&broker)).await.unwrap();
        let events = EventManager::new(QUEUE, 64);
        let mut receiver = events.subscribe();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler = handler_fn(move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_secs(95)).await;
                Ok(())
            }
        });

        let settings = WorkerConfig {
            lock_duration: Duration::from_secs(30),
            stalled_interval: Duration::from_secs(10),
            ..WorkerConfig::default()
        };
        let handle = Worker::new(broker.clone(), QUEUE, handler, events)
            .with_settings(settings)
            .spawn();

        wait_for(&mut receiver, QueueEventKind::Completed).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_logs_are_written_back() {
        let broker = Arc::new(MemoryBroker::new());
        let id = broker.enqueue(new_job(&broker)).await.unwrap();
        let events = EventManager::new(QUEUE, 64);
        let mut receiver = events.subscribe();

        let handler = handler_fn(|ctx| async move {
            ctx.log(format!("attempt {}", ctx.attempt())).await?;
            Ok(())
        });
        let handle = Worker::new(broker.clone(), QUEUE, handler, events).spawn();

        wait_for(&mut receiver, QueueEventKind::Completed).await;
        assert_eq!(broker.get_logs(QUEUE, &id).await.unwrap(), vec!["attempt 1"]);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_in_flight_job() {
        let broker = Arc::new(MemoryBroker::new());
        let id = broker.enqueue(new_job(&broker)).await.unwrap();
        let events = EventManager::new(QUEUE, 64);
        let mut receiver = events.subscribe();

        let handler = handler_fn(|_ctx| async move {
            sleep(Duration::from_secs(2)).await;
            Ok(())
        });
        let handle = Worker::new(broker.clone(), QUEUE, handler, events).spawn();

        wait_for(&mut receiver, QueueEventKind::Active).await;
        handle.shutdown().await.unwrap();

        let job = broker.get_job(QUEUE, &id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
    }

    #[test]
    fn test_record_error_level() {
        assert_eq!(
            record_error_level(&QueueError::broker("ERR max daily request limit exceeded")),
            Level::WARN
        );
        assert_eq!(
            record_error_level(&QueueError::broker("connection refused")),
            Level::ERROR
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_out_of_attempts_fails_when_it_stalls() {
        let broker = Arc::new(MemoryBroker::new());
        let mut job = new_job(&broker);
        job.max_attempts = 1;
        let id = broker.enqueue(job).await.unwrap();

        // A worker that died holding the lock
        broker.claim(QUEUE, Duration::from_secs(1)).await.unwrap().unwrap();

        let events = EventManager::new(QUEUE, 64);
        let mut receiver = events.subscribe();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler = handler_fn(move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let settings = WorkerConfig {
            stalled_interval: Duration::from_secs(1),
            ..WorkerConfig::default()
        };
        let handle = Worker::new(broker.clone(), QUEUE, handler, events)
            .with_settings(settings)
            .spawn();

        let failed = wait_for(&mut receiver, QueueEventKind::Failed).await;
        assert_eq!(failed.job_id.as_deref(), Some(id.as_str()));
        assert_eq!(failed.error.as_deref(), Some(STALLED_TOO_MANY_TIMES));
        assert_eq!(failed.attempt, Some(1));

        sleep(Duration::from_secs(5)).await;
        handle.shutdown().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let job = broker.get_job(QUEUE, &id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.failed_reason.as_deref(), Some(STALLED_TOO_MANY_TIMES));
    }
}
