//! The producer/consumer contract of the queue.
//!
//! Producers only ever call [`add_job`](QueueService::add_job); the worker
//! process binds handlers with [`process_job`](QueueService::process_job).
//! [`BrokerQueueService`](crate::provider::BrokerQueueService) implements it
//! over any [`Broker`](crate::broker::Broker).

use crate::{
    Result,
    job::{JobData, JobId, NewJob},
    worker::JobHandler,
};
use async_trait::async_trait;

pub use crate::config::DEFAULT_CONCURRENCY;

#[async_trait]
pub trait QueueService: Send + Sync {
    /// Enqueue a job and return the id the broker gave it.
    ///
    /// Every job gets 3 attempts with exponential backoff from 5 seconds;
    /// `job.options` can only delay it or put it on a cron schedule. Fails
    /// when the payload is not a JSON object with a matching `type`, when
    /// the cron expression or timezone is invalid, or when the broker
    /// rejects the write.
    async fn add_job<T>(&self, queue_name: &str, job: NewJob<T>) -> Result<JobId>
    where
        T: JobData + 'static;

    /// Start a worker for `queue_name`. Registering a second handler for the
    /// same queue logs a warning and leaves the first one in place.
    async fn process_job(
        &self,
        queue_name: &str,
        handler: JobHandler,
        concurrency: usize,
    ) -> Result<()>;

    /// Remove a job that has not started. A job that no longer exists is not
    /// an error; an active one is `QueueError::JobActive`.
    async fn remove_job(&self, queue_name: &str, job_id: &str) -> Result<()>;

    /// Stop workers after their in-flight jobs finish, then release the
    /// broker. Calling it again does nothing.
    async fn close(&self) -> Result<()>;
}
