use thiserror::Error;

/// Message fragment the managed Redis tiers use when a request quota is spent,
/// e.g. `ERR max daily request limit exceeded. Limit: 10000, Usage: 10000`.
const QUOTA_EXCEEDED_MARKER: &str = "request limit exceeded";

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Broker error: {message}")]
    Broker { message: String },

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(redis::RedisError),

    #[error("Broker quota exceeded: {message}")]
    QuotaExceeded { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Job {id} is active and cannot be removed")]
    JobActive { id: String },

    #[error("Lock lost for job {id}")]
    LockLost { id: String },

    #[error("No handler found for task type: {task_type}")]
    NoHandler { task_type: String },

    #[error("Invalid job payload: {message}")]
    InvalidJobPayload { message: String },

    #[error("Cron error: {0}")]
    Cron(#[from] crate::cron::CronError),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Delivery via {channel} failed: {message}")]
    Delivery { channel: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Queue service is closed")]
    Closed,
}

impl QueueError {
    /// Build a broker error, classifying quota exhaustion separately.
    pub fn broker(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_quota_message(&message) {
            QueueError::QuotaExceeded { message }
        } else {
            QueueError::Broker { message }
        }
    }

    /// Whether the broker refused the request because a usage quota ran out.
    ///
    /// These are expected on shared broker tiers; workers log them as warnings
    /// and keep running.
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, QueueError::QuotaExceeded { .. })
    }
}

fn is_quota_message(message: &str) -> bool {
    message.to_ascii_lowercase().contains(QUOTA_EXCEEDED_MARKER)
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        let message = err.to_string();
        if is_quota_message(&message) {
            QueueError::QuotaExceeded { message }
        } else {
            QueueError::Redis(err)
        }
    }
}

impl From<toml::de::Error> for QueueError {
    fn from(err: toml::de::Error) -> Self {
        QueueError::Config(format!("TOML deserialization error: {}", err))
    }
}

impl From<toml::ser::Error> for QueueError {
    fn from(err: toml::ser::Error) -> Self {
        QueueError::Config(format!("TOML serialization error: {}", err))
    }
}
