use crate::{QueueError, Result, retry::Backoff};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::time::Duration;

/// Broker-assigned job identifier, unique within a queue.
pub type JobId = String;

/// Field of every payload that names the task it belongs to.
pub const TYPE_FIELD: &str = "type";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "delayed" => Ok(JobState::Delayed),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(QueueError::broker(format!("unknown job state: {}", other))),
        }
    }
}

/// Payload contract shared by producers and the worker.
///
/// The serialized payload must be a JSON object; its `type` field is the
/// discriminator the worker dispatches on.
pub trait JobData: Serialize + Send + Sync {
    fn job_type(&self) -> &str;
}

/// Raw payloads, e.g. forwarded from an HTTP body. The `type` field must be
/// present.
impl JobData for serde_json::Value {
    fn job_type(&self) -> &str {
        self.get(TYPE_FIELD).and_then(|t| t.as_str()).unwrap_or("")
    }
}

/// Recurrence settings carried by a cron job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Repeat {
    pub cron: String,
    pub timezone: Option<String>,
}

/// Scheduling knobs a producer may set. Retry behaviour is not one of them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobOptions {
    /// Hold the job back for this long before it becomes eligible.
    pub delay: Option<Duration>,
    /// Run on a cron schedule instead of once.
    pub cron: Option<String>,
    /// IANA timezone the cron expression is evaluated in (UTC when absent).
    pub timezone: Option<String>,
}

impl JobOptions {
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn repeating(cron: impl Into<String>) -> Self {
        Self {
            cron: Some(cron.into()),
            ..Default::default()
        }
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    pub fn repeat(&self) -> Option<Repeat> {
        self.cron.as_ref().map(|cron| Repeat {
            cron: cron.clone(),
            timezone: self.timezone.clone(),
        })
    }
}

/// What a producer hands to `add_job`.
#[derive(Debug, Clone)]
pub struct NewJob<T> {
    pub name: String,
    pub data: T,
    pub options: JobOptions,
}

impl<T: JobData> NewJob<T> {
    /// A job named after its payload's task type.
    pub fn new(data: T) -> Self {
        Self {
            name: data.job_type().to_string(),
            data,
            options: JobOptions::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.options.delay = Some(delay);
        self
    }
}

/// A job as stored by the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub queue_name: String,
    pub name: String,
    pub data: serde_json::Value,
    pub state: JobState,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub repeat: Option<Repeat>,
    pub created_at: DateTime<Utc>,
    pub ready_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    pub lock_token: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
}

impl Job {
    /// The dispatch discriminator, if the payload carries one.
    pub fn task_type(&self) -> Option<&str> {
        self.data.get(TYPE_FIELD).and_then(|t| t.as_str())
    }

    /// Deserialize the payload into a concrete task shape.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| QueueError::InvalidJobPayload {
            message: format!("job {}: {}", self.id, e),
        })
    }

    pub fn is_recurring(&self) -> bool {
        self.repeat.is_some()
    }

    /// Copy of this job for its next cron occurrence: fresh attempt budget,
    /// no id (the broker assigns one).
    pub fn next_occurrence(&self, now: DateTime<Utc>, ready_at: DateTime<Utc>) -> Job {
        Job {
            id: JobId::new(),
            state: if ready_at > now {
                JobState::Delayed
            } else {
                JobState::Waiting
            },
            attempts_made: 0,
            created_at: now,
            ready_at,
            started_at: None,
            finished_at: None,
            failed_reason: None,
            lock_token: None,
            locked_until: None,
            ..self.clone()
        }
    }
}

/// Serialize `data` into an object whose `type` agrees with
/// [`JobData::job_type`], filling the field in when the struct omits it.
pub(crate) fn encode_payload<T: JobData>(data: &T) -> Result<serde_json::Value> {
    let job_type = data.job_type().to_string();
    let mut value = serde_json::to_value(data)?;

    let object = value
        .as_object_mut()
        .ok_or_else(|| QueueError::InvalidJobPayload {
            message: "job data must serialize to a JSON object".to_string(),
        })?;

    if job_type.is_empty() {
        return Err(QueueError::InvalidJobPayload {
            message: format!("job data needs a non-empty string `{}` field", TYPE_FIELD),
        });
    }

    match object.get(TYPE_FIELD) {
        Some(serde_json::Value::String(existing)) if existing == &job_type => {}
        Some(other) => {
            return Err(QueueError::InvalidJobPayload {
                message: format!(
                    "job data type {} does not match task type {:?}",
                    other, job_type
                ),
            });
        }
        None => {
            object.insert(
                TYPE_FIELD.to_string(),
                serde_json::Value::String(job_type),
            );
        }
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    struct Ping {
        target: String,
    }

    impl JobData for Ping {
        fn job_type(&self) -> &str {
            "ping"
        }
    }

    #[test]
    fn test_encode_payload_inserts_type() {
        let value = encode_payload(&Ping {
            target: "a".to_string(),
        })
        .unwrap();
        assert_eq!(value, json!({"type": "ping", "target": "a"}));
    }

    #[test]
    fn test_encode_payload_raw_value() {
        let raw = json!({"type": "nonexistent.task", "x": 1});
        assert_eq!(encode_payload(&raw).unwrap(), raw);
    }

    #[test]
    fn test_encode_payload_rejects_missing_type() {
        let raw = json!({"x": 1});
        assert!(matches!(
            encode_payload(&raw),
            Err(QueueError::InvalidJobPayload { .. })
        ));
    }

    #[test]
    fn test_encode_payload_rejects_non_object() {
        let raw = json!(["type", "ping"]);
        assert!(encode_payload(&raw).is_err());
    }

    #[test]
    fn test_new_job_defaults_name_to_type() {
        let job = NewJob::new(json!({"type": "user.reminder"}));
        assert_eq!(job.name, "user.reminder");
        assert_eq!(job.options, JobOptions::default());
    }

    #[test]
    fn test_job_state_round_trip() {
        for state in [
            JobState::Waiting,
            JobState::Delayed,
            JobState::Active,
            JobState::Completed,
            JobState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("paused".parse::<JobState>().is_err());
    }
}
