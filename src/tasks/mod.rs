//! Task kinds the worker knows how to run.
//!
//! A job's `type` field selects the task. [`Task`] is a closed enum over every
//! known kind, so adding a kind without a handler fails to compile; a payload
//! naming a kind outside the enum fails the job with
//! `QueueError::NoHandler`.
//!
//! # Examples
//!
//! ```rust
//! use bellwork::tasks::{Task, TaskKind};
//! use serde_json::json;
//!
//! let task = Task::from_value(&json!({
//!     "type": "user.reminder",
//!     "userId": "u1",
//!     "message": "Buy milk",
//!     "reminderTime": "2024-06-03T07:30:00Z",
//! }))
//! .unwrap();
//! assert_eq!(task.kind(), TaskKind::Reminder);
//!
//! let err = Task::from_value(&json!({"type": "nonexistent.task"})).unwrap_err();
//! assert_eq!(err.to_string(), "No handler found for task type: nonexistent.task");
//! ```

pub mod reminder;
pub mod scheduled_message;

pub use reminder::ReminderJob;
pub use scheduled_message::ScheduledMessageJob;

use crate::{
    QueueError, Result,
    job::{JobData, TYPE_FIELD},
    notify::{Contact, Notifier},
    worker::{JobContext, JobHandler},
};
use serde::{Deserialize, Serialize};
use std::{str::FromStr, sync::Arc};
use tracing::{error, info};

pub const REMINDER: &str = "user.reminder";
pub const SCHEDULED_MESSAGE: &str = "message.scheduled";

/// Discriminator of every registered task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Reminder,
    ScheduledMessage,
}

impl TaskKind {
    pub const ALL: [TaskKind; 2] = [TaskKind::Reminder, TaskKind::ScheduledMessage];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Reminder => REMINDER,
            TaskKind::ScheduledMessage => SCHEDULED_MESSAGE,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        TaskKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| QueueError::NoHandler {
                task_type: s.to_string(),
            })
    }
}

/// A decoded job payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Task {
    #[serde(rename = "user.reminder")]
    Reminder(ReminderJob),
    #[serde(rename = "message.scheduled")]
    ScheduledMessage(ScheduledMessageJob),
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        match self {
            Task::Reminder(_) => TaskKind::Reminder,
            Task::ScheduledMessage(_) => TaskKind::ScheduledMessage,
        }
    }

    /// Decode a raw payload. An unknown or missing `type` is `NoHandler`; a
    /// known type with the wrong fields is `InvalidJobPayload`.
    pub fn from_value(data: &serde_json::Value) -> Result<Self> {
        let task_type = data
            .get(TYPE_FIELD)
            .and_then(|t| t.as_str())
            .unwrap_or_default();
        let kind: TaskKind = task_type.parse()?;

        serde_json::from_value(data.clone()).map_err(|e| QueueError::InvalidJobPayload {
            message: format!("{} payload: {}", kind, e),
        })
    }
}

impl JobData for Task {
    fn job_type(&self) -> &str {
        self.kind().as_str()
    }
}

/// Email and WhatsApp targets for whichever contact fields are set.
pub(crate) fn contacts(email: Option<&str>, phone_number: Option<&str>) -> Vec<Contact> {
    let email = email
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(|e| Contact::Email(e.to_string()));
    let phone = phone_number
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| Contact::WhatsApp(p.to_string()));

    email.into_iter().chain(phone).collect()
}

/// Dispatches claimed jobs to the handler for their task kind.
#[derive(Clone)]
pub struct TaskRunner {
    notifier: Arc<dyn Notifier>,
}

impl TaskRunner {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    /// Run one job. Errors are logged and returned so the worker can retry.
    pub async fn run(&self, ctx: JobContext) -> Result<()> {
        let task_type = ctx.task_type().unwrap_or_default().to_string();
        info!(job_id = %ctx.id(), task_type = %task_type, attempt = ctx.attempt(), "Processing job");

        let result = match Task::from_value(&ctx.job().data) {
            Ok(task) => self.dispatch(&ctx, task).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => info!(job_id = %ctx.id(), task_type = %task_type, "Finished job"),
            Err(e) => error!(job_id = %ctx.id(), task_type = %task_type, error = %e, "Job handler failed"),
        }

        result
    }

    async fn dispatch(&self, ctx: &JobContext, task: Task) -> Result<()> {
        let notifier = self.notifier.as_ref();
        match task {
            Task::Reminder(job) => reminder::handle(ctx, &job, notifier).await,
            Task::ScheduledMessage(job) => scheduled_message::handle(ctx, &job, notifier).await,
        }
    }

    pub fn into_handler(self) -> JobHandler {
        let runner = Arc::new(self);
        Arc::new(move |ctx| {
            let runner = Arc::clone(&runner);
            Box::pin(async move { runner.run(ctx).await })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{Broker, memory::MemoryBroker},
        job::{Job, JobState},
        notify::RecordingNotifier,
        retry::Backoff,
    };
    use serde_json::json;

    #[test]
    fn test_every_kind_round_trips() {
        for kind in TaskKind::ALL {
            assert_eq!(kind.as_str().parse::<TaskKind>().unwrap(), kind);
        }
        assert!("user.Reminder".parse::<TaskKind>().is_err());
    }

    #[test]
    fn test_task_serializes_with_type() {
        let send_at = "2024-06-03T07:30:00Z".parse().unwrap();
        let task = Task::ScheduledMessage(ScheduledMessageJob::new("c1", "Assembly at 9", send_at));
        let value = serde_json::to_value(&task).unwrap();

        assert_eq!(value["type"], "message.scheduled");
        assert_eq!(value["channelId"], "c1");
        assert_eq!(Task::from_value(&value).unwrap(), task);
    }

    #[test]
    fn test_missing_type_has_no_handler() {
        let err = Task::from_value(&json!({"userId": "u1"})).unwrap_err();
        assert!(matches!(err, QueueError::NoHandler { .. }));
    }

    #[test]
    fn test_known_type_with_bad_fields() {
        let err = Task::from_value(&json!({"type": "user.reminder", "userId": 4})).unwrap_err();
        assert!(matches!(err, QueueError::InvalidJobPayload { .. }));
    }

    #[test]
    fn test_contacts() {
        assert_eq!(
            contacts(Some("a@example.com"), Some("+15550100")),
            vec![
                Contact::Email("a@example.com".to_string()),
                Contact::WhatsApp("+15550100".to_string())
            ]
        );
        assert!(contacts(Some("  "), None).is_empty());
    }

    async fn context_for(broker: &Arc<MemoryBroker>, data: serde_json::Value) -> JobContext {
        let now = broker.now();
        let id = broker
            .enqueue(Job {
                id: String::new(),
                queue_name: "test-default".to_string(),
                name: "task".to_string(),
                data,
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
            })
            .await
            .unwrap();
        let job = broker.get_job("test-default", &id).await.unwrap().unwrap();
        JobContext::new(job, broker.clone())
    }

    #[tokio::test]
    async fn test_reminder_sends_to_every_contact() {
        let broker = Arc::new(MemoryBroker::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let runner = TaskRunner::new(notifier.clone());

        let ctx = context_for(
            &broker,
            json!({
                "type": "user.reminder",
                "userId": "u1",
                "message": "Buy milk",
                "reminderTime": "2024-06-03T07:30:00Z",
                "email": "u1@example.com",
                "phoneNumber": "+15550100"
            }),
        )
        .await;
        runner.run(ctx.clone()).await.unwrap();

        let sent = notifier.sent().await;
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|m| m.body == "Buy milk"));

        let logs = broker.get_logs("test-default", ctx.id()).await.unwrap();
        assert_eq!(
            logs,
            vec!["Sending reminder to user u1", "Reminder sent to user u1"]
        );
    }

    #[tokio::test]
    async fn test_scheduled_message_without_contacts_goes_to_channel() {
        let broker = Arc::new(MemoryBroker::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let runner = TaskRunner::new(notifier.clone());

        let ctx = context_for(
            &broker,
            json!({
                "type": "message.scheduled",
                "channelId": "grade-5",
                "message": "Assembly at 9",
                "sendAt": "2024-06-03T07:30:00Z"
            }),
        )
        .await;
        runner.run(ctx.clone()).await.unwrap();

        let sent = notifier.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, Contact::Channel("grade-5".to_string()));

        let logs = broker.get_logs("test-default", ctx.id()).await.unwrap();
        assert_eq!(logs.len(), 3);
        assert!(logs[1].contains("posting to the channel only"));
    }

    #[tokio::test]
    async fn test_delivery_error_is_returned() {
        let broker = Arc::new(MemoryBroker::new());
        let notifier = Arc::new(RecordingNotifier::new());
        notifier.fail_with("whatsapp api returned 503").await;
        let runner = TaskRunner::new(notifier.clone());

        let ctx = context_for(
            &broker,
            json!({
                "type": "user.reminder",
                "userId": "u1",
                "message": "Buy milk",
                "reminderTime": "2024-06-03T07:30:00Z",
                "phoneNumber": "+15550100"
            }),
        )
        .await;

        let err = runner.run(ctx).await.unwrap_err();
        assert!(matches!(err, QueueError::Delivery { .. }));
    }
}
