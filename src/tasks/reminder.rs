//! `user.reminder`: remind one user about something at a given time.

use crate::{
    Result,
    job::JobData,
    notify::{Contact, Notifier, OutboundMessage},
    tasks::{REMINDER, contacts},
    worker::JobContext,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderJob {
    pub user_id: String,
    pub message: String,
    pub reminder_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl ReminderJob {
    pub fn new(
        user_id: impl Into<String>,
        message: impl Into<String>,
        reminder_time: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            message: message.into(),
            reminder_time,
            phone_number: None,
            email: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_phone_number(mut self, phone_number: impl Into<String>) -> Self {
        self.phone_number = Some(phone_number.into());
        self
    }
}

impl JobData for ReminderJob {
    fn job_type(&self) -> &str {
        REMINDER
    }
}

pub async fn handle(ctx: &JobContext, job: &ReminderJob, notifier: &dyn Notifier) -> Result<()> {
    ctx.log(format!("Sending reminder to user {}", job.user_id))
        .await?;

    let mut targets = contacts(job.email.as_deref(), job.phone_number.as_deref());
    if targets.is_empty() {
        warn!(job_id = %ctx.id(), user_id = %job.user_id, "Reminder has no email or phone number");
        ctx.log(format!(
            "No email or phone number for user {}, delivering to in-app inbox",
            job.user_id
        ))
        .await?;
        targets.push(Contact::User(job.user_id.clone()));
    }

    for target in targets {
        notifier
            .send(&OutboundMessage::new(target, job.message.clone()))
            .await?;
    }

    ctx.log(format!("Reminder sent to user {}", job.user_id))
        .await
}
