//! `message.scheduled`: post a message to a channel at a given time.

use crate::{
    Result,
    job::JobData,
    notify::{Contact, Notifier, OutboundMessage},
    tasks::{SCHEDULED_MESSAGE, contacts},
    worker::JobContext,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledMessageJob {
    pub channel_id: String,
    pub message: String,
    pub send_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl ScheduledMessageJob {
    pub fn new(
        channel_id: impl Into<String>,
        message: impl Into<String>,
        send_at: DateTime<Utc>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            message: message.into(),
            send_at,
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

impl JobData for ScheduledMessageJob {
    fn job_type(&self) -> &str {
        SCHEDULED_MESSAGE
    }
}

pub async fn handle(
    ctx: &JobContext,
    job: &ScheduledMessageJob,
    notifier: &dyn Notifier,
) -> Result<()> {
    ctx.log(format!("Sending scheduled message to channel {}", job.channel_id))
        .await?;

    let mut targets = contacts(job.email.as_deref(), job.phone_number.as_deref());
    if targets.is_empty() {
        warn!(job_id = %ctx.id(), channel_id = %job.channel_id, "Scheduled message has no email or phone number");
        ctx.log(format!(
            "No email or phone number for channel {}, posting to the channel only",
            job.channel_id
        ))
        .await?;
        targets.push(Contact::Channel(job.channel_id.clone()));
    }

    for target in targets {
        notifier
            .send(&OutboundMessage::new(target, job.message.clone()))
            .await?;
    }

    ctx.log(format!("Scheduled message sent to channel {}", job.channel_id))
        .await
}
