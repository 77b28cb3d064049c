//! Outbound delivery seam used by the task handlers.
//!
//! The queue only needs to know that a message can be handed to a transport
//! and that the hand-off either succeeds or fails. Real email and WhatsApp
//! transports implement [`Notifier`] outside this crate; [`SimulatedNotifier`]
//! stands in for them in the worker binary and [`RecordingNotifier`] in tests.

use crate::{QueueError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::info;

/// Where a message goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "address", rename_all = "snake_case")]
pub enum Contact {
    Email(String),
    /// Phone number reached over the WhatsApp messaging API
    WhatsApp(String),
    /// A user's in-app inbox
    User(String),
    /// An in-app channel
    Channel(String),
}

impl Contact {
    /// Transport name used in logs and delivery errors.
    pub fn channel_name(&self) -> &'static str {
        match self {
            Contact::Email(_) => "email",
            Contact::WhatsApp(_) => "whatsapp",
            Contact::User(_) => "in_app",
            Contact::Channel(_) => "channel",
        }
    }

    pub fn address(&self) -> &str {
        match self {
            Contact::Email(address)
            | Contact::WhatsApp(address)
            | Contact::User(address)
            | Contact::Channel(address) => address,
        }
    }
}

impl std::fmt::Display for Contact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.channel_name(), self.address())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub to: Contact,
    pub body: String,
}

impl OutboundMessage {
    pub fn new(to: Contact, body: impl Into<String>) -> Self {
        Self {
            to,
            body: body.into(),
        }
    }
}

/// Hands messages to an outbound transport.
///
/// Sends may be repeated for the same logical job when a worker stalls, so
/// implementations should tolerate duplicates.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<()>;
}

/// Pretends to deliver: waits a fixed latency, then logs.
#[derive(Debug, Clone)]
pub struct SimulatedNotifier {
    latency: Duration,
}

impl SimulatedNotifier {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

impl Default for SimulatedNotifier {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

#[async_trait]
impl Notifier for SimulatedNotifier {
    async fn send(&self, message: &OutboundMessage) -> Result<()> {
        tokio::time::sleep(self.latency).await;
        info!(
            channel = message.to.channel_name(),
            to = message.to.address(),
            "Delivered message"
        );
        Ok(())
    }
}

/// Keeps every message it is asked to send; can be told to fail.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<OutboundMessage>>>,
    failure: Arc<Mutex<Option<String>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following send fail with `message`.
    pub async fn fail_with(&self, message: impl Into<String>) {
        *self.failure.lock().await = Some(message.into());
    }

    pub async fn recover(&self) {
        *self.failure.lock().await = None;
    }

    pub async fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, message: &OutboundMessage) -> Result<()> {
        if let Some(reason) = self.failure.lock().await.clone() {
            return Err(QueueError::Delivery {
                channel: message.to.channel_name().to_string(),
                message: reason,
            });
        }
        self.sent.lock().await.push(message.clone());
        Ok(())
    }
}
