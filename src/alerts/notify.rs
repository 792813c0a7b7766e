//! Notification delivery adaptors.
//!
//! The alert manager holds notifiers by capability; which concrete gateways
//! exist is a wiring decision. The in-app adaptor is fully in-memory; the
//! email/sms/slack adaptors shipped here are logging simulators standing in
//! for real gateway clients, which live outside this crate.

use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::types::{Alert, NotificationChannel};

/// Successful delivery, with the channel-specific recipient.
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub recipient: String,
}

/// Failed delivery on one channel. Captured into the alert's notification
/// list; never fails the lifecycle call that triggered it.
#[derive(Debug, Clone, Error)]
#[error("{channel} delivery failed: {message}")]
pub struct ChannelDeliveryError {
    pub channel: NotificationChannel,
    pub message: String,
}

/// A delivery adaptor for one channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn channel(&self) -> NotificationChannel;

    async fn send(&self, alert: &Alert) -> Result<DeliveryReceipt, ChannelDeliveryError>;
}

/// A delivered in-app message.
#[derive(Debug, Clone)]
pub struct InAppMessage {
    pub alert_id: String,
    pub severity: String,
    pub body: String,
}

/// In-app channel: an in-memory inbox the operations console polls.
#[derive(Default)]
pub struct InAppNotifier {
    inbox: Mutex<Vec<InAppMessage>>,
}

impl InAppNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<InAppMessage> {
        self.inbox
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Notifier for InAppNotifier {
    fn channel(&self) -> NotificationChannel {
        NotificationChannel::InApp
    }

    async fn send(&self, alert: &Alert) -> Result<DeliveryReceipt, ChannelDeliveryError> {
        let body = format!(
            "Leak alert {} at {} — severity {}, probability {:.0}%",
            alert.id,
            alert.location.as_deref().unwrap_or("unknown location"),
            alert.severity,
            alert.probability
        );
        self.inbox
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(InAppMessage {
                alert_id: alert.id.clone(),
                severity: alert.severity.to_string(),
                body,
            });
        Ok(DeliveryReceipt {
            recipient: "operations-console".to_string(),
        })
    }
}

/// Logging stand-in for an external gateway (email/sms/slack).
pub struct LogNotifier {
    channel: NotificationChannel,
    recipient: String,
}

impl LogNotifier {
    pub fn new(channel: NotificationChannel, recipient: &str) -> Self {
        Self {
            channel,
            recipient: recipient.to_string(),
        }
    }

    pub fn email(recipient: &str) -> Self {
        Self::new(NotificationChannel::Email, recipient)
    }

    pub fn sms(recipient: &str) -> Self {
        Self::new(NotificationChannel::Sms, recipient)
    }

    pub fn slack(channel_name: &str) -> Self {
        Self::new(NotificationChannel::Slack, channel_name)
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    fn channel(&self) -> NotificationChannel {
        self.channel
    }

    async fn send(&self, alert: &Alert) -> Result<DeliveryReceipt, ChannelDeliveryError> {
        info!(
            channel = %self.channel,
            recipient = %self.recipient,
            alert = %alert.id,
            severity = %alert.severity,
            "Notification dispatched"
        );
        Ok(DeliveryReceipt {
            recipient: self.recipient.clone(),
        })
    }
}
