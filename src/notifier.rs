//! Incident notifications
//!
//! The engine never talks to a mail or SMS provider directly. It hands one
//! message per recipient to a [`Notifier`]; delivery failures are logged and
//! counted but never change incident state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use reqwest::Client;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::model::{Incident, Monitor};
use crate::retry::{RetryPolicy, retry};
use crate::storage::RecipientStore;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to reach notification relay: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("notification relay rejected the message with status {0}")]
    Rejected(u16),

    #[error("{0}")]
    Other(String),
}

/// External delivery channel (email, SMS, ...)
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), NotifyError>;
}

/// Writes every notification to the log instead of delivering it
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), NotifyError> {
        info!(recipient, subject, "{body}");
        Ok(())
    }
}

/// POSTs notifications as JSON to a relay that does the actual delivery
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    /// Every request is bounded by `timeout`, a relay that never answers
    /// fails the send instead of holding it open
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    #[instrument(skip(self, body))]
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), NotifyError> {
        let payload = json!({
            "to": recipient,
            "subject": subject,
            "body": body,
            "timestamp": Utc::now().to_rfc3339()
        });

        let response = self.client.post(&self.url).json(&payload).send().await?;

        if response.status().is_success() {
            debug!("notification relay accepted message");
            Ok(())
        } else {
            Err(NotifyError::Rejected(response.status().as_u16()))
        }
    }
}

/// Why recipients are being notified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Opened,
    Renotify,
    Resolved,
}

/// Delivery counts of one notification round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: usize,
    pub failed: usize,
}

fn minutes_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_minutes().max(0)
}

/// Subject and body of a notification
pub fn format_message(
    kind: NotificationKind,
    incident: &Incident,
    monitor: &Monitor,
    now: DateTime<Utc>,
) -> (String, String) {
    match kind {
        NotificationKind::Opened => (
            format!("[DOWN] {}", monitor.url),
            format!(
                "Monitor {} ({} {}) is down since {}.\nReason: {}",
                monitor.id,
                monitor.method,
                monitor.url,
                incident.opened_at.to_rfc3339(),
                incident.summary
            ),
        ),
        NotificationKind::Renotify => (
            format!("[STILL DOWN] {}", monitor.url),
            format!(
                "Monitor {} ({} {}) has been down for {} minutes.\nReason: {}",
                monitor.id,
                monitor.method,
                monitor.url,
                minutes_between(incident.opened_at, now),
                incident.summary
            ),
        ),
        NotificationKind::Resolved => {
            let resolved_at = incident.resolved_at.unwrap_or(now);
            (
                format!("[RECOVERED] {}", monitor.url),
                format!(
                    "Monitor {} ({} {}) is back up after {} minutes of downtime.",
                    monitor.id,
                    monitor.method,
                    monitor.url,
                    minutes_between(incident.opened_at, resolved_at)
                ),
            )
        }
    }
}

/// Fans one incident transition out to all recipients of the monitor
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
    recipients: Arc<dyn RecipientStore>,
    retry: RetryPolicy,
}

impl NotificationDispatcher {
    pub fn new(
        notifier: Arc<dyn Notifier>,
        recipients: Arc<dyn RecipientStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            notifier,
            recipients,
            retry,
        }
    }

    /// Send one message per recipient; best effort
    #[instrument(skip_all, fields(monitor_id = %monitor.id, ?kind))]
    pub async fn notify(
        &self,
        kind: NotificationKind,
        incident: &Incident,
        monitor: &Monitor,
        now: DateTime<Utc>,
    ) -> DispatchReport {
        let recipients = match retry("list_recipients", &self.retry, || {
            self.recipients.list_recipients(monitor.id)
        })
        .await
        {
            Ok(recipients) => recipients,
            Err(e) => {
                error!("could not load recipients, notification dropped: {e}");
                return DispatchReport::default();
            }
        };

        if recipients.is_empty() {
            debug!("monitor has no alert recipients");
            return DispatchReport::default();
        }

        let (subject, body) = format_message(kind, incident, monitor, now);

        let results = join_all(recipients.iter().map(|recipient| {
            let subject = &subject;
            let body = &body;
            async move {
                let result = self.notifier.send(&recipient.email, subject, body).await;
                if let Err(e) = &result {
                    warn!("failed to notify {}: {e}", recipient.email);
                }
                result
            }
        }))
        .await;

        let sent = results.iter().filter(|result| result.is_ok()).count();
        let report = DispatchReport {
            sent,
            failed: results.len() - sent,
        };

        info!("notified {} recipient(s), {} failed", report.sent, report.failed);
        report
    }
}
