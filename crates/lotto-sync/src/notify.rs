//! Outbound result notifications.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use lotto_core::{format_api_date, EvaluationResult};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info};

pub const NOTIFICATION_SUBJECT: &str = "Mega-Sena results";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub subject: String,
    pub body: String,
    pub recipient: String,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("notification sink returned http {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("notification sink unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// One message covering every newly recorded result of a run.
pub fn render_results_notification(
    evaluation_date: NaiveDate,
    results: &[EvaluationResult],
    recipient: &str,
) -> Notification {
    let mut body = format!(
        "Results for draw of {}:\n\n",
        format_api_date(evaluation_date)
    );
    for result in results {
        body.push_str(&format!(
            "Selection: {} | Hits: {} | Prize: {}\n",
            result.selection_key,
            result.hit_count,
            result.tier()
        ));
    }
    Notification {
        subject: NOTIFICATION_SUBJECT.to_string(),
        body,
        recipient: recipient.to_string(),
    }
}

/// Posts notifications as JSON `{subject, body, recipient}` to a webhook relay.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    webhook_url: String,
}

impl WebhookNotifier {
    /// `timeout` bounds each delivery; expiry surfaces as [`NotifyError::Request`].
    pub fn new(webhook_url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            webhook_url: webhook_url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(&self.webhook_url)
            .json(notification)
            .send()
            .await
            .map_err(|e| {
                error!("notification request failed: {e}");
                NotifyError::Request(e)
            })?;

        let status = resp.status();
        if status.is_success() {
            debug!(recipient = %notification.recipient, "notification delivered");
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        error!("notification sink rejected message: {} - {}", status, body);
        Err(NotifyError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// Writes notifications to the log instead of delivering them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            recipient = %notification.recipient,
            subject = %notification.subject,
            "notification (log only):\n{}",
            notification.body
        );
        Ok(())
    }
}
