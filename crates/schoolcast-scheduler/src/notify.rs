//! Notification sinks — where run outcomes are reported.
//! Lightweight: no queues. Log it, remember the last few, optionally POST it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use schoolcast_core::traits::NotificationSink;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

const HISTORY_LIMIT: usize = 100;

/// A reported outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub level: NotifyLevel,
    pub message: String,
    /// Which component reported it.
    pub source: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Notification {
    pub fn new(level: NotifyLevel, message: &str, source: &str) -> Self {
        Self {
            level,
            message: message.to_string(),
            source: source.to_string(),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Notification severity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotifyLevel {
    Success,
    Failure,
    Warning,
}

/// Logs every notification and keeps the last 100 in memory.
pub struct NotificationLog {
    source: String,
    history: Mutex<VecDeque<Notification>>,
}

impl NotificationLog {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LIMIT)),
        }
    }

    /// Record a notification in history.
    pub fn record(&self, level: NotifyLevel, message: &str) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.push_back(Notification::new(level, message, &self.source));
        // Ring buffer: keep the last 100
        if history.len() > HISTORY_LIMIT {
            history.pop_front();
        }
    }

    /// Get notification history, oldest first.
    pub fn history(&self) -> Vec<Notification> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn count(&self, level: NotifyLevel) -> usize {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|n| n.level == level)
            .count()
    }
}

impl NotificationSink for NotificationLog {
    fn notify_success(&self, summary: &str) {
        tracing::info!("✅ [{}] {}", self.source, summary);
        self.record(NotifyLevel::Success, summary);
    }

    fn notify_failure(&self, reason: &str) {
        tracing::error!("❌ [{}] {}", self.source, reason);
        self.record(NotifyLevel::Failure, reason);
    }

    fn notify_warning(&self, message: &str) {
        tracing::warn!("⚠️ [{}] {}", self.source, message);
        self.record(NotifyLevel::Warning, message);
    }
}

/// Generic HTTP webhook: POST with JSON body, on a background task.
/// Delivery errors are logged and otherwise ignored. Call [`flush`] before
/// the runtime shuts down, or deliveries still in flight are lost.
///
/// [`flush`]: WebhookSink::flush
pub struct WebhookSink {
    url: String,
    source: String,
    client: reqwest::Client,
    pending: Mutex<JoinSet<()>>,
}

impl WebhookSink {
    pub fn new(url: &str, source: &str) -> Self {
        Self {
            url: url.to_string(),
            source: source.to_string(),
            client: reqwest::Client::new(),
            pending: Mutex::new(JoinSet::new()),
        }
    }

    /// Wait up to `timeout` for deliveries still in flight.
    /// Returns how many were abandoned.
    pub async fn flush(&self, timeout: Duration) -> usize {
        let mut pending =
            std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));
        let drained = tokio::time::timeout(timeout, async {
            while pending.join_next().await.is_some() {}
        })
        .await;
        if drained.is_ok() {
            return 0;
        }
        let abandoned = pending.len();
        tracing::warn!(
            "⚠️ Dropping {} webhook notification(s) still pending after {:?}",
            abandoned,
            timeout
        );
        abandoned
    }

    fn post(&self, level: NotifyLevel, message: &str) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("⚠️ Webhook notification dropped: no async runtime");
            return;
        };
        let notification = Notification::new(level, message, &self.source);
        let request = self
            .client
            .post(&self.url)
            .json(&notification)
            .timeout(Duration::from_secs(10));
        let url = self.url.clone();

        let delivery = async move {
            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!("📡 Webhook notification sent to {}", url);
                }
                Ok(resp) => {
                    tracing::warn!("⚠️ Webhook {} answered {}", url, resp.status());
                }
                Err(e) => {
                    tracing::warn!("⚠️ Webhook send to {} failed: {e}", url);
                }
            }
        };

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        while pending.try_join_next().is_some() {}
        pending.spawn_on(delivery, &runtime);
    }
}

impl NotificationSink for WebhookSink {
    fn notify_success(&self, summary: &str) {
        self.post(NotifyLevel::Success, summary);
    }

    fn notify_failure(&self, reason: &str) {
        self.post(NotifyLevel::Failure, reason);
    }

    fn notify_warning(&self, message: &str) {
        self.post(NotifyLevel::Warning, message);
    }
}

/// Forwards every notification to each registered sink in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl NotificationSink for FanoutSink {
    fn notify_success(&self, summary: &str) {
        for sink in &self.sinks {
            sink.notify_success(summary);
        }
    }

    fn notify_failure(&self, reason: &str) {
        for sink in &self.sinks {
            sink.notify_failure(reason);
        }
    }

    fn notify_warning(&self, message: &str) {
        for sink in &self.sinks {
            sink.notify_warning(message);
        }
    }
}
