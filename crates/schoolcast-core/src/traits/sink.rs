//! User-facing notification surface (toasts, logs, webhooks).

/// Fire-and-forget reporting. Nothing returned by a sink is consumed.
pub trait NotificationSink: Send + Sync {
    fn notify_success(&self, summary: &str);
    fn notify_failure(&self, reason: &str);
    fn notify_warning(&self, message: &str);
}
