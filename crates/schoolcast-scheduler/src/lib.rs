//! # SchoolCast Scheduler
//!
//! Rate-limited bulk notification dispatch.
//!
//! ## Architecture
//! ```text
//! DispatchController::start(params, offset)
//!   ├── batch N  → DispatchApi (offset cursor, request timeout)
//!   ├── needsBreak && hasMore → BackoffScheduler (120–180s countdown)
//!   ├── hasMore              → batch N+1 immediately
//!   └── !hasMore             → NotificationSink::notify_success
//!
//! cancel() → new run generation, break aborted, progress reset
//! ```
//!
//! Progress is published on a `tokio::sync::watch` channel; the run loop is
//! its only writer.

pub mod backoff;
pub mod dispatch;
pub mod notify;

pub use backoff::{BackoffScheduler, BreakHandle, BreakWindow};
pub use dispatch::{DispatchController, RunGeneration, RunSummary};
pub use notify::{FanoutSink, Notification, NotificationLog, NotifyLevel, WebhookSink};
