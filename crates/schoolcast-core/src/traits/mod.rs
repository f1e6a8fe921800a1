//! Seams to the outside world: the messaging provider backend and the
//! user-facing notification surface.

pub mod provider;
pub mod sink;

pub use provider::{DispatchApi, StatusApi};
pub use sink::NotificationSink;
