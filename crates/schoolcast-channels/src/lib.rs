//! # SchoolCast Channels
//! Messaging-provider plumbing.
//!
//! - [`provider::ProviderClient`] — HTTP client for the bulk-send and
//!   instance-status endpoints.
//! - [`poller::ConnectionPoller`] — watches instances and emits
//!   connect / disconnect transitions.

pub mod poller;
pub mod provider;

pub use poller::{ConnectionEvent, ConnectionPoller, TickReport};
pub use provider::ProviderClient;
