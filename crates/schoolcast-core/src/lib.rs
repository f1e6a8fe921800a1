//! # SchoolCast Core
//!
//! Shared contracts for the bulk notification dispatcher and the
//! connection poller: error taxonomy, data model, external API traits
//! and configuration.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::SchoolCastConfig;
pub use error::{Result, SchoolCastError};
pub use traits::{DispatchApi, NotificationSink, StatusApi};
pub use types::{
    BatchProgress, ConnectionResource, ConnectionStatus, DispatchParams, DispatchRequest,
    DispatchResult, Offset, StatusReport,
};
