//! Provider backend traits — the Dispatch API and the Status API.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{DispatchRequest, DispatchResult, StatusReport};

/// Sends one batch of pending notifications.
///
/// `request.offset` is the cursor returned by the previous batch, passed
/// back verbatim. Implementations report transport problems as
/// `SchoolCastError::Network` and malformed bodies as `SchoolCastError::Validation`.
#[async_trait]
pub trait DispatchApi: Send + Sync {
    async fn dispatch_batch(&self, request: &DispatchRequest) -> Result<DispatchResult>;
}

/// Reads the connection status of one messaging-channel instance.
#[async_trait]
pub trait StatusApi: Send + Sync {
    async fn fetch_status(&self, resource_id: &str) -> Result<StatusReport>;
}
