//! Data model shared by the dispatcher and the poller.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Result, SchoolCastError};

/// Opaque server cursor. Round-tripped verbatim, never interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Offset(String);

impl Offset {
    pub fn new(cursor: impl Into<String>) -> Self {
        Self(cursor.into())
    }

    /// Cursor for the first batch of a run.
    pub fn start() -> Self {
        Self("0".into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for Offset {
    fn default() -> Self {
        Self::start()
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Offset {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Offset {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// Servers send the cursor either as a JSON string or a bare number.
impl<'de> Deserialize<'de> for Offset {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawCursor {
            Text(String),
            Number(serde_json::Number),
        }

        Ok(match RawCursor::deserialize(deserializer)? {
            RawCursor::Text(s) => Self(s),
            RawCursor::Number(n) => Self(n.to_string()),
        })
    }
}

/// Parameters fixed for the whole dispatch run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchParams {
    /// Which recipients the server should select (class, grade, "all", ...).
    pub filter_key: String,
    /// Skip recipients that already received this notification.
    pub skip_already_sent: bool,
}

impl DispatchParams {
    pub fn new(filter_key: impl Into<String>, skip_already_sent: bool) -> Self {
        Self {
            filter_key: filter_key.into(),
            skip_already_sent,
        }
    }
}

/// Input to one batch call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub filter_key: String,
    pub skip_already_sent: bool,
    pub offset: Offset,
}

impl DispatchRequest {
    pub fn new(params: &DispatchParams, offset: Offset) -> Self {
        Self {
            filter_key: params.filter_key.clone(),
            skip_already_sent: params.skip_already_sent,
            offset,
        }
    }
}

/// Output of one batch call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResult {
    pub total_eligible: u64,
    #[serde(default)]
    pub sent: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub skipped: u64,
    #[serde(default)]
    pub next_offset: Option<Offset>,
    pub has_more: bool,
    /// Set by the server once the sends of the current run cross its break threshold.
    #[serde(default)]
    pub needs_break: bool,
}

/// Cumulative progress of one dispatch run.
///
/// Counters never decrease within a run. `sent + failed + skipped` never
/// exceeds `total_messages` after a successful [`merge`](Self::merge).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub total_messages: u64,
    pub sent_messages: u64,
    pub failed_messages: u64,
    pub skipped_messages: u64,
    pub current_offset: Offset,
    pub is_on_break: bool,
    pub break_time_remaining: u64,
    pub is_completed: bool,
}

impl BatchProgress {
    /// Fresh progress for a run resuming at `offset`.
    pub fn starting_at(offset: Offset) -> Self {
        Self {
            current_offset: offset,
            ..Self::default()
        }
    }

    pub fn processed(&self) -> u64 {
        self.sent_messages + self.failed_messages + self.skipped_messages
    }

    /// Fold one batch result into the run totals, returning the new progress.
    pub fn merge(&self, result: &DispatchResult) -> Result<Self> {
        let total_messages = self.total_messages.max(result.total_eligible);
        let sent_messages = self.sent_messages.saturating_add(result.sent);
        let failed_messages = self.failed_messages.saturating_add(result.failed);
        let skipped_messages = self.skipped_messages.saturating_add(result.skipped);

        let processed = sent_messages
            .saturating_add(failed_messages)
            .saturating_add(skipped_messages);
        if processed > total_messages {
            return Err(SchoolCastError::Validation(format!(
                "server reported {processed} processed messages but only {total_messages} are eligible"
            )));
        }

        let next_offset = match &result.next_offset {
            Some(cursor) if !cursor.is_empty() => Some(cursor.clone()),
            _ => None,
        };
        if result.has_more && next_offset.is_none() {
            return Err(SchoolCastError::Validation(
                "server reported more batches without a next offset".into(),
            ));
        }

        Ok(Self {
            total_messages,
            sent_messages,
            failed_messages,
            skipped_messages,
            current_offset: next_offset.unwrap_or_else(|| self.current_offset.clone()),
            is_on_break: false,
            break_time_remaining: 0,
            is_completed: !result.has_more,
        })
    }
}

/// Connection status of a messaging-channel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Body returned by the Status API for one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: ConnectionStatus,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub last_connected_at: Option<DateTime<Utc>>,
}

/// Last known state of a watched instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionResource {
    pub id: String,
    pub status: ConnectionStatus,
    pub phone_number: Option<String>,
    pub last_connected_at: Option<DateTime<Utc>>,
}

impl ConnectionResource {
    pub fn from_report(id: &str, report: StatusReport) -> Self {
        Self {
            id: id.to_string(),
            status: report.status,
            phone_number: report.phone_number,
            last_connected_at: report.last_connected_at,
        }
    }

    /// Whether the attached metadata (not the status) differs.
    pub fn metadata_differs(&self, other: &Self) -> bool {
        self.phone_number != other.phone_number || self.last_connected_at != other.last_connected_at
    }
}
