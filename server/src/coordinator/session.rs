//! Active-session record and per-connection state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::spawn::{EnvFileGuard, SessionProcess};

/// Per-connection lifecycle state. A connection that closes is simply removed
/// from the client map; there is no explicit `ended` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connected,
    Queued,
    Active,
}

/// Why a session ended. Carried on `session_ended` frames, metric labels, and
/// audit entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Timeout,
    ContainerExit,
    Disconnected,
    Shutdown,
    UserEnded,
    Error,
}

impl EndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ContainerExit => "container_exit",
            Self::Disconnected => "disconnected",
            Self::Shutdown => "shutdown",
            Self::UserEnded => "user_ended",
            Self::Error => "error",
        }
    }
}

/// A pending-token map entry: issued at queue admission, consumed at session
/// start.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub client_id: String,
    pub invite_token: Option<String>,
    pub source_address: String,
    pub created_at: DateTime<Utc>,
}

/// The at-most-one active session.
pub struct ActiveSession {
    pub session_id: String,
    /// Holder's client id. Reassigned on reconnect takeover.
    pub client_id: String,
    pub session_token: String,
    pub invite_token: Option<String>,
    /// Identity used for reconnect-eligibility checks.
    pub source_address: String,
    pub user_agent: Option<String>,
    pub started_at: Instant,
    pub started_at_utc: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub queue_wait_ms: u64,
    pub process: SessionProcess,
    /// Deleted on every session-end path.
    pub env_file: Option<EnvFileGuard>,
    pub awaiting_reconnect: bool,
    pub disconnected_at: Option<Instant>,
    /// Bumped on every disconnect; a grace timer only fires for its own epoch.
    pub grace_epoch: u64,
    /// Collected for the end-of-session audit entry.
    pub errors: Vec<String>,
}
