use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lifecycle state of one tracked upstream server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerConnectionState {
    Disconnected,
    Connecting,
    /// An OAuth flow needs user action; retries are suspended.
    AwaitingAuth,
    Connected,
    Failed,
}

/// Point-in-time connection snapshot for one server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerConnectionInfo {
    pub state: ServerConnectionState,
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ServerConnectionInfo {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: ServerConnectionState::Disconnected,
            attempt: 0,
            max_attempts,
            next_retry_at: None,
            last_error: None,
        }
    }
}
