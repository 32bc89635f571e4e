use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Failure to open the upstream realtime connection. Always fatal to the
/// session.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid upstream endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("invalid upstream request header: {0}")]
    InvalidHeader(String),

    #[error("upstream rejected credentials (HTTP {status})")]
    Rejected { status: u16 },

    #[error("upstream handshake failed (HTTP {status})")]
    Status { status: u16 },

    #[error("upstream connect timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("credential unavailable: {0}")]
    Credential(#[from] upstream_auth::AuthError),

    #[error("upstream connection failed: {0}")]
    Transport(#[from] tungstenite::Error),
}

impl ConnectError {
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::Credential(_))
    }
}

/// A frame that is not a usable protocol event. Recoverable; the event is
/// dropped and the pump keeps going.
#[derive(Debug, Error)]
pub enum MalformedEvent {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("event is not a JSON object")]
    NotAnObject,

    #[error("event has no string `type` field")]
    MissingType,

    #[error("binary frames are not part of the protocol")]
    Binary,

    #[error("`{event_type}` event is missing `{field}`")]
    MissingField {
        event_type: String,
        field: &'static str,
    },
}
