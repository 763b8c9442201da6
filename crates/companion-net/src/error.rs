//! Error taxonomy for the protocol engine.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::framing::FrameError;
use crate::limiter::LimiterError;
use crate::messages::MessageError;
use crate::transport::TransportError;

/// Error code carried in a reply's error field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerError {
    NotFound,
    AccessDenied,
    NoTeam,
    NoPlayer,
    InvalidPlayerId,
    InvalidId,
    InvalidMotion,
    MessageNotSent,
    Banned,
    Internal,
    /// Server-side rejection because too many requests were sent.
    RateLimit,
    /// Any code this client does not know by name.
    Other(String),
}

impl ServerError {
    /// Parse a wire error code. An empty code means "no error".
    pub fn from_code(code: &str) -> Option<Self> {
        let err = match code {
            "" => return None,
            "not_found" => Self::NotFound,
            "access_denied" => Self::AccessDenied,
            "no_team" => Self::NoTeam,
            "no_player" => Self::NoPlayer,
            "invalid_playerid" => Self::InvalidPlayerId,
            "invalid_id" => Self::InvalidId,
            "invalid_motion" => Self::InvalidMotion,
            "message_not_sent" => Self::MessageNotSent,
            "banned" => Self::Banned,
            "server_error" => Self::Internal,
            "rate_limit" => Self::RateLimit,
            other => Self::Other(other.to_string()),
        };
        Some(err)
    }

    /// Wire representation of this code.
    pub fn code(&self) -> &str {
        match self {
            Self::NotFound => "not_found",
            Self::AccessDenied => "access_denied",
            Self::NoTeam => "no_team",
            Self::NoPlayer => "no_player",
            Self::InvalidPlayerId => "invalid_playerid",
            Self::InvalidId => "invalid_id",
            Self::InvalidMotion => "invalid_motion",
            Self::MessageNotSent => "message_not_sent",
            Self::Banned => "banned",
            Self::Internal => "server_error",
            Self::RateLimit => "rate_limit",
            Self::Other(code) => code,
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Errors surfaced by [`crate::CompanionClient`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// A required setting was missing or invalid at construction.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A send was attempted while the connection is not open.
    #[error("not connected to the server")]
    NotConnected,

    /// The local token bucket is empty and the client is set to fail fast.
    #[error("rate limit reached: out of tokens")]
    AdmissionRejected,

    /// The server answered with an error code.
    #[error("server rejected request: {0}")]
    ServerRejected(ServerError),

    /// Entity metadata resolution failed; no listener was registered.
    #[error("entity {0} could not be registered")]
    SubscriptionFailed(u32),

    /// The client was built against the fixed test endpoint.
    #[error("cannot switch endpoint while using the test server")]
    EndpointSwitchDisallowed,

    /// No reply arrived within the configured resend budget.
    #[error("no response received for request {0}")]
    ResponseNotReceived(u32),

    /// The server refused every connection attempt.
    #[error("server {0} is not responding")]
    ServerNotResponsive(String),

    /// The reply carried a payload of the wrong kind for the request.
    #[error("unexpected response payload for request {0}")]
    UnexpectedResponse(u32),

    /// A conversation ended before all prompts were answered.
    #[error("conversation with {0} was aborted")]
    ConversationAborted(u64),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Limiter(#[from] LimiterError),
}

impl From<FrameError> for ClientError {
    fn from(err: FrameError) -> Self {
        Self::Transport(TransportError::Frame(err))
    }
}

impl From<postcard::Error> for ClientError {
    fn from(err: postcard::Error) -> Self {
        Self::Message(MessageError::Postcard(err))
    }
}
