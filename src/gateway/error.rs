//! Uniform error shape for everything that crosses the backend boundary.

use thiserror::Error;

/// Normalized gateway failure.
///
/// Every transport, HTTP, and decode failure collapses into one of these
/// variants so retry classification never has to inspect raw `reqwest`
/// errors. `Server` is a 5xx, `Rejected` is any other 4xx; a 401 is its own
/// variant because the session collaborator owns it and it is never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// No response was received at all.
    #[error("network error: {0}")]
    Network(String),

    /// The request hit the fixed upper-bound timeout.
    #[error("request timed out")]
    Timeout,

    /// HTTP 401; the bearer credential is no longer valid.
    #[error("session expired")]
    SessionExpired,

    /// HTTP 5xx with the most specific message the body carried.
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// HTTP 4xx (validation / business rejection). Terminal.
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The response arrived but its payload did not match the contract.
    #[error("malformed response: {0}")]
    Decode(String),
}

impl GatewayError {
    /// The backend's own message, when one was present in the error body.
    /// Used to surface business errors verbatim over generic failure text.
    pub fn business_message(&self) -> Option<&str> {
        match self {
            GatewayError::Server { message, .. } | GatewayError::Rejected { message, .. }
                if !message.is_empty() =>
            {
                Some(message)
            }
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::Server { status, .. } | GatewayError::Rejected { status, .. } => {
                Some(*status)
            }
            GatewayError::SessionExpired => Some(401),
            _ => None,
        }
    }
}
