//! Gateway error types.

use thiserror::Error;

/// Errors talking to an instance's control endpoint.
///
/// `Clone` because one construction outcome is shared by every caller
/// waiting on the same connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// The call or subscription timed out, or the request itself was malformed.
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("{path} returned status {status}")]
    Status { status: u16, path: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("event stream closed")]
    Closed,

    #[error("connection cancelled")]
    Cancelled,
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
