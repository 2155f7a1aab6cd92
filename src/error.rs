use std::time::Duration;
use thiserror::Error;

use crate::client::SessionState;
use crate::transport::TransportError;

/// Errors surfaced by the registry, the session layer and the server runtime.
#[derive(Error, Debug)]
pub enum McpError {
    #[error("Tool `{0}` is already registered")]
    DuplicateTool(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Tool `{tool}` failed: {message}")]
    RemoteTool { tool: String, message: String },

    /// An error payload for a request other than a tool call.
    #[error("Remote error {code}: {message}")]
    Rpc { code: i32, message: String },

    #[error("Transport closed before a response arrived")]
    TransportClosed,

    #[error("Session closed")]
    SessionClosed,

    #[error("Session is not ready (state: {0:?})")]
    NotReady(SessionState),

    #[error("Request `{method}` timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error(transparent)]
    Transport(TransportError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<TransportError> for McpError {
    fn from(err: TransportError) -> Self {
        if err.is_closed() {
            Self::TransportClosed
        } else {
            Self::Transport(err)
        }
    }
}
