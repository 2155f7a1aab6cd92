use std::fmt;
use thiserror::Error;

/// Transport-specific error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorCode {
    // Connection errors
    ConnectionFailed = -1000,
    ConnectionClosed = -1001,
    ConnectionTimeout = -1002,

    // Message errors
    InvalidMessage = -1101,
    MessageSendFailed = -1102,

    // SSE specific
    SseConnectionFailed = -1500,
    SseParseError = -1502,

    InvalidState = -1902,
}

impl fmt::Display for TransportErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed => write!(f, "Failed to establish connection"),
            Self::ConnectionClosed => write!(f, "Connection was closed"),
            Self::ConnectionTimeout => write!(f, "Connection timed out"),
            Self::InvalidMessage => write!(f, "Invalid message format"),
            Self::MessageSendFailed => write!(f, "Failed to send message"),
            Self::SseConnectionFailed => write!(f, "SSE connection failed"),
            Self::SseParseError => write!(f, "SSE parse error"),
            Self::InvalidState => write!(f, "Invalid state"),
        }
    }
}

/// Transport-specific error type
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("{code}: {message}")]
    Transport {
        code: TransportErrorCode,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl TransportError {
    pub fn new(code: TransportErrorCode, message: impl Into<String>) -> Self {
        Self::Transport {
            code,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        code: TransportErrorCode,
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Transport {
            code,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(TransportErrorCode::ConnectionClosed, message)
    }

    pub fn not_opened() -> Self {
        Self::new(TransportErrorCode::InvalidState, "Transport not opened")
    }

    pub fn code(&self) -> Option<TransportErrorCode> {
        match self {
            Self::Transport { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether the peer is gone for good, as opposed to a single bad frame.
    pub fn is_closed(&self) -> bool {
        match self {
            Self::Transport { code, .. } => *code == TransportErrorCode::ConnectionClosed,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
