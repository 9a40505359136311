/// Fatal failure recorded on a `StreamSession` when it enters `Phase::Errored`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionError {
    /// Non-success status, connection failure, body read failure or idle timeout.
    #[error("transport failure: {message}")]
    Transport {
        status: Option<u16>,
        message: String,
    },
    /// The backend sent a well-formed `error` event.
    #[error("backend error: {message}")]
    Application { message: String },
    /// The stream violated the protocol in a way the session cannot recover from.
    #[error("protocol failure: {message}")]
    Protocol { message: String },
}

impl SessionError {
    /// Creates a transport failure with an optional HTTP status.
    pub fn transport(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Transport {
            status,
            message: message.into(),
        }
    }

    /// Creates a backend-signalled failure.
    pub fn application(message: impl Into<String>) -> Self {
        Self::Application {
            message: message.into(),
        }
    }

    /// Creates a protocol-fatal failure.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Returns the HTTP status attached to a transport failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport { status, .. } => *status,
            _ => None,
        }
    }

    /// Returns the human-readable message for this error.
    pub fn message(&self) -> &str {
        match self {
            Self::Transport { message, .. }
            | Self::Application { message }
            | Self::Protocol { message } => message,
        }
    }
}

/// Non-fatal problem with a single record. The record is dropped and the
/// stream keeps going.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("record payload is not valid JSON: {message}")]
    InvalidJson { message: String, payload: String },
    #[error("record payload is not a JSON object")]
    NotAnObject,
    #[error("record payload has no string `type` field")]
    MissingType,
    #[error("unrecognized event type `{0}`")]
    UnknownType(String),
    #[error("malformed `{event_type}` event: {message}")]
    InvalidEvent { event_type: String, message: String },
    #[error("second structured_result ignored; fields were already set")]
    DuplicateStructuredResult,
    #[error("stream ended inside an undelimited record ({len} bytes dropped)")]
    TruncatedRecord { len: usize },
}

impl ProtocolError {
    /// Unknown event types are expected when the backend is newer than the
    /// client, so they are reported quietly.
    pub fn is_forward_compatible(&self) -> bool {
        matches!(self, Self::UnknownType(_))
    }
}

/// Failure while reading the response body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(value: reqwest::Error) -> Self {
        Self(value.to_string())
    }
}

/// Top-level error type for operations that fail before or outside a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Invalid client configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid request supplied by the caller.
    #[error("validation error: {0}")]
    Validation(String),
    /// The task driving a session ended without producing a final session.
    #[error("session task failed: {0}")]
    Task(String),
}
