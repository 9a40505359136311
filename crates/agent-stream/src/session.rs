use std::fmt;

use serde_json::{Map, Value};

use crate::errors::{ProtocolError, SessionError};
use crate::event::StreamEvent;

/// Generation identifier. Consumers allocate these in increasing order and
/// drop callbacks whose id is no longer current.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Returns the id that follows this one.
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SessionId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Coarse lifecycle state of a session.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Streaming,
    Complete,
    Errored,
    Cancelled,
}

impl Phase {
    /// `Complete`, `Errored` and `Cancelled` are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Errored | Self::Cancelled)
    }
}

/// Outcome of applying one event to a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    /// The session changed; consumers are notified.
    Applied,
    /// Late or out-of-phase event; nothing changed.
    Ignored,
    /// The event broke a protocol rule; nothing changed.
    Violation(ProtocolError),
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// State of one generation request.
///
/// Only the methods below mutate a session, so the phase rules hold for
/// every holder of a `StreamSession` value.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StreamSession {
    id: SessionId,
    phase: Phase,
    accumulated_text: String,
    structured_fields: Option<Map<String, Value>>,
    error: Option<SessionError>,
}

impl StreamSession {
    /// Creates an `Idle` session.
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            phase: Phase::Idle,
            accumulated_text: String::new(),
            structured_fields: None,
            error: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Text streamed so far. Preserved on failure and cancellation.
    pub fn accumulated_text(&self) -> &str {
        &self.accumulated_text
    }

    pub fn structured_fields(&self) -> Option<&Map<String, Value>> {
        self.structured_fields.as_ref()
    }

    pub fn error(&self) -> Option<&SessionError> {
        self.error.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Whether this session belongs to the generation `current`.
    pub fn is_current_for(&self, current: SessionId) -> bool {
        self.id == current
    }

    /// Decodes the structured fields into a tool-specific shape.
    ///
    /// Returns `Ok(None)` when no structured result arrived.
    pub fn decode_fields<T: serde::de::DeserializeOwned>(
        &self,
    ) -> Result<Option<T>, serde_json::Error> {
        self.structured_fields
            .as_ref()
            .map(|fields| serde_json::from_value(Value::Object(fields.clone())))
            .transpose()
    }

    /// `Idle -> Streaming`. Returns whether the phase changed.
    pub fn begin_streaming(&mut self) -> bool {
        if self.phase != Phase::Idle {
            return false;
        }
        self.phase = Phase::Streaming;
        true
    }

    /// Records a fatal error unless the session is already terminal.
    pub fn fail(&mut self, error: SessionError) -> bool {
        if self.phase.is_terminal() {
            return false;
        }
        self.error = Some(error);
        self.phase = Phase::Errored;
        true
    }

    /// Moves a live session to `Cancelled`. Terminal sessions keep their phase.
    pub fn cancel(&mut self) -> bool {
        if self.phase.is_terminal() {
            return false;
        }
        self.phase = Phase::Cancelled;
        true
    }

    /// Applies one parsed event.
    pub fn apply(&mut self, event: StreamEvent) -> Transition {
        match event {
            StreamEvent::AssistantChunk { content } => {
                if self.phase != Phase::Streaming {
                    return Transition::Ignored;
                }
                self.accumulated_text.push_str(&content);
                Transition::Applied
            }
            StreamEvent::StructuredResult { fields } => {
                if self.structured_fields.is_some() {
                    return Transition::Violation(ProtocolError::DuplicateStructuredResult);
                }
                if self.phase != Phase::Streaming {
                    return Transition::Ignored;
                }
                self.structured_fields = Some(fields);
                self.phase = Phase::Complete;
                Transition::Applied
            }
            StreamEvent::Complete => {
                if self.phase != Phase::Streaming {
                    return Transition::Ignored;
                }
                self.phase = Phase::Complete;
                Transition::Applied
            }
            StreamEvent::Error { content } => {
                if self.fail(SessionError::application(content)) {
                    Transition::Applied
                } else {
                    Transition::Ignored
                }
            }
        }
    }
}
