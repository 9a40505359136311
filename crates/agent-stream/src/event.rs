//! Typed events decoded from stream records.

use serde_json::{Map, Value};

use crate::errors::ProtocolError;

const DATA_FIELD: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

/// One application event carried by a record's `data:` payload.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental fragment of free-form "thinking" text.
    AssistantChunk { content: String },
    /// Final schema-bearing payload. `fields` is passed through opaquely.
    StructuredResult { fields: Map<String, Value> },
    /// Normal end-of-stream marker.
    Complete,
    /// Server-signalled failure.
    Error {
        #[serde(default, alias = "message")]
        content: String,
    },
}

impl StreamEvent {
    /// Wire name of the event's `type` discriminator.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AssistantChunk { .. } => "assistant_chunk",
            Self::StructuredResult { .. } => "structured_result",
            Self::Complete => "complete",
            Self::Error { .. } => "error",
        }
    }
}

const KNOWN_TYPES: [&str; 4] = ["assistant_chunk", "structured_result", "complete", "error"];

/// Parses one record into an event.
///
/// Returns `Ok(None)` for records without `data:` lines (comments,
/// keep-alives) and for the `[DONE]` sentinel. An empty `data:` payload is
/// malformed. Every `Err` is a per-record diagnostic; callers drop the
/// record and keep reading.
pub fn parse_record(record: &str) -> Result<Option<StreamEvent>, ProtocolError> {
    let Some(payload) = extract_data(record) else {
        return Ok(None);
    };
    let payload = payload.trim();
    if payload == DONE_SENTINEL {
        return Ok(None);
    }
    if payload.is_empty() {
        return Err(ProtocolError::InvalidJson {
            message: "empty data payload".into(),
            payload: String::new(),
        });
    }

    let value: Value = serde_json::from_str(payload).map_err(|e| ProtocolError::InvalidJson {
        message: e.to_string(),
        payload: payload.to_string(),
    })?;
    let Some(object) = value.as_object() else {
        return Err(ProtocolError::NotAnObject);
    };
    let Some(event_type) = object.get("type").and_then(Value::as_str) else {
        return Err(ProtocolError::MissingType);
    };
    if !KNOWN_TYPES.contains(&event_type) {
        return Err(ProtocolError::UnknownType(event_type.to_string()));
    }
    let event_type = event_type.to_string();
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| ProtocolError::InvalidEvent {
            event_type,
            message: e.to_string(),
        })
}

/// Collects the `data:` lines of a record, joined with `\n`.
fn extract_data(record: &str) -> Option<String> {
    let mut data_lines: Vec<&str> = Vec::new();
    for raw_line in record.split('\n') {
        let line = raw_line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix(DATA_FIELD) {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}
