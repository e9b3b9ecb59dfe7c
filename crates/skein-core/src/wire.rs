//! Line-delimited wire format.
//!
//! One JSON object per line:
//! `{"type", "thread_id", "sequence", "timestamp", "run_id"?, "task_id"?, "payload"?}`.
//! The same lines travel as NDJSON or as SSE `data:` frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::WireError;
use crate::events::{Envelope, Event};
use crate::ids::{RunId, TaskId, ThreadId};

/// Flat representation used for (de)serializing [`Envelope`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub thread_id: ThreadId,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl From<Envelope> for WireEnvelope {
    fn from(env: Envelope) -> Self {
        let kind = env.event.kind().to_owned();
        let payload = match serde_json::to_value(&env.event) {
            Ok(Value::Object(mut map)) => map.remove("payload").unwrap_or(Value::Null),
            _ => Value::Null,
        };
        Self {
            kind,
            thread_id: env.thread_id,
            sequence: env.sequence,
            timestamp: env.timestamp,
            run_id: env.run_id,
            task_id: env.task_id,
            payload,
        }
    }
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = WireError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        if !Event::is_known_kind(&wire.kind) {
            return Err(WireError::UnknownType(wire.kind));
        }
        let mut map = Map::new();
        map.insert("type".into(), Value::String(wire.kind.clone()));
        if !wire.payload.is_null() {
            map.insert("payload".into(), wire.payload);
        }
        let event: Event = serde_json::from_value(Value::Object(map)).map_err(|source| WireError::Payload {
            kind: wire.kind.clone(),
            source,
        })?;
        Ok(Self {
            thread_id: wire.thread_id,
            sequence: wire.sequence,
            timestamp: wire.timestamp,
            run_id: wire.run_id,
            task_id: wire.task_id,
            event,
        })
    }
}

/// One decoded line.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Event(Envelope),
    /// A well-formed envelope whose `type` this build does not know.
    /// Still advances sequence tracking.
    Unknown {
        kind: String,
        thread_id: ThreadId,
        sequence: u64,
    },
}

impl Frame {
    pub fn sequence(&self) -> u64 {
        match self {
            Self::Event(env) => env.sequence,
            Self::Unknown { sequence, .. } => *sequence,
        }
    }
}

/// Decode one NDJSON or SSE line. Blank lines, SSE comments and SSE
/// `id:`/`event:` fields yield `Ok(None)`.
pub fn decode_line(line: &str) -> Result<Option<Frame>, WireError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') || line.starts_with("id:") || line.starts_with("event:") {
        return Ok(None);
    }
    let body = line.strip_prefix("data:").map(str::trim_start).unwrap_or(line);
    if body.is_empty() {
        return Ok(None);
    }

    let wire: WireEnvelope = serde_json::from_str(body)?;
    if !Event::is_known_kind(&wire.kind) {
        return Ok(Some(Frame::Unknown {
            kind: wire.kind,
            thread_id: wire.thread_id,
            sequence: wire.sequence,
        }));
    }
    Envelope::try_from(wire).map(|env| Some(Frame::Event(env)))
}

/// Encode an envelope as one NDJSON line, newline included.
pub fn encode_line(env: &Envelope) -> Result<String, WireError> {
    let mut line = serde_json::to_string(env)?;
    line.push('\n');
    Ok(line)
}

/// Encode an envelope as an SSE frame with the sequence as event id.
pub fn encode_sse(env: &Envelope) -> Result<String, WireError> {
    let json = serde_json::to_string(env)?;
    Ok(format!("id: {}\ndata: {}\n\n", env.sequence, json))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::events::{Origin, StateSnapshot};
    use crate::usage::TokenUsage;

    fn origin() -> Origin {
        Origin::thread(ThreadId::from("thread-1")).with_run(RunId::from("run-1"))
    }

    #[test]
    fn unit_variant_omits_payload() {
        let env = Envelope::new(&origin(), 0, Event::Keepalive);
        let line = encode_line(&env).unwrap();
        let value: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["type"], "keepalive");
        assert_eq!(value["sequence"], 0);
        assert!(value.get("payload").is_none());
        assert!(value.get("task_id").is_none());
    }

    #[test]
    fn generation_end_survives_the_wire() {
        let env = Envelope::new(
            &origin(),
            7,
            Event::GenerationEnd {
                model: "claude-sonnet-4".into(),
                output_preview: "done".into(),
                usage: TokenUsage {
                    input_tokens: 120,
                    output_tokens: 30,
                    ..Default::default()
                },
                tool_calls: vec![],
                call_id: Some("call-1".into()),
                duration_ms: Some(900),
                time_to_first_token_ms: Some(200),
            },
        );
        let line = encode_line(&env).unwrap();
        let frame = decode_line(&line).unwrap().unwrap();
        assert_eq!(frame, Frame::Event(env));
    }

    #[test]
    fn unknown_type_is_forward_compatible() {
        let line = r#"{"type":"cache_hit","thread_id":"t","sequence":4,"timestamp":"2025-01-01T00:00:00Z","payload":{"x":1}}"#;
        match decode_line(line).unwrap() {
            Some(Frame::Unknown { kind, sequence, .. }) => {
                assert_eq!(kind, "cache_hit");
                assert_eq!(sequence, 4);
            }
            other => panic!("expected unknown frame, got {other:?}"),
        }
    }

    #[test]
    fn unknown_error_kind_decodes_as_other() {
        let line = r#"{"type":"error","thread_id":"t","sequence":1,"timestamp":"2025-01-01T00:00:00Z","payload":{"kind":"quota","message":"m"}}"#;
        let Some(Frame::Event(env)) = decode_line(line).unwrap() else {
            panic!("expected event");
        };
        assert_eq!(
            env.event,
            Event::Error {
                kind: ErrorKind::Other,
                message: "m".into()
            }
        );
    }

    #[test]
    fn sse_lines() {
        let env = Envelope::new(&origin(), 3, Event::StateSnapshot(StateSnapshot::default()));
        let frame = encode_sse(&env).unwrap();
        assert!(frame.starts_with("id: 3\n"));

        let mut decoded = Vec::new();
        for line in frame.lines() {
            if let Some(f) = decode_line(line).unwrap() {
                decoded.push(f);
            }
        }
        assert_eq!(decoded, vec![Frame::Event(env)]);
        assert!(decode_line(": ping").unwrap().is_none());
    }

    #[test]
    fn bad_payload_is_an_error() {
        let line = r#"{"type":"node_start","thread_id":"t","sequence":1,"timestamp":"2025-01-01T00:00:00Z","payload":{"nope":1}}"#;
        assert!(matches!(decode_line(line), Err(WireError::Payload { .. })));
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(matches!(decode_line("not json"), Err(WireError::Json(_))));
    }
}
