use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification carried by a thread-level `Error` event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No substantive event within the inactivity timeout.
    Stalled,
    /// The previous consumer went away before the thread finished.
    Disconnected,
    /// The engine itself failed. Terminal for the thread.
    EngineFailure,
    /// The total-duration budget of the stream ran out.
    Timeout,
    /// A critical event could not be enqueued in time.
    Undelivered,
    #[serde(other)]
    Other,
}

impl ErrorKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::EngineFailure)
    }

    /// Kinds raised by the delivery path rather than the engine. The steps
    /// they close are settled again by a later snapshot or close event.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Stalled | Self::Disconnected | Self::Timeout | Self::Undelivered
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stalled => "stalled",
            Self::Disconnected => "disconnected",
            Self::EngineFailure => "engine_failure",
            Self::Timeout => "timeout",
            Self::Undelivered => "undelivered",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures decoding or encoding a wire envelope.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown event type: {0}")]
    UnknownType(String),
    #[error("invalid payload for {kind}: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}
