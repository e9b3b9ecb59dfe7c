use skein_core::errors::WireError;

/// Errors from talking to a skein server.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("wire: {0}")]
    Wire(#[from] WireError),

    #[error("gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("cancelled")]
    Cancelled,
}

impl ClientError {
    /// Failures a reconnect will not fix.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Status { status, .. } => matches!(status, 400 | 401 | 403 | 404),
            Self::RetriesExhausted { .. } | Self::Cancelled => true,
            Self::Http(_) | Self::Wire(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_and_missing_threads_are_fatal() {
        let status = |status| ClientError::Status {
            status,
            body: String::new(),
        };
        assert!(status(401).is_fatal());
        assert!(status(404).is_fatal());
        assert!(!status(503).is_fatal());
        assert!(ClientError::Cancelled.is_fatal());
    }
}
