use theatre_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("decode error: {0}")]
    Decode(String),
}

impl TransportError {
    /// Connectivity problems and server-side failures are worth retrying;
    /// client-caused rejections and malformed payloads are not.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Network(_) => true,
            TransportError::Rejected { status, .. } => *status >= 500,
            TransportError::Decode(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_and_server_errors_are_transient() {
        assert!(TransportError::Network("refused".to_string()).is_transient());
        assert!(TransportError::Rejected {
            status: 503,
            message: String::new()
        }
        .is_transient());
        assert!(!TransportError::Rejected {
            status: 404,
            message: String::new()
        }
        .is_transient());
        assert!(!TransportError::Decode("bad json".to_string()).is_transient());
    }
}
