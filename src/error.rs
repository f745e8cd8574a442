use crate::chain::ChainError;
use crate::network::wire::MAX_FRAME_SIZE;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Peer directory error: {0}")]
    PeerDirectory(#[from] PeerDirectoryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Failed to connect to {addr}: {source}")]
    ConnectFailure {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out while {0}")]
    Timeout(&'static str),

    #[error("Failed to decode frame: {0}")]
    Decode(String),

    #[error("Frame too large: {0} bytes (max: {max})", max = MAX_FRAME_SIZE)]
    FrameTooLarge(usize),

    #[error("Unsupported PEER preamble from {0}")]
    UnsupportedPreamble(String),

    #[error("Connection limit of {0} reached")]
    CapacityExceeded(usize),

    #[error("Connection to {0} already closed")]
    AlreadyClosed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    /// Expected churn on a peer network: logged and moved past, never fatal.
    pub fn is_routine(&self) -> bool {
        matches!(
            self,
            NetworkError::ConnectFailure { .. }
                | NetworkError::Timeout(_)
                | NetworkError::Decode(_)
                | NetworkError::CapacityExceeded(_)
                | NetworkError::AlreadyClosed(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum PeerDirectoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Bad timestamp {0:?}")]
    Timestamp(String),

    #[error("Malformed row: {0}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routine_classification() {
        assert!(NetworkError::Timeout("reading").is_routine());
        assert!(NetworkError::AlreadyClosed("1.2.3.4:5".into()).is_routine());
        assert!(!NetworkError::UnsupportedPreamble("1.2.3.4:5".into()).is_routine());
        assert_eq!(
            NetworkError::FrameTooLarge(5_000_000).to_string(),
            "Frame too large: 5000000 bytes (max: 4194304)"
        );
    }
}
