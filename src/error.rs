//! Error types shared by every pipeline stage

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Pipeline error
#[derive(Debug, Error)]
pub enum BenchError {
    /// Configuration invariant violated, checked before any task starts
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Outbound queue was empty when the sender required a message
    #[error("outbound queue starved: producer is not keeping up with the sender")]
    QueueStarved,

    #[error("random source failure: {0}")]
    RandomSource(#[from] rand::Error),

    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("upstream closed: {0}")]
    UpstreamClosed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BenchError {
    /// Fatal errors end the process; everything else is handled where it occurs
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BenchError::Config(_) | BenchError::QueueStarved | BenchError::RandomSource(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BenchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(BenchError::QueueStarved.is_fatal());
        assert!(BenchError::Config("bad".into()).is_fatal());
        assert!(!BenchError::UpstreamClosed("eof".into()).is_fatal());
    }
}
