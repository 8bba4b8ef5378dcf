use std::io;
use thiserror::Error;

/// Central error type for the etude engine.
#[derive(Debug, Error)]
pub enum EtudeError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Port outside the accepted range (0 or 1024..=65535).
    #[error("invalid port {0}: must be 0 or in 1024..=65535")]
    InvalidPort(u16),

    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// The credential store failed to answer a query.
    #[error("credential store error: {0}")]
    Credential(String),

    /// The worker pool has been shut down and refuses new tasks.
    #[error("worker pool is closed")]
    PoolClosed,

    /// A client pool has no handles configured.
    #[error("client pool is empty")]
    PoolExhausted,
}

pub type EtudeResult<T> = Result<T, EtudeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert_and_keep_source() {
        let err: EtudeError = io::Error::new(io::ErrorKind::AddrInUse, "taken").into();
        assert!(matches!(err, EtudeError::Io(_)));
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("taken"));
        assert_eq!(
            EtudeError::InvalidPort(80).to_string(),
            "invalid port 80: must be 0 or in 1024..=65535"
        );
    }
}
