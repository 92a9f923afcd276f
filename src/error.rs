use thiserror::Error;

use crate::conf::ConfError;

/// Main application error type for rttmon
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration resolution errors
    #[error("configuration error: {0}")]
    Conf(#[from] ConfError),

    /// Capture-source errors (open failure, mid-stream read failure)
    #[error("capture error: {0}")]
    Capture(#[from] pcap::Error),

    /// Metrics exporter install errors
    #[error("metrics exporter error: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    /// Background task join errors
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Signal handling errors
    #[error("signal handling error: {0}")]
    Signal(#[from] std::io::Error),
}

/// Type alias for Result with AppError
pub type Result<T> = std::result::Result<T, AppError>;
