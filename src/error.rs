//! Crate-level error type.

use crate::builder::{ConfigurationError, MatrixRejected};
use crate::config::ConfigError;
use crate::executor::device::ProtocolError;
use crate::executor::HardwareError;
use crate::session::SessionError;
use thiserror::Error;

/// Any error raised by this crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Rejected(#[from] MatrixRejected),

    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to serialize report: {0}")]
    Report(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
