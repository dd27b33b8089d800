//! Executor failures.

use super::device::ProtocolError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Failure of the hardware interface.
///
/// A hardware error aborts the in-flight trial only. By the time it is
/// returned from [`run`](super::HardwareExecutor::run) the executor has
/// already tried to drive every output back to the safe default.
#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("Executor is not connected")]
    NotConnected,

    #[error("Connection to {interface} lost")]
    Disconnected { interface: String },

    #[error("Device reported an error: {0}")]
    Device(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Device did not complete the handshake within {timeout:?}")]
    HandshakeTimeout { timeout: Duration },

    #[error("No state matrix installed")]
    NoMatrix,

    #[error("A trial is already running")]
    Busy,

    #[error("Matrix lines do not match the lines declared to {interface}")]
    LineMismatch { interface: String },

    #[error("Device loaded {loaded} states, expected {expected}")]
    LoadMismatch { expected: usize, loaded: usize },

    #[error("Unexpected device message: {0}")]
    Unexpected(String),

    #[error("Device did not confirm abort within {timeout:?}")]
    AbortTimeout { timeout: Duration },
}

/// A state timer fired later than nominal by more than the configured slack.
///
/// Never fatal: the run continues and the overrun is logged and reported.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[error("Timer of state '{state}' fired {late_by:?} late (nominal {nominal:?}, slack {slack:?})")]
pub struct TimingOverrunError {
    pub state: String,
    pub nominal: Duration,
    pub late_by: Duration,
    pub slack: Duration,
}
