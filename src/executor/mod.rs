//! Hardware executors: run a compiled matrix against real or emulated lines.
//!
//! Every executor implements [`HardwareExecutor`] and shares the stepping
//! logic of [`Automaton`](crate::core::Automaton), so a matrix produces the
//! same ordered `(state, event)` sequence no matter where it runs.
//!
//! - [`Emulator`]: in-process, software timer, injected inputs
//! - [`device::SerialDevice`]: framed byte protocol to a microcontroller
//!
//! # Lifecycle
//!
//! ```text
//! connect_state_machine(slot) -> connect() -> [install matrix in slot -> run()]*
//! ```
//!
//! `run()` takes the matrix currently installed in the [`MatrixSlot`],
//! pushes it to the interface if it has not been pushed yet, and blocks only
//! on timer expiry, hardware input or abort. Whatever ends the run, outputs
//! are back to the safe default (all cleared) when it returns.

pub mod device;
mod emulator;
mod error;
mod report;
mod slot;
pub mod timing;

pub use emulator::{Emulator, EmulatorInputs};
pub use error::{HardwareError, TimingOverrunError};
pub use report::{OutputChange, RunReport};
pub use slot::{AbortHandle, MatrixSlot, RunGuard};

pub(crate) use report::RunRecorder;

use crate::core::{CompiledMatrix, OutputMask};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// How a run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    /// The automaton reached `END`.
    Completed,
    /// The run was aborted before reaching `END`.
    Aborted,
}

/// Observations broadcast by an executor while it runs.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum ExecutorEvent {
    /// Handshake completed.
    Ready { interface: String },
    /// The interface reported a failure.
    Error { reason: String },
    StateEntered { state: String, at: Duration },
    Transition {
        from: String,
        event: String,
        to: String,
        at: Duration,
    },
    OutputsChanged {
        mask: OutputMask,
        asserted: Vec<String>,
        at: Duration,
    },
    TimingOverrun(TimingOverrunError),
    RunFinished { outcome: RunOutcome, at: Duration },
}

/// A hardware interface that executes state matrices.
#[async_trait]
pub trait HardwareExecutor: Send {
    /// Short interface name for logs.
    fn name(&self) -> &str;

    /// Bind the executor to the slot the controller installs matrices into.
    fn connect_state_machine(&mut self, slot: MatrixSlot);

    /// Open the interface and declare the rig's lines.
    async fn connect(&mut self) -> Result<(), HardwareError>;

    /// Transfer a matrix to the interface ahead of a run.
    async fn push_state_matrix(&mut self, matrix: Arc<CompiledMatrix>) -> Result<(), HardwareError>;

    /// Run the installed matrix until `END`, abort, or a hardware error.
    async fn run(&mut self) -> Result<RunReport, HardwareError>;

    /// Handle that aborts the current (or next) run from another task.
    fn abort_handle(&self) -> AbortHandle;

    fn abort(&self) {
        self.abort_handle().abort();
    }

    fn subscribe(&self) -> broadcast::Receiver<ExecutorEvent>;

    /// Release the interface, leaving every output cleared.
    async fn close(&mut self) -> Result<(), HardwareError> {
        Ok(())
    }
}
