//! Shared matrix slot and abort signal.
//!
//! The controller installs matrices into a [`MatrixSlot`]; the executor reads
//! from it when a run begins. The slot refuses installs while a run holds a
//! [`RunGuard`], so a matrix can only be swapped between runs.

use super::HardwareError;
use crate::core::CompiledMatrix;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct SlotState {
    matrix: Option<Arc<CompiledMatrix>>,
    running: bool,
}

/// Source of the matrix for the next run.
#[derive(Clone, Debug, Default)]
pub struct MatrixSlot {
    inner: Arc<Mutex<SlotState>>,
}

impl MatrixSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the installed matrix. Fails while a run is in progress.
    pub fn install(&self, matrix: Arc<CompiledMatrix>) -> Result<(), HardwareError> {
        let mut state = self.inner.lock();
        if state.running {
            return Err(HardwareError::Busy);
        }
        state.matrix = Some(matrix);
        Ok(())
    }

    /// Drop the installed matrix. Fails while a run is in progress.
    pub fn clear(&self) -> Result<(), HardwareError> {
        let mut state = self.inner.lock();
        if state.running {
            return Err(HardwareError::Busy);
        }
        state.matrix = None;
        Ok(())
    }

    pub fn current(&self) -> Option<Arc<CompiledMatrix>> {
        self.inner.lock().matrix.clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    /// Lock the installed matrix for the duration of a run.
    pub fn begin_run(&self) -> Result<RunGuard, HardwareError> {
        let mut state = self.inner.lock();
        if state.running {
            return Err(HardwareError::Busy);
        }
        let matrix = state.matrix.clone().ok_or(HardwareError::NoMatrix)?;
        state.running = true;
        Ok(RunGuard {
            slot: self.clone(),
            matrix,
        })
    }
}

/// Marks a run in progress; the slot unlocks when dropped.
#[derive(Debug)]
pub struct RunGuard {
    slot: MatrixSlot,
    matrix: Arc<CompiledMatrix>,
}

impl RunGuard {
    pub fn matrix(&self) -> &Arc<CompiledMatrix> {
        &self.matrix
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.slot.inner.lock().running = false;
    }
}

/// Cloneable abort signal for an executor's runs.
///
/// An abort requested while no run is active is observed by the next run,
/// until [`rearm`](Self::rearm) is called.
#[derive(Clone, Debug, Default)]
pub struct AbortHandle {
    token: Arc<Mutex<CancellationToken>>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for the run that is starting now.
    pub fn token(&self) -> CancellationToken {
        self.token.lock().clone()
    }

    pub fn abort(&self) {
        self.token.lock().cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.lock().is_cancelled()
    }

    /// Clear a pending abort so the next run starts normally.
    pub fn rearm(&self) {
        let mut token = self.token.lock();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::StateSpec;
    use crate::core::StateMatrix;

    fn compiled() -> Arc<CompiledMatrix> {
        let mut sm = StateMatrix::new(["Cin"], ["ValveL"]).unwrap();
        sm.add_state(StateSpec::new("only").timer(0.1).on_timeout("END"))
            .unwrap();
        Arc::new(sm.finalize().unwrap())
    }

    #[test]
    fn begin_run_without_matrix_fails() {
        let slot = MatrixSlot::new();
        assert!(matches!(slot.begin_run(), Err(HardwareError::NoMatrix)));
    }

    #[test]
    fn install_is_refused_during_run() {
        let slot = MatrixSlot::new();
        slot.install(compiled()).unwrap();

        let guard = slot.begin_run().unwrap();
        assert!(slot.is_running());
        assert!(matches!(slot.install(compiled()), Err(HardwareError::Busy)));
        assert!(matches!(slot.begin_run(), Err(HardwareError::Busy)));

        drop(guard);
        assert!(!slot.is_running());
        assert!(slot.install(compiled()).is_ok());
    }

    #[test]
    fn run_guard_holds_the_installed_matrix() {
        let slot = MatrixSlot::new();
        let matrix = compiled();
        slot.install(matrix.clone()).unwrap();

        let guard = slot.begin_run().unwrap();
        assert!(Arc::ptr_eq(guard.matrix(), &matrix));
    }

    #[test]
    fn abort_persists_until_rearmed() {
        let abort = AbortHandle::new();
        let token = abort.token();

        abort.abort();
        assert!(token.is_cancelled());
        assert!(abort.token().is_cancelled());

        abort.rearm();
        assert!(!abort.is_aborted());
        assert!(!abort.token().is_cancelled());
    }
}
