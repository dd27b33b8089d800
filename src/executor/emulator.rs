//! In-process executor with a software timer.

use super::timing::{self, wait_for_deadline};
use super::{
    AbortHandle, ExecutorEvent, HardwareError, HardwareExecutor, MatrixSlot, RunOutcome,
    RunRecorder, RunReport,
};
use crate::config::TimingConfig;
use crate::core::{Automaton, CompiledMatrix, EventId, OutputMask, Step, Target};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Emulated rig: runs matrices against injected inputs and virtual output lines.
///
/// Inputs are injected through an [`EmulatorInputs`] handle; inputs injected
/// while no run is active are discarded when the next run starts.
pub struct Emulator {
    inputs: Vec<String>,
    outputs: Vec<String>,
    timing: TimingConfig,
    slot: Option<MatrixSlot>,
    loaded: Option<Arc<CompiledMatrix>>,
    connected: bool,
    abort: AbortHandle,
    events: broadcast::Sender<ExecutorEvent>,
    input_tx: mpsc::UnboundedSender<String>,
    input_rx: mpsc::UnboundedReceiver<String>,
    levels: watch::Sender<OutputMask>,
}

enum Wake {
    Abort,
    Timer,
    Input(String),
}

impl Emulator {
    pub fn new(inputs: Vec<String>, outputs: Vec<String>, timing: TimingConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (levels, _) = watch::channel(OutputMask::EMPTY);
        Self {
            inputs,
            outputs,
            timing,
            slot: None,
            loaded: None,
            connected: false,
            abort: AbortHandle::new(),
            events,
            input_tx,
            input_rx,
            levels,
        }
    }

    /// Handle for injecting inputs and watching output levels.
    pub fn inputs_handle(&self) -> EmulatorInputs {
        EmulatorInputs {
            tx: self.input_tx.clone(),
            levels: self.levels.subscribe(),
            outputs: self.outputs.clone(),
        }
    }

    fn set_outputs(&self, mask: OutputMask) {
        self.levels.send_replace(mask);
    }

    async fn execute(&mut self, matrix: &Arc<CompiledMatrix>) -> RunReport {
        let token = self.abort.token();
        let mut recorder =
            RunRecorder::new(matrix.clone(), self.events.clone(), self.timing.overrun_slack());

        while self.input_rx.try_recv().is_ok() {}

        let start = Instant::now();
        if token.is_cancelled() {
            info!("Run aborted before start");
            return recorder.finish(RunOutcome::Aborted, start.elapsed());
        }

        let (mut automaton, entry) = Automaton::start(matrix);
        self.set_outputs(entry.outputs);
        recorder.entered(&entry, start.elapsed());
        let mut current = entry;
        let mut deadline = entry.timer.map(|t| start + t);
        let spin = self.timing.spin_margin();

        let outcome = loop {
            let wake = tokio::select! {
                biased;
                _ = token.cancelled() => Wake::Abort,
                _ = wait_for_deadline(deadline, spin) => Wake::Timer,
                Some(label) = self.input_rx.recv() => Wake::Input(label),
            };

            let now = Instant::now();
            let at = now.duration_since(start);
            let event = match wake {
                Wake::Abort => {
                    info!(state = %matrix.state_name(current.state), "Run aborted");
                    break RunOutcome::Aborted;
                }
                Wake::Timer => {
                    if let (Some(due), Some(nominal)) = (deadline, current.timer) {
                        recorder.timer_fired(current.state, nominal, timing::lateness(due, now));
                    }
                    deadline = None;
                    EventId::Timer
                }
                Wake::Input(label) => match matrix.event_id(&label) {
                    Some(event @ EventId::Input(_)) => event,
                    _ => {
                        warn!(input = %label, "Ignoring undeclared input");
                        continue;
                    }
                },
            };

            match automaton.handle(event) {
                Step::Moved { from, event, entry } => {
                    recorder.transition(from, event, Target::State(entry.state), at);
                    self.set_outputs(entry.outputs);
                    recorder.entered(&entry, at);
                    current = entry;
                    deadline = entry.timer.map(|t| now + t);
                }
                Step::Finished { from, event } => {
                    recorder.transition(from, event, Target::End, at);
                    break RunOutcome::Completed;
                }
                Step::Ignored => {
                    debug!(
                        state = %matrix.state_name(current.state),
                        event = %matrix.event_label(event),
                        "No transition for event"
                    );
                }
            }
        };

        automaton.halt();
        self.set_outputs(OutputMask::EMPTY);
        recorder.finish(outcome, start.elapsed())
    }
}

#[async_trait]
impl HardwareExecutor for Emulator {
    fn name(&self) -> &str {
        "emulator"
    }

    fn connect_state_machine(&mut self, slot: MatrixSlot) {
        self.slot = Some(slot);
    }

    async fn connect(&mut self) -> Result<(), HardwareError> {
        self.set_outputs(OutputMask::EMPTY);
        self.connected = true;
        info!(
            inputs = ?self.inputs,
            outputs = ?self.outputs,
            "Emulator ready"
        );
        let _ = self.events.send(ExecutorEvent::Ready {
            interface: self.name().to_string(),
        });
        Ok(())
    }

    async fn push_state_matrix(&mut self, matrix: Arc<CompiledMatrix>) -> Result<(), HardwareError> {
        if !self.connected {
            return Err(HardwareError::NotConnected);
        }
        if !matrix.declares(&self.inputs, &self.outputs) {
            return Err(HardwareError::LineMismatch {
                interface: self.name().to_string(),
            });
        }
        self.loaded = Some(matrix);
        Ok(())
    }

    async fn run(&mut self) -> Result<RunReport, HardwareError> {
        if !self.connected {
            return Err(HardwareError::NotConnected);
        }
        let guard = self.slot.as_ref().ok_or(HardwareError::NoMatrix)?.begin_run()?;
        let matrix = guard.matrix().clone();

        let pushed = self
            .loaded
            .as_ref()
            .is_some_and(|loaded| Arc::ptr_eq(loaded, &matrix));
        if !pushed {
            self.push_state_matrix(matrix.clone()).await?;
        }

        let report = self.execute(&matrix).await;
        self.abort.rearm();
        drop(guard);
        Ok(report)
    }

    fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<ExecutorEvent> {
        self.events.subscribe()
    }

    async fn close(&mut self) -> Result<(), HardwareError> {
        self.set_outputs(OutputMask::EMPTY);
        self.connected = false;
        Ok(())
    }
}

/// Input panel and output display of an [`Emulator`].
#[derive(Clone, Debug)]
pub struct EmulatorInputs {
    tx: mpsc::UnboundedSender<String>,
    levels: watch::Receiver<OutputMask>,
    outputs: Vec<String>,
}

impl EmulatorInputs {
    /// Fire the input event `label` on the running matrix.
    pub fn inject(&self, label: impl Into<String>) -> Result<(), HardwareError> {
        self.tx
            .send(label.into())
            .map_err(|_| HardwareError::Disconnected {
                interface: "emulator".to_string(),
            })
    }

    /// Current output levels.
    pub fn outputs(&self) -> OutputMask {
        *self.levels.borrow()
    }

    /// Whether the named output line is currently asserted.
    pub fn is_asserted(&self, output: &str) -> bool {
        self.outputs
            .iter()
            .position(|name| name == output)
            .is_some_and(|index| self.outputs().contains(index))
    }

    /// Receiver that observes every output level change.
    pub fn levels(&self) -> watch::Receiver<OutputMask> {
        self.levels.clone()
    }
}
