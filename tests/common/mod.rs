//! Shared fixtures: a simulated state machine firmware and scripted trials.
#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, DuplexStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use trialsm::builder::{ConfigurationError, StateSpec};
use trialsm::config::TimingConfig;
use trialsm::core::{CompiledMatrix, StateMatrix};
use trialsm::executor::device::{
    DeviceCodec, DeviceMessage, HostMessage, ProtocolError, SerialDevice, WireState, END_TARGET,
};
use trialsm::executor::timing::wait_for_deadline;
use trialsm::executor::{HardwareExecutor, MatrixSlot, RunReport};
use trialsm::session::{Notification, NextTrial, StopReason, TrialDefinition};

pub const INPUTS: [&str; 3] = ["Lin", "Cin", "Rin"];
pub const OUTPUTS: [&str; 2] = ["ValveL", "ValveR"];

pub fn labels(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

pub fn rig_matrix() -> StateMatrix {
    StateMatrix::new(INPUTS, OUTPUTS).unwrap()
}

/// `actual` is within 2 ms of `expected_ms`.
pub fn assert_near(actual: Duration, expected_ms: u64) {
    let expected = Duration::from_millis(expected_ms);
    let diff = if actual > expected {
        actual - expected
    } else {
        expected - actual
    };
    assert!(
        diff <= Duration::from_millis(2),
        "expected ~{expected:?}, got {actual:?}"
    );
}

/// Left valve 0.1 s, pause 0.5 s, right valve 0.1 s, pause 0.5 s.
pub fn calibration_states(sm: &mut StateMatrix) -> Result<(), ConfigurationError> {
    sm.reset_transitions();
    sm.add_state(
        StateSpec::new("left_valve_on")
            .timer(0.1)
            .on_timeout("left_valve_off")
            .outputs_on(["ValveL"])
            .outputs_off(["ValveR"]),
    )?;
    sm.add_state(
        StateSpec::new("left_valve_off")
            .timer(0.5)
            .on_timeout("right_valve_on")
            .outputs_off(["ValveL", "ValveR"]),
    )?;
    sm.add_state(
        StateSpec::new("right_valve_on")
            .timer(0.1)
            .on_timeout("right_valve_off")
            .outputs_on(["ValveR"])
            .outputs_off(["ValveL"]),
    )?;
    sm.add_state(
        StateSpec::new("right_valve_off")
            .timer(0.5)
            .on_timeout("END")
            .outputs_off(["ValveL", "ValveR"]),
    )?;
    Ok(())
}

/// Wait up to 5 s for a poke in the center port, then reward on the left.
pub fn poke_states(sm: &mut StateMatrix) -> Result<(), ConfigurationError> {
    sm.reset_transitions();
    sm.add_state(
        StateSpec::new("wait_for_poke")
            .timer(5.0)
            .on("Cin", "reward")
            .on_timeout("END"),
    )?;
    sm.add_state(
        StateSpec::new("reward")
            .timer(0.1)
            .outputs_on(["ValveL"])
            .on_timeout("END"),
    )?;
    Ok(())
}

/// A single state holding `ValveL` open for `seconds`.
pub fn hold_states(seconds: f64) -> impl Fn(&mut StateMatrix) -> Result<(), ConfigurationError> {
    move |sm| {
        sm.reset_transitions();
        sm.add_state(
            StateSpec::new("hold")
                .timer(seconds)
                .outputs_on(["ValveL"])
                .on_timeout("END"),
        )?;
        Ok(())
    }
}

pub fn compile(build: impl Fn(&mut StateMatrix) -> Result<(), ConfigurationError>) -> Arc<CompiledMatrix> {
    let mut sm = rig_matrix();
    build(&mut sm).unwrap();
    Arc::new(sm.finalize().unwrap())
}

/// Connect `executor`, install `matrix` and run it once.
pub async fn run_once(executor: &mut dyn HardwareExecutor, matrix: Arc<CompiledMatrix>) -> RunReport {
    let slot = MatrixSlot::new();
    executor.connect_state_machine(slot.clone());
    executor.connect().await.unwrap();
    slot.install(matrix).unwrap();
    executor.run().await.unwrap()
}

/// Input panel and output levels of a [`spawn_firmware`] device.
#[derive(Clone)]
pub struct Firmware {
    inputs: mpsc::UnboundedSender<String>,
    levels: watch::Receiver<u32>,
}

impl Firmware {
    pub fn inject(&self, label: &str) {
        self.inputs.send(label.to_string()).unwrap();
    }

    pub fn levels(&self) -> u32 {
        *self.levels.borrow()
    }
}

/// Driver connected to a simulated firmware over an in-memory stream.
pub fn simulated_device(timing: TimingConfig) -> (SerialDevice<DuplexStream>, Firmware) {
    let (host, device) = duplex(64 * 1024);
    let driver = SerialDevice::new(host, labels(&INPUTS), labels(&OUTPUTS), timing)
        .with_name("simulated");
    (driver, spawn_firmware(device))
}

pub fn spawn_firmware(stream: DuplexStream) -> Firmware {
    let (inputs, input_rx) = mpsc::unbounded_channel();
    let (levels_tx, levels) = watch::channel(0);
    tokio::spawn(firmware(
        Framed::new(stream, DeviceCodec::new()),
        input_rx,
        levels_tx,
    ));
    Firmware { inputs, levels }
}

type Wire = Framed<DuplexStream, DeviceCodec>;

async fn firmware(
    mut wire: Wire,
    mut inputs: mpsc::UnboundedReceiver<String>,
    levels: watch::Sender<u32>,
) {
    let mut declared = Vec::new();
    let mut states = Vec::new();

    while let Some(Ok(message)) = wire.next().await {
        let sent = match message {
            HostMessage::Declare { inputs, .. } => {
                declared = inputs;
                wire.send(DeviceMessage::Ready {
                    firmware: "sim-1.0".to_string(),
                })
                .await
            }
            HostMessage::LoadMatrix { states: loaded } => {
                states = loaded;
                wire.send(DeviceMessage::Loaded {
                    states: states.len() as u16,
                })
                .await
            }
            HostMessage::Run => run(&mut wire, &states, &declared, &mut inputs, &levels).await,
            HostMessage::Abort => Ok(()),
            HostMessage::ForceOutputs { mask } => {
                levels.send_replace(mask);
                Ok(())
            }
        };
        if sent.is_err() {
            break;
        }
    }
}

async fn run(
    wire: &mut Wire,
    states: &[WireState],
    declared: &[String],
    inputs: &mut mpsc::UnboundedReceiver<String>,
    levels: &watch::Sender<u32>,
) -> Result<(), ProtocolError> {
    while inputs.try_recv().is_ok() {}
    let start = Instant::now();
    let at_us = || start.elapsed().as_micros() as u64;

    let mut current = 0u16;
    let mut mask = 0u32;
    loop {
        let state = &states[current as usize];
        mask = (mask | state.on_mask) & !state.off_mask;
        levels.send_replace(mask);
        let entered = Instant::now();
        wire.send(DeviceMessage::StateEntered {
            state: current,
            at_us: at_us(),
        })
        .await?;

        let mut deadline =
            (state.timer_us > 0).then(|| entered + Duration::from_micros(state.timer_us.into()));
        let (event, target) = loop {
            tokio::select! {
                biased;
                message = wire.next() => match message {
                    Some(Ok(HostMessage::Abort)) => {
                        levels.send_replace(0);
                        return wire
                            .send(DeviceMessage::Finished { aborted: true, at_us: at_us() })
                            .await;
                    }
                    Some(Ok(other)) => {
                        wire.send(DeviceMessage::Error {
                            reason: format!("unexpected {other:?} during run"),
                        })
                        .await?;
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Ok(()),
                },
                _ = wait_for_deadline(deadline, Duration::ZERO) => {
                    deadline = None;
                    if let Some(target) = state.target(0) {
                        break (0, target);
                    }
                }
                Some(label) = inputs.recv() => {
                    if let Some(code) = declared.iter().position(|l| *l == label) {
                        let code = code as u8 + 1;
                        if let Some(target) = state.target(code) {
                            break (code, target);
                        }
                    }
                }
            }
        };

        wire.send(DeviceMessage::Transition {
            from: current,
            event,
            to: target,
            at_us: at_us(),
        })
        .await?;
        if target == END_TARGET {
            levels.send_replace(0);
            return wire
                .send(DeviceMessage::Finished {
                    aborted: false,
                    at_us: at_us(),
                })
                .await;
        }
        current = target;
    }
}

/// Trial definition that builds the same matrix every trial and records
/// what the controller told it.
pub struct Scripted<F> {
    matrix: StateMatrix,
    build: F,
    pub stop_at: Option<u32>,
    pub requested: Vec<u32>,
    pub finished: Vec<(u32, RunReport)>,
    pub stopped: Option<(u32, StopReason)>,
}

impl<F> Scripted<F>
where
    F: Fn(&mut StateMatrix) -> Result<(), ConfigurationError> + Send + 'static,
{
    pub fn new(build: F) -> Self {
        Self {
            matrix: rig_matrix(),
            build,
            stop_at: None,
            requested: Vec::new(),
            finished: Vec::new(),
            stopped: None,
        }
    }

    pub fn stopping_at(mut self, trial_index: u32) -> Self {
        self.stop_at = Some(trial_index);
        self
    }
}

impl<F> TrialDefinition for Scripted<F>
where
    F: Fn(&mut StateMatrix) -> Result<(), ConfigurationError> + Send + 'static,
{
    fn next_trial(&mut self, trial_index: u32) -> Result<NextTrial, ConfigurationError> {
        self.requested.push(trial_index);
        if self.stop_at == Some(trial_index) {
            return Ok(NextTrial::Stop);
        }
        (self.build)(&mut self.matrix)?;
        Ok(NextTrial::Run(self.matrix.clone()))
    }

    fn trial_finished(&mut self, trial_index: u32, report: &RunReport) {
        self.finished.push((trial_index, report.clone()));
    }

    fn session_stopped(&mut self, total_trials_completed: u32, reason: &StopReason) {
        self.stopped = Some((total_trials_completed, reason.clone()));
    }
}

/// Receive notifications up to and including `SessionStopped`.
pub async fn until_stopped(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
    let mut seen = Vec::new();
    loop {
        let notification = rx.recv().await.unwrap();
        let stopped = matches!(notification, Notification::SessionStopped { .. });
        seen.push(notification);
        if stopped {
            return seen;
        }
    }
}

pub fn stop_reason(seen: &[Notification]) -> Option<(u32, StopReason)> {
    seen.iter().find_map(|n| match n {
        Notification::SessionStopped {
            total_trials_completed,
            reason,
        } => Some((*total_trials_completed, reason.clone())),
        _ => None,
    })
}
