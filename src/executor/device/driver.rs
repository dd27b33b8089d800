//! Host side of the device link.

use super::codec::FrameCodec;
use super::protocol::{encode_matrix, DeviceMessage, HostMessage, END_TARGET};
use crate::config::TimingConfig;
use crate::core::{Automaton, CompiledMatrix, Entry, EventId, OutputMask, Step, Target};
use crate::executor::timing::wait_for_deadline;
use crate::executor::{
    AbortHandle, ExecutorEvent, HardwareError, HardwareExecutor, MatrixSlot, RunOutcome,
    RunRecorder, RunReport,
};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio::time::{timeout, Instant};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Host-side codec: decodes device messages, encodes host messages.
pub type HostCodec = FrameCodec<DeviceMessage, HostMessage>;

/// Executor for state machine firmware on a byte stream (usually a serial port).
///
/// The device runs the matrix on its own clock. The driver mirrors every
/// reported transition through an [`Automaton`] and rejects any the matrix
/// does not allow, so the history it reports is checked against the matrix.
pub struct SerialDevice<T> {
    name: String,
    framed: Framed<T, HostCodec>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    pins: BTreeMap<String, u8>,
    timing: TimingConfig,
    slot: Option<MatrixSlot>,
    loaded: Option<Arc<CompiledMatrix>>,
    firmware: Option<String>,
    abort: AbortHandle,
    events: broadcast::Sender<ExecutorEvent>,
}

enum Wake {
    Abort,
    AbortExpired,
    Frame(Option<Result<DeviceMessage, super::ProtocolError>>),
}

/// Driver-side view of a run in progress.
struct Mirror<'m> {
    automaton: Automaton<'m>,
    entry: Entry,
    pending: Option<Entry>,
    entered_at_us: u64,
    started: bool,
    reached_end: bool,
}

impl<T> SerialDevice<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        transport: T,
        inputs: Vec<String>,
        outputs: Vec<String>,
        timing: TimingConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            name: "device".to_string(),
            framed: Framed::new(transport, HostCodec::new()),
            inputs,
            outputs,
            pins: BTreeMap::new(),
            timing,
            slot: None,
            loaded: None,
            firmware: None,
            abort: AbortHandle::new(),
            events,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_pins(mut self, pins: BTreeMap<String, u8>) -> Self {
        self.pins = pins;
        self
    }

    /// Firmware identification received in the handshake.
    pub fn firmware(&self) -> Option<&str> {
        self.firmware.as_deref()
    }

    async fn send(&mut self, message: HostMessage) -> Result<(), HardwareError> {
        self.framed.send(message).await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<DeviceMessage, HardwareError> {
        match self.framed.next().await {
            Some(Ok(message)) => Ok(message),
            Some(Err(e)) => Err(e.into()),
            None => Err(HardwareError::Disconnected {
                interface: self.name.clone(),
            }),
        }
    }

    fn report_error(&self, reason: String) {
        error!(interface = %self.name, reason = %reason, "Device error");
        let _ = self.events.send(ExecutorEvent::Error { reason });
    }

    async fn handshake(&mut self) -> Result<String, HardwareError> {
        self.send(HostMessage::Declare {
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            pins: self.pins.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        })
        .await?;

        loop {
            match self.receive().await? {
                DeviceMessage::Ready { firmware } => return Ok(firmware),
                DeviceMessage::Error { reason } => return Err(HardwareError::Device(reason)),
                other => debug!(message = ?other, "Ignoring message before ready"),
            }
        }
    }

    async fn execute(
        &mut self,
        matrix: &Arc<CompiledMatrix>,
        token: &CancellationToken,
    ) -> Result<RunReport, HardwareError> {
        let mut recorder =
            RunRecorder::new(matrix.clone(), self.events.clone(), self.timing.overrun_slack());

        if token.is_cancelled() {
            info!("Run aborted before start");
            return Ok(recorder.finish(RunOutcome::Aborted, Duration::ZERO));
        }

        self.send(HostMessage::Run).await?;

        let (automaton, entry) = Automaton::start(matrix);
        let mut mirror = Mirror {
            automaton,
            entry,
            pending: Some(entry),
            entered_at_us: 0,
            started: false,
            reached_end: false,
        };
        let mut abort_deadline: Option<Instant> = None;

        loop {
            let wake = tokio::select! {
                biased;
                _ = token.cancelled(), if abort_deadline.is_none() => Wake::Abort,
                _ = wait_for_deadline(abort_deadline, Duration::ZERO) => Wake::AbortExpired,
                frame = self.framed.next() => Wake::Frame(frame),
            };

            let message = match wake {
                Wake::Abort => {
                    info!(state = %matrix.state_name(mirror.entry.state), "Aborting run");
                    self.send(HostMessage::Abort).await?;
                    abort_deadline = Some(Instant::now() + self.timing.abort_timeout());
                    continue;
                }
                Wake::AbortExpired => {
                    return Err(HardwareError::AbortTimeout {
                        timeout: self.timing.abort_timeout(),
                    });
                }
                Wake::Frame(None) => {
                    return Err(HardwareError::Disconnected {
                        interface: self.name.clone(),
                    });
                }
                Wake::Frame(Some(frame)) => frame?,
            };

            match message {
                DeviceMessage::StateEntered { state, at_us } => {
                    let entry = mirror
                        .pending
                        .take()
                        .filter(|entry| entry.state.0 == state)
                        .ok_or_else(|| {
                            HardwareError::Unexpected(format!("entered state {state} out of order"))
                        })?;
                    mirror.started = true;
                    mirror.entry = entry;
                    mirror.entered_at_us = at_us;
                    recorder.entered(&entry, Duration::from_micros(at_us));
                }

                DeviceMessage::Transition {
                    from,
                    event,
                    to,
                    at_us,
                } => {
                    if !mirror.started || mirror.pending.is_some() {
                        return Err(HardwareError::Unexpected(format!(
                            "transition from {from} before its entry was reported"
                        )));
                    }
                    let event = EventId::from_code(event);
                    let at = Duration::from_micros(at_us);
                    if event == EventId::Timer {
                        if let Some(nominal) = mirror.entry.timer {
                            let in_state =
                                Duration::from_micros(at_us.saturating_sub(mirror.entered_at_us));
                            recorder.timer_fired(
                                mirror.entry.state,
                                nominal,
                                in_state.saturating_sub(nominal),
                            );
                        }
                    }

                    match mirror.automaton.handle(event) {
                        Step::Moved {
                            from: expected,
                            event,
                            entry,
                        } if expected.0 == from && entry.state.0 == to => {
                            recorder.transition(expected, event, Target::State(entry.state), at);
                            mirror.pending = Some(entry);
                        }
                        Step::Finished {
                            from: expected,
                            event,
                        } if expected.0 == from && to == END_TARGET => {
                            recorder.transition(expected, event, Target::End, at);
                            mirror.reached_end = true;
                        }
                        step => {
                            return Err(HardwareError::Unexpected(format!(
                                "transition {from} -[{}]-> {to} does not match the matrix ({step:?})",
                                event.code()
                            )));
                        }
                    }
                }

                DeviceMessage::Finished { aborted, at_us } => {
                    let outcome = if aborted {
                        RunOutcome::Aborted
                    } else if mirror.reached_end {
                        RunOutcome::Completed
                    } else {
                        return Err(HardwareError::Unexpected(
                            "run finished without reaching END".to_string(),
                        ));
                    };
                    mirror.automaton.halt();
                    return Ok(recorder.finish(outcome, Duration::from_micros(at_us)));
                }

                DeviceMessage::Error { reason } => return Err(HardwareError::Device(reason)),

                other => {
                    return Err(HardwareError::Unexpected(format!("{other:?} during run")));
                }
            }
        }
    }
}

#[async_trait]
impl<T> HardwareExecutor for SerialDevice<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn connect_state_machine(&mut self, slot: MatrixSlot) {
        self.slot = Some(slot);
    }

    async fn connect(&mut self) -> Result<(), HardwareError> {
        let handshake_timeout = self.timing.handshake_timeout();
        info!(interface = %self.name, "Connecting to device");

        let firmware = match timeout(handshake_timeout, self.handshake()).await {
            Ok(Ok(firmware)) => firmware,
            Ok(Err(e)) => {
                self.report_error(e.to_string());
                return Err(e);
            }
            Err(_) => {
                let e = HardwareError::HandshakeTimeout {
                    timeout: handshake_timeout,
                };
                self.report_error(e.to_string());
                return Err(e);
            }
        };

        info!(interface = %self.name, firmware = %firmware, "Device ready");
        let _ = self.events.send(ExecutorEvent::Ready {
            interface: format!("{} ({firmware})", self.name),
        });
        self.firmware = Some(firmware);
        Ok(())
    }

    async fn push_state_matrix(&mut self, matrix: Arc<CompiledMatrix>) -> Result<(), HardwareError> {
        if self.firmware.is_none() {
            return Err(HardwareError::NotConnected);
        }
        if !matrix.declares(&self.inputs, &self.outputs) {
            return Err(HardwareError::LineMismatch {
                interface: self.name.clone(),
            });
        }

        let states = encode_matrix(&matrix)?;
        let expected = states.len();
        self.loaded = None;
        self.send(HostMessage::LoadMatrix { states }).await?;

        loop {
            match self.receive().await? {
                DeviceMessage::Loaded { states } if states as usize == expected => break,
                DeviceMessage::Loaded { states } => {
                    return Err(HardwareError::LoadMismatch {
                        expected,
                        loaded: states as usize,
                    });
                }
                DeviceMessage::Error { reason } => return Err(HardwareError::Device(reason)),
                other => warn!(message = ?other, "Ignoring message while loading matrix"),
            }
        }

        debug!(states = expected, "Matrix loaded");
        self.loaded = Some(matrix);
        Ok(())
    }

    async fn run(&mut self) -> Result<RunReport, HardwareError> {
        if self.firmware.is_none() {
            return Err(HardwareError::NotConnected);
        }
        let guard = self.slot.as_ref().ok_or(HardwareError::NoMatrix)?.begin_run()?;
        let matrix = guard.matrix().clone();
        let token = self.abort.token();

        let pushed = self
            .loaded
            .as_ref()
            .is_some_and(|loaded| Arc::ptr_eq(loaded, &matrix));
        let result = if pushed {
            self.execute(&matrix, &token).await
        } else {
            match self.push_state_matrix(matrix.clone()).await {
                Ok(()) => self.execute(&matrix, &token).await,
                Err(e) => Err(e),
            }
        };

        if let Err(e) = &result {
            self.report_error(e.to_string());
            if let Err(clear) = self
                .send(HostMessage::ForceOutputs {
                    mask: OutputMask::EMPTY.bits(),
                })
                .await
            {
                warn!(error = %clear, "Failed to clear outputs after error");
            }
        }

        self.abort.rearm();
        drop(guard);
        result
    }

    fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<ExecutorEvent> {
        self.events.subscribe()
    }

    async fn close(&mut self) -> Result<(), HardwareError> {
        if self.firmware.take().is_some() {
            self.send(HostMessage::ForceOutputs {
                mask: OutputMask::EMPTY.bits(),
            })
            .await?;
        }
        self.loaded = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::StateSpec;
    use crate::core::StateMatrix;
    use crate::executor::device::DeviceCodec;
    use tokio::io::{duplex, DuplexStream};

    type Peer = Framed<DuplexStream, DeviceCodec>;

    fn pair() -> (SerialDevice<DuplexStream>, Peer) {
        let (host, device) = duplex(8192);
        let driver = SerialDevice::new(
            host,
            vec!["Cin".to_string()],
            vec!["ValveL".to_string()],
            TimingConfig::default(),
        );
        (driver, Framed::new(device, DeviceCodec::new()))
    }

    fn one_state() -> Arc<CompiledMatrix> {
        let mut sm = StateMatrix::new(["Cin"], ["ValveL"]).unwrap();
        sm.add_state(
            StateSpec::new("open")
                .timer(0.1)
                .on_timeout("END")
                .outputs_on(["ValveL"]),
        )
        .unwrap();
        Arc::new(sm.finalize().unwrap())
    }

    async fn expect(peer: &mut Peer) -> HostMessage {
        peer.next().await.unwrap().unwrap()
    }

    async fn ready(driver: &mut SerialDevice<DuplexStream>, peer: &mut Peer) {
        let (connected, _) = tokio::join!(driver.connect(), async {
            assert!(matches!(expect(peer).await, HostMessage::Declare { .. }));
            peer.send(DeviceMessage::Ready {
                firmware: "test-fw".to_string(),
            })
            .await
            .unwrap();
        });
        connected.unwrap();
    }

    #[tokio::test]
    async fn handshake_declares_lines() {
        let (mut driver, mut peer) = pair();
        let mut events = driver.subscribe();

        ready(&mut driver, &mut peer).await;

        assert_eq!(driver.firmware(), Some("test-fw"));
        assert!(matches!(events.try_recv(), Ok(ExecutorEvent::Ready { .. })));
    }

    #[tokio::test]
    async fn handshake_error_is_reported() {
        let (mut driver, mut peer) = pair();
        let (connected, _) = tokio::join!(driver.connect(), async {
            expect(&mut peer).await;
            peer.send(DeviceMessage::Error {
                reason: "pin 4 in use".to_string(),
            })
            .await
            .unwrap();
        });

        assert!(matches!(connected, Err(HardwareError::Device(reason)) if reason == "pin 4 in use"));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_times_out() {
        let (mut driver, _peer) = pair();
        assert!(matches!(
            driver.connect().await,
            Err(HardwareError::HandshakeTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn run_mirrors_device_transitions() {
        let (mut driver, mut peer) = pair();
        ready(&mut driver, &mut peer).await;
        let slot = MatrixSlot::new();
        driver.connect_state_machine(slot.clone());
        slot.install(one_state()).unwrap();

        let (report, _) = tokio::join!(driver.run(), async {
            match expect(&mut peer).await {
                HostMessage::LoadMatrix { states } => {
                    assert_eq!(states[0].timer_us, 100_000);
                    peer.send(DeviceMessage::Loaded { states: 1 }).await.unwrap();
                }
                other => panic!("Expected LoadMatrix, got {other:?}"),
            }
            assert_eq!(expect(&mut peer).await, HostMessage::Run);
            for message in [
                DeviceMessage::StateEntered { state: 0, at_us: 0 },
                DeviceMessage::Transition {
                    from: 0,
                    event: 0,
                    to: END_TARGET,
                    at_us: 100_400,
                },
                DeviceMessage::Finished {
                    aborted: false,
                    at_us: 100_400,
                },
            ] {
                peer.send(message).await.unwrap();
            }
        });
        let report = report.unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.history.sequence(), vec![("open", "Tup")]);
        assert_eq!(report.outputs_at(Duration::from_millis(50)), OutputMask::line(0));
        assert!(report.final_outputs().is_empty());
        assert!(report.overruns.is_empty());
    }

    #[tokio::test]
    async fn transition_outside_matrix_fails_and_clears_outputs() {
        let (mut driver, mut peer) = pair();
        ready(&mut driver, &mut peer).await;
        let slot = MatrixSlot::new();
        driver.connect_state_machine(slot.clone());
        slot.install(one_state()).unwrap();

        let (result, _) = tokio::join!(driver.run(), async {
            expect(&mut peer).await;
            peer.send(DeviceMessage::Loaded { states: 1 }).await.unwrap();
            expect(&mut peer).await;
            peer.send(DeviceMessage::StateEntered { state: 0, at_us: 0 })
                .await
                .unwrap();
            // Input 1 has no transition in "open".
            peer.send(DeviceMessage::Transition {
                from: 0,
                event: 1,
                to: END_TARGET,
                at_us: 5_000,
            })
            .await
            .unwrap();
            assert_eq!(
                expect(&mut peer).await,
                HostMessage::ForceOutputs { mask: 0 }
            );
        });

        assert!(matches!(result, Err(HardwareError::Unexpected(_))));
        assert!(!slot.is_running());
    }

    #[tokio::test]
    async fn load_count_mismatch_is_an_error() {
        let (mut driver, mut peer) = pair();
        ready(&mut driver, &mut peer).await;

        let (result, _) = tokio::join!(driver.push_state_matrix(one_state()), async {
            expect(&mut peer).await;
            peer.send(DeviceMessage::Loaded { states: 3 }).await.unwrap();
        });

        assert!(matches!(
            result,
            Err(HardwareError::LoadMismatch {
                expected: 1,
                loaded: 3
            })
        ));
    }

    #[tokio::test]
    async fn abort_waits_for_device_confirmation() {
        let (mut driver, mut peer) = pair();
        ready(&mut driver, &mut peer).await;
        let slot = MatrixSlot::new();
        driver.connect_state_machine(slot.clone());
        slot.install(one_state()).unwrap();
        let abort = driver.abort_handle();

        let (report, _) = tokio::join!(driver.run(), async {
            expect(&mut peer).await;
            peer.send(DeviceMessage::Loaded { states: 1 }).await.unwrap();
            expect(&mut peer).await;
            peer.send(DeviceMessage::StateEntered { state: 0, at_us: 0 })
                .await
                .unwrap();
            abort.abort();
            assert_eq!(expect(&mut peer).await, HostMessage::Abort);
            peer.send(DeviceMessage::Finished {
                aborted: true,
                at_us: 20_000,
            })
            .await
            .unwrap();
        });
        let report = report.unwrap();

        assert_eq!(report.outcome, RunOutcome::Aborted);
        assert!(report.final_outputs().is_empty());
        assert!(!abort.is_aborted());
    }
}
