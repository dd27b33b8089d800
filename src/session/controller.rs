//! The session controller actor and its handle.
//!
//! The controller owns the executor and runs as its own task. Callers talk to
//! it through a cloneable [`SessionHandle`] (commands with oneshot replies)
//! and observe it through a broadcast of [`Notification`]s. Each trial runs
//! on a separate worker task; the controller keeps only its `JoinHandle`, so
//! it stays responsive to `stop()` and the watchdog while a trial is in flight.

use super::notify::{Notification, Phase, SessionTimeoutError, StopReason};
use crate::builder::MatrixRejected;
use crate::config::{HardwarePolicy, SessionConfig};
use crate::core::{CompiledMatrix, StateMatrix};
use crate::executor::timing::wait_for_deadline;
use crate::executor::{
    AbortHandle, ExecutorEvent, HardwareError, HardwareExecutor, MatrixSlot, RunReport,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const COMMAND_CAPACITY: usize = 32;
const NOTIFICATION_CAPACITY: usize = 256;

/// Errors returned by [`SessionHandle`] operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Rejected(#[from] MatrixRejected),

    #[error("No session is running")]
    NotRunning,

    #[error("A session is already running")]
    AlreadyRunning,

    #[error("A trial is already in flight")]
    TrialInFlight,

    #[error("The controller is not waiting for a trial matrix")]
    NotAwaitingTrial,

    #[error("Session controller has shut down")]
    ControllerGone,

    #[error(transparent)]
    Hardware(#[from] HardwareError),
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;
type RunResult = Result<Result<RunReport, HardwareError>, JoinError>;

#[derive(Debug)]
enum Command {
    Start {
        response: Reply<()>,
    },
    ReadyToStartTrial {
        matrix: Arc<CompiledMatrix>,
        response: Reply<()>,
    },
    Stop {
        reason: StopReason,
        response: Reply<()>,
    },
    SetSessionDuration {
        duration: Duration,
        response: Reply<()>,
    },
    Shutdown {
        response: Reply<()>,
    },
}

enum Wake {
    Watchdog,
    TrialDone(RunResult),
    Executor(ExecutorEvent),
    Command(Command),
    Closed,
}

/// State of the running session.
#[derive(Debug)]
struct Session {
    id: Uuid,
    trial_index: u32,
    trials_completed: u32,
    started: Instant,
    started_at: DateTime<Utc>,
    max_duration: Duration,
    max_trials: Option<u32>,
    awaiting_matrix: bool,
}

impl Session {
    fn deadline(&self) -> Option<Instant> {
        self.started.checked_add(self.max_duration)
    }

    fn limit_reached(&self) -> bool {
        self.max_trials.is_some_and(|max| self.trial_index >= max)
    }
}

/// Sequences trials on one executor.
///
/// Lifecycle: `Idle -> Running -> Stopping -> Idle`.
///
/// When the watchdog and another stop cause become ready together, the
/// watchdog wins and the session is reported as timed out.
pub struct SessionController {
    interface: String,
    executor: Arc<Mutex<Box<dyn HardwareExecutor>>>,
    slot: MatrixSlot,
    abort: AbortHandle,
    executor_events: Option<broadcast::Receiver<ExecutorEvent>>,
    notifications: broadcast::Sender<Notification>,
    phase: watch::Sender<Phase>,
    config: SessionConfig,
    session: Option<Session>,
    in_flight: Option<JoinHandle<Result<RunReport, HardwareError>>>,
}

impl SessionController {
    /// Connect `executor` and start the controller task.
    pub async fn spawn(
        mut executor: Box<dyn HardwareExecutor>,
        config: SessionConfig,
    ) -> Result<SessionHandle, HardwareError> {
        let slot = MatrixSlot::new();
        executor.connect_state_machine(slot.clone());
        let executor_events = executor.subscribe();
        executor.connect().await?;

        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let (phase, phase_rx) = watch::channel(Phase::Idle);

        let controller = Self {
            interface: executor.name().to_string(),
            abort: executor.abort_handle(),
            executor: Arc::new(Mutex::new(executor)),
            slot,
            executor_events: Some(executor_events),
            notifications: notifications.clone(),
            phase,
            config,
            session: None,
            in_flight: None,
        };
        tokio::spawn(controller.run(command_rx));

        Ok(SessionHandle {
            commands,
            notifications,
            phase: phase_rx,
        })
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        info!(interface = %self.interface, "Session controller started");

        loop {
            let deadline = self.session.as_ref().and_then(Session::deadline);
            let wake = tokio::select! {
                biased;
                _ = wait_for_deadline(deadline, Duration::ZERO) => Wake::Watchdog,
                done = join_run(&mut self.in_flight) => Wake::TrialDone(done),
                event = next_event(&mut self.executor_events) => Wake::Executor(event),
                command = commands.recv() => match command {
                    Some(command) => Wake::Command(command),
                    None => Wake::Closed,
                },
            };

            match wake {
                Wake::Watchdog => self.on_watchdog().await,
                Wake::TrialDone(done) => {
                    self.in_flight = None;
                    self.on_trial_done(done).await;
                }
                Wake::Executor(event) => self.on_executor_event(event),
                Wake::Command(command) => {
                    if !self.on_command(command).await {
                        break;
                    }
                }
                Wake::Closed => {
                    if let Err(e) = self.shutdown().await {
                        warn!(error = %e, "Failed to close executor");
                    }
                    break;
                }
            }
        }

        info!(interface = %self.interface, "Session controller stopped");
    }

    /// Returns false once the controller should exit.
    async fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::Start { response } => {
                let result = self.start_session().await;
                let _ = response.send(result);
            }
            Command::ReadyToStartTrial { matrix, response } => {
                let _ = response.send(self.start_trial(matrix));
            }
            Command::Stop { reason, response } => {
                self.stop_session(reason).await;
                let _ = response.send(Ok(()));
            }
            Command::SetSessionDuration { duration, response } => {
                let _ = response.send(self.set_session_duration(duration));
            }
            Command::Shutdown { response } => {
                let _ = response.send(self.shutdown().await);
                return false;
            }
        }
        true
    }

    async fn start_session(&mut self) -> Result<(), SessionError> {
        if self.session.is_some() {
            return Err(SessionError::AlreadyRunning);
        }

        self.abort.rearm();
        let session = Session {
            id: Uuid::new_v4(),
            trial_index: 0,
            trials_completed: 0,
            started: Instant::now(),
            started_at: Utc::now(),
            max_duration: self.config.max_duration(),
            max_trials: self.config.max_trials,
            awaiting_matrix: false,
        };
        info!(
            session = %session.id,
            max_trials = ?session.max_trials,
            max_duration = ?session.max_duration,
            "Session started"
        );
        self.notify(Notification::SessionStarted {
            session_id: session.id,
            started_at: session.started_at,
        });
        self.session = Some(session);
        self.phase.send_replace(Phase::Running);

        self.advance().await;
        Ok(())
    }

    /// Request the next trial, or stop once the trial limit is reached.
    async fn advance(&mut self) {
        let limit_reached = match &self.session {
            Some(session) => session.limit_reached(),
            None => return,
        };
        if limit_reached {
            self.stop_session(StopReason::TrialLimit).await;
            return;
        }

        if let Some(session) = self.session.as_mut() {
            session.awaiting_matrix = true;
            let trial_index = session.trial_index;
            debug!(trial = trial_index, "Requesting trial");
            self.notify(Notification::PrepareNextTrial { trial_index });
        }
    }

    fn start_trial(&mut self, matrix: Arc<CompiledMatrix>) -> Result<(), SessionError> {
        let session = self.session.as_mut().ok_or(SessionError::NotRunning)?;
        if self.in_flight.is_some() {
            return Err(SessionError::TrialInFlight);
        }
        if !session.awaiting_matrix {
            return Err(SessionError::NotAwaitingTrial);
        }

        self.slot.install(matrix)?;
        session.awaiting_matrix = false;
        info!(trial = session.trial_index, "Starting trial");

        let executor = self.executor.clone();
        self.in_flight = Some(tokio::spawn(async move {
            let mut executor = executor.lock().await;
            executor.run().await
        }));
        Ok(())
    }

    async fn on_trial_done(&mut self, done: RunResult) {
        if let Some(fault) = self.settle_trial(done) {
            if self.config.on_hardware_error == HardwarePolicy::Stop {
                self.stop_session(StopReason::HardwareFault(fault)).await;
                return;
            }
            info!("Continuing after hardware error");
        }
        self.advance().await;
    }

    /// Account for a finished run. Returns the failure reason, if any.
    fn settle_trial(&mut self, done: RunResult) -> Option<String> {
        let trial_index = match self.session.as_mut() {
            Some(session) => {
                let trial_index = session.trial_index;
                session.trial_index += 1;
                trial_index
            }
            None => return None,
        };

        match done {
            Ok(Ok(report)) => {
                if report.completed() {
                    if let Some(session) = self.session.as_mut() {
                        session.trials_completed += 1;
                    }
                }
                info!(
                    trial = trial_index,
                    outcome = ?report.outcome,
                    overruns = report.overruns.len(),
                    "Trial finished"
                );
                self.notify(Notification::TrialFinished {
                    trial_index,
                    report: Arc::new(report),
                });
                None
            }
            Ok(Err(e)) => {
                error!(trial = trial_index, error = %e, "Trial failed");
                self.log(format!("Hardware error in trial {trial_index}: {e}"));
                Some(e.to_string())
            }
            Err(e) => {
                error!(trial = trial_index, error = %e, "Trial task failed");
                let reason = format!("trial task failed: {e}");
                self.log(format!("Trial {trial_index} failed: {reason}"));
                Some(reason)
            }
        }
    }

    async fn on_watchdog(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        let timeout = SessionTimeoutError {
            elapsed: session.started.elapsed(),
            limit: session.max_duration,
        };
        warn!(
            session = %session.id,
            elapsed = ?timeout.elapsed,
            "Session time limit reached"
        );
        self.stop_session(StopReason::SessionTimeout(timeout)).await;
    }

    /// Force the controller back to idle. A no-op when no session is running.
    async fn stop_session(&mut self, reason: StopReason) {
        if self.session.is_none() {
            return;
        }
        self.phase.send_replace(Phase::Stopping);

        if let Some(task) = self.in_flight.take() {
            debug!("Aborting in-flight trial");
            self.abort.abort();
            let done = task.await;
            if let Some(fault) = self.settle_trial(done) {
                warn!(error = %fault, "Trial failed while stopping");
            }
        }
        if let Err(e) = self.slot.clear() {
            warn!(error = %e, "Failed to clear matrix slot");
        }
        self.abort.rearm();

        let Some(session) = self.session.take() else {
            return;
        };
        let total = session.trials_completed;
        info!(
            session = %session.id,
            trials_completed = total,
            elapsed = ?session.started.elapsed(),
            reason = %reason,
            "Session stopped"
        );
        self.log(format!("Session stopped after {total} trials: {reason}"));
        self.notify(Notification::SessionStopped {
            total_trials_completed: total,
            reason,
        });
        self.phase.send_replace(Phase::Idle);
    }

    fn set_session_duration(&mut self, duration: Duration) -> Result<(), SessionError> {
        let session = self.session.as_mut().ok_or(SessionError::NotRunning)?;
        session.max_duration = duration;
        debug!(max_duration = ?duration, "Session duration updated");
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), SessionError> {
        self.stop_session(StopReason::Requested).await;
        self.executor.lock().await.close().await?;
        Ok(())
    }

    fn on_executor_event(&self, event: ExecutorEvent) {
        match event {
            ExecutorEvent::Ready { interface } => self.log(format!("{interface} ready")),
            ExecutorEvent::TimingOverrun(overrun) => self.log(overrun.to_string()),
            ExecutorEvent::Error { reason } => {
                warn!(reason = %reason, "Executor error");
                self.log(format!("Executor error: {reason}"));
            }
            _ => {}
        }
    }

    fn notify(&self, notification: Notification) {
        let _ = self.notifications.send(notification);
    }

    fn log(&self, message: String) {
        self.notify(Notification::LogMessage(message));
    }
}

async fn join_run(in_flight: &mut Option<JoinHandle<Result<RunReport, HardwareError>>>) -> RunResult {
    match in_flight {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

async fn next_event(events: &mut Option<broadcast::Receiver<ExecutorEvent>>) -> ExecutorEvent {
    loop {
        let Some(receiver) = events.as_mut() else {
            return std::future::pending().await;
        };
        match receiver.recv().await {
            Ok(event) => return event,
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "Skipped executor events"),
            Err(RecvError::Closed) => *events = None,
        }
    }
}

/// Cloneable handle to a running [`SessionController`].
#[derive(Clone, Debug)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    notifications: broadcast::Sender<Notification>,
    phase: watch::Receiver<Phase>,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (response, reply) = oneshot::channel();
        self.commands
            .send(command(response))
            .await
            .map_err(|_| SessionError::ControllerGone)?;
        reply.await.map_err(|_| SessionError::ControllerGone)?
    }

    /// Start a session and request trial 0.
    pub async fn start(&self) -> Result<(), SessionError> {
        self.request(|response| Command::Start { response }).await
    }

    /// Hand the matrix for the pending trial to the executor and run it.
    ///
    /// The matrix is finalized here; a rejected matrix is reported and never
    /// reaches the executor.
    pub async fn ready_to_start_trial(&self, matrix: &StateMatrix) -> Result<(), SessionError> {
        let compiled = match matrix.finalize() {
            Ok(compiled) => compiled,
            Err(rejected) => {
                error!(error = %rejected, "Trial matrix rejected");
                let _ = self
                    .notifications
                    .send(Notification::LogMessage(rejected.to_string()));
                return Err(rejected.into());
            }
        };
        let matrix = Arc::new(compiled);
        self.request(|response| Command::ReadyToStartTrial { matrix, response })
            .await
    }

    /// Stop the session, aborting any trial in flight.
    pub async fn stop(&self) -> Result<(), SessionError> {
        self.stop_with(StopReason::Requested).await
    }

    pub async fn stop_with(&self, reason: StopReason) -> Result<(), SessionError> {
        self.request(|response| Command::Stop { reason, response })
            .await
    }

    /// Change the running session's time limit, measured from its start.
    pub async fn set_session_duration(&self, duration: Duration) -> Result<(), SessionError> {
        self.request(|response| Command::SetSessionDuration { duration, response })
            .await
    }

    /// Stop any session, close the executor and end the controller task.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.request(|response| Command::Shutdown { response })
            .await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Wait until no session is running.
    pub async fn wait_idle(&self) -> Result<(), SessionError> {
        let mut phase = self.phase.clone();
        phase
            .wait_for(|phase| *phase == Phase::Idle)
            .await
            .map_err(|_| SessionError::ControllerGone)?;
        Ok(())
    }

    /// Completes once the controller task has exited.
    pub async fn closed(&self) {
        self.commands.closed().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::StateSpec;
    use crate::config::TimingConfig;
    use crate::executor::Emulator;

    async fn controller() -> SessionHandle {
        let emulator = Emulator::new(
            vec!["Cin".to_string()],
            vec!["ValveL".to_string()],
            TimingConfig::default(),
        );
        SessionController::spawn(Box::new(emulator), SessionConfig::default())
            .await
            .unwrap()
    }

    /// Next notification that is not a log line.
    async fn next(rx: &mut broadcast::Receiver<Notification>) -> Notification {
        loop {
            match rx.recv().await.unwrap() {
                Notification::LogMessage(_) => continue,
                notification => return notification,
            }
        }
    }

    fn flash() -> StateMatrix {
        let mut sm = StateMatrix::new(["Cin"], ["ValveL"]).unwrap();
        sm.add_state(
            StateSpec::new("flash")
                .timer(0.1)
                .outputs_on(["ValveL"])
                .on_timeout("END"),
        )
        .unwrap();
        sm
    }

    #[tokio::test]
    async fn starts_idle() {
        let session = controller().await;
        assert_eq!(session.phase(), Phase::Idle);
        session.wait_idle().await.unwrap();
    }

    #[tokio::test]
    async fn second_start_is_refused() {
        let session = controller().await;
        session.start().await.unwrap();
        assert_eq!(session.phase(), Phase::Running);
        assert!(matches!(
            session.start().await,
            Err(SessionError::AlreadyRunning)
        ));
    }

    #[tokio::test]
    async fn trial_needs_a_running_session() {
        let session = controller().await;
        assert!(matches!(
            session.ready_to_start_trial(&flash()).await,
            Err(SessionError::NotRunning)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_trial_per_request() {
        let session = controller().await;
        let mut rx = session.subscribe();
        session.start().await.unwrap();
        assert!(matches!(
            next(&mut rx).await,
            Notification::SessionStarted { .. }
        ));
        assert!(matches!(
            next(&mut rx).await,
            Notification::PrepareNextTrial { trial_index: 0 }
        ));

        session.ready_to_start_trial(&flash()).await.unwrap();
        assert!(matches!(
            session.ready_to_start_trial(&flash()).await,
            Err(SessionError::TrialInFlight)
        ));

        assert!(matches!(
            next(&mut rx).await,
            Notification::TrialFinished { trial_index: 0, .. }
        ));
        assert!(matches!(
            next(&mut rx).await,
            Notification::PrepareNextTrial { trial_index: 1 }
        ));
        session.stop().await.unwrap();
        assert!(matches!(
            session.ready_to_start_trial(&flash()).await,
            Err(SessionError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn rejected_matrix_is_reported_without_running() {
        let session = controller().await;
        let mut rx = session.subscribe();
        session.start().await.unwrap();

        let mut broken = StateMatrix::new(["Cin"], ["ValveL"]).unwrap();
        broken
            .add_state(StateSpec::new("a").on_timeout("b"))
            .unwrap();
        assert!(matches!(
            session.ready_to_start_trial(&broken).await,
            Err(SessionError::Rejected(_))
        ));

        loop {
            if let Notification::LogMessage(message) = rx.recv().await.unwrap() {
                if message.contains("unknown state 'b'") {
                    break;
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_duration_never_trips_the_watchdog() {
        let emulator = Emulator::new(
            vec!["Cin".to_string()],
            vec!["ValveL".to_string()],
            TimingConfig::default(),
        );
        let config = SessionConfig::default().with_max_duration(Duration::MAX);
        let session = SessionController::spawn(Box::new(emulator), config)
            .await
            .unwrap();

        session.start().await.unwrap();
        session.set_session_duration(Duration::MAX).await.unwrap();
        tokio::time::sleep(Duration::from_secs(86_400)).await;
        assert_eq!(session.phase(), Phase::Running);

        session.stop().await.unwrap();
        assert_eq!(session.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn shutdown_ends_the_controller() {
        let session = controller().await;
        session.start().await.unwrap();
        session.shutdown().await.unwrap();
        session.closed().await;

        assert!(matches!(
            session.start().await,
            Err(SessionError::ControllerGone)
        ));
    }
}
