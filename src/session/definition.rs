//! Trial definitions: the experiment side of a session.

use super::controller::{SessionError, SessionHandle};
use super::notify::{Notification, StopReason};
use crate::builder::ConfigurationError;
use crate::core::StateMatrix;
use crate::executor::RunReport;
use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// What a definition wants to do for the next trial.
#[derive(Clone, Debug)]
pub enum NextTrial {
    Run(StateMatrix),
    Stop,
}

/// Experiment logic driven by the session controller.
///
/// `next_trial` is called exactly once per trial index, and only after the
/// previous trial has finished.
#[async_trait]
pub trait TrialDefinition: Send {
    /// Called once when a session starts, before the first `next_trial`.
    async fn session_started(&mut self, _session: &SessionHandle) -> Result<(), SessionError> {
        Ok(())
    }

    /// Build the matrix for `trial_index`, or stop the session.
    fn next_trial(&mut self, trial_index: u32) -> Result<NextTrial, ConfigurationError>;

    fn trial_finished(&mut self, _trial_index: u32, _report: &RunReport) {}

    fn session_stopped(&mut self, _total_trials_completed: u32, _reason: &StopReason) {}
}

/// Drive `definition` from the notifications of `session`.
///
/// The task ends when the controller shuts down and returns the definition,
/// so callers can inspect what it collected.
pub fn attach<D>(session: SessionHandle, mut definition: D) -> JoinHandle<D>
where
    D: TrialDefinition + 'static,
{
    let mut notifications = session.subscribe();

    tokio::spawn(async move {
        loop {
            let notification = tokio::select! {
                biased;
                received = notifications.recv() => match received {
                    Ok(notification) => notification,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Trial definition missed notifications");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = session.closed() => break,
            };

            match notification {
                Notification::SessionStarted { session_id, .. } => {
                    if let Err(e) = definition.session_started(&session).await {
                        warn!(session = %session_id, error = %e, "session_started failed");
                    }
                }
                Notification::PrepareNextTrial { trial_index } => {
                    prepare_trial(&session, &mut definition, trial_index).await;
                }
                Notification::TrialFinished {
                    trial_index,
                    report,
                } => definition.trial_finished(trial_index, &report),
                Notification::SessionStopped {
                    total_trials_completed,
                    reason,
                } => definition.session_stopped(total_trials_completed, &reason),
                Notification::LogMessage(_) => {}
            }
        }

        debug!("Trial definition detached");
        definition
    })
}

async fn prepare_trial<D: TrialDefinition>(
    session: &SessionHandle,
    definition: &mut D,
    trial_index: u32,
) {
    let reason = match definition.next_trial(trial_index) {
        Ok(NextTrial::Run(matrix)) => match session.ready_to_start_trial(&matrix).await {
            Ok(()) => return,
            Err(SessionError::Rejected(rejected)) => StopReason::MatrixRejected(rejected.to_string()),
            Err(SessionError::NotRunning) => {
                debug!(trial = trial_index, "Session ended before the trial started");
                return;
            }
            Err(e) => {
                warn!(trial = trial_index, error = %e, "Trial was not started");
                return;
            }
        },
        Ok(NextTrial::Stop) => StopReason::DefinitionStopped,
        Err(e) => {
            error!(trial = trial_index, error = %e, "Trial definition failed");
            StopReason::MatrixRejected(e.to_string())
        }
    };

    if let Err(e) = session.stop_with(reason).await {
        warn!(error = %e, "Failed to stop session");
    }
}
