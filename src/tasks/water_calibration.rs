//! Water delivery calibration.
//!
//! Each trial opens the left valve, waits, opens the right valve and waits
//! again, so the volume delivered per opening can be measured.

use crate::builder::ConfigurationError;
use crate::core::{StateMatrix, END_STATE};
use crate::executor::RunReport;
use crate::session::{NextTrial, SessionError, SessionHandle, StopReason, TrialDefinition};
use crate::state;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

pub const LEFT_VALVE: &str = "ValveL";
pub const RIGHT_VALVE: &str = "ValveR";

/// Valve timings in seconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParams {
    pub left_valve_duration: f64,
    pub right_valve_duration: f64,
    pub inter_valve_delay: f64,
    pub n_trials: u32,
}

impl Default for CalibrationParams {
    fn default() -> Self {
        Self {
            left_valve_duration: 0.1,
            right_valve_duration: 0.1,
            inter_valve_delay: 0.5,
            n_trials: 100,
        }
    }
}

/// Alternates the left and right valves for `n_trials` trials.
#[derive(Debug)]
pub struct WaterCalibration {
    params: CalibrationParams,
    matrix: StateMatrix,
    trials_completed: u32,
    reports: Vec<RunReport>,
}

impl WaterCalibration {
    /// `matrix` must declare the [`LEFT_VALVE`] and [`RIGHT_VALVE`] outputs.
    pub fn new(matrix: StateMatrix, params: CalibrationParams) -> Self {
        Self {
            params,
            matrix,
            trials_completed: 0,
            reports: Vec::new(),
        }
    }

    pub fn params(&self) -> &CalibrationParams {
        &self.params
    }

    pub fn trials_completed(&self) -> u32 {
        self.trials_completed
    }

    /// Reports of every finished trial, in order.
    pub fn reports(&self) -> &[RunReport] {
        &self.reports
    }

    /// Rebuild the four-state valve sequence.
    pub fn build_trial(&mut self) -> Result<&StateMatrix, ConfigurationError> {
        let p = &self.params;
        let sm = &mut self.matrix;
        sm.reset_transitions();

        sm.add_state(state! {
            "left_valve_on",
            timer: p.left_valve_duration,
            on: [LEFT_VALVE],
            off: [RIGHT_VALVE],
            transitions: { "Tup" => "left_valve_off" },
        })?;
        sm.add_state(state! {
            "left_valve_off",
            timer: p.inter_valve_delay,
            off: [LEFT_VALVE, RIGHT_VALVE],
            transitions: { "Tup" => "right_valve_on" },
        })?;
        sm.add_state(state! {
            "right_valve_on",
            timer: p.right_valve_duration,
            on: [RIGHT_VALVE],
            off: [LEFT_VALVE],
            transitions: { "Tup" => "right_valve_off" },
        })?;
        sm.add_state(state! {
            "right_valve_off",
            timer: p.inter_valve_delay,
            off: [LEFT_VALVE, RIGHT_VALVE],
            transitions: { "Tup" => END_STATE },
        })?;

        Ok(&self.matrix)
    }
}

#[async_trait]
impl TrialDefinition for WaterCalibration {
    async fn session_started(&mut self, session: &SessionHandle) -> Result<(), SessionError> {
        // Stopping is driven by the trial count.
        session
            .set_session_duration(Duration::from_secs(3600))
            .await?;
        self.trials_completed = 0;
        self.reports.clear();
        info!(trials = self.params.n_trials, "Starting calibration");
        Ok(())
    }

    fn next_trial(&mut self, trial_index: u32) -> Result<NextTrial, ConfigurationError> {
        if trial_index >= self.params.n_trials {
            info!(trials = self.params.n_trials, "Calibration trials done");
            return Ok(NextTrial::Stop);
        }

        let matrix = self.build_trial()?.clone();
        if trial_index == 0 {
            println!("{matrix}");
        }
        Ok(NextTrial::Run(matrix))
    }

    fn trial_finished(&mut self, trial_index: u32, report: &RunReport) {
        if report.completed() {
            self.trials_completed += 1;
        }
        info!(
            trial = trial_index,
            elapsed = ?report.elapsed,
            overruns = report.overruns.len(),
            "Calibration trial finished"
        );
        self.reports.push(report.clone());
    }

    fn session_stopped(&mut self, total_trials_completed: u32, reason: &StopReason) {
        info!(
            trials = total_trials_completed,
            reason = %reason,
            "Calibration completed"
        );
    }
}
