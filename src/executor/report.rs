//! Per-run bookkeeping shared by every executor.

use super::{ExecutorEvent, RunOutcome, TimingOverrunError};
use crate::core::{
    CompiledMatrix, Entry, EventId, OutputMask, StateId, Target, TransitionRecord, TrialHistory,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Output levels changed at `at` (offset from the start of the run).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChange {
    pub at: Duration,
    pub mask: OutputMask,
}

/// Everything observed during one trial run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub history: TrialHistory,
    /// Output levels after every change, in order.
    pub output_trace: Vec<OutputChange>,
    pub overruns: Vec<TimingOverrunError>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn completed(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }

    /// Output levels in effect at offset `at`.
    pub fn outputs_at(&self, at: Duration) -> OutputMask {
        self.output_trace
            .iter()
            .take_while(|change| change.at <= at)
            .last()
            .map_or(OutputMask::EMPTY, |change| change.mask)
    }

    /// Output levels at the end of the run.
    pub fn final_outputs(&self) -> OutputMask {
        self.output_trace
            .last()
            .map_or(OutputMask::EMPTY, |change| change.mask)
    }
}

/// Builds a [`RunReport`] while broadcasting the matching [`ExecutorEvent`]s.
pub(crate) struct RunRecorder {
    matrix: Arc<CompiledMatrix>,
    events: broadcast::Sender<ExecutorEvent>,
    slack: Duration,
    history: TrialHistory,
    output_trace: Vec<OutputChange>,
    overruns: Vec<TimingOverrunError>,
    outputs: OutputMask,
}

impl RunRecorder {
    pub fn new(
        matrix: Arc<CompiledMatrix>,
        events: broadcast::Sender<ExecutorEvent>,
        slack: Duration,
    ) -> Self {
        let history = TrialHistory::new(matrix.state_name(matrix.entry()));
        Self {
            matrix,
            events,
            slack,
            history,
            output_trace: Vec::new(),
            overruns: Vec::new(),
            outputs: OutputMask::EMPTY,
        }
    }

    pub fn entered(&mut self, entry: &Entry, at: Duration) {
        let state = self.matrix.state_name(entry.state).to_string();
        debug!(state = %state, at = ?at, "Entered state");
        let _ = self.events.send(ExecutorEvent::StateEntered { state, at });
        self.outputs(entry.outputs, at);
    }

    pub fn transition(&mut self, from: StateId, event: EventId, to: Target, at: Duration) {
        let record = TransitionRecord {
            from: self.matrix.state_name(from).to_string(),
            event: self.matrix.event_label(event).to_string(),
            to: self.matrix.target_name(to).to_string(),
            at,
            timestamp: Utc::now(),
        };
        debug!(
            from = %record.from,
            event = %record.event,
            to = %record.to,
            "Transition"
        );
        let _ = self.events.send(ExecutorEvent::Transition {
            from: record.from.clone(),
            event: record.event.clone(),
            to: record.to.clone(),
            at,
        });
        self.history.push(record);
    }

    /// Note a timer expiry; reports an overrun when it fired too late.
    pub fn timer_fired(&mut self, state: StateId, nominal: Duration, late_by: Duration) {
        if late_by <= self.slack {
            return;
        }
        let overrun = TimingOverrunError {
            state: self.matrix.state_name(state).to_string(),
            nominal,
            late_by,
            slack: self.slack,
        };
        warn!(
            state = %overrun.state,
            late_by = ?late_by,
            "Timing overrun"
        );
        let _ = self.events.send(ExecutorEvent::TimingOverrun(overrun.clone()));
        self.overruns.push(overrun);
    }

    /// Record new output levels, skipping no-op changes.
    pub fn outputs(&mut self, mask: OutputMask, at: Duration) {
        if mask == self.outputs {
            return;
        }
        self.outputs = mask;
        self.output_trace.push(OutputChange { at, mask });
        let _ = self.events.send(ExecutorEvent::OutputsChanged {
            mask,
            asserted: self
                .matrix
                .output_names(mask)
                .into_iter()
                .map(str::to_string)
                .collect(),
            at,
        });
    }

    pub fn finish(mut self, outcome: RunOutcome, elapsed: Duration) -> RunReport {
        self.outputs(OutputMask::EMPTY, elapsed);
        let _ = self.events.send(ExecutorEvent::RunFinished {
            outcome,
            at: elapsed,
        });
        RunReport {
            outcome,
            history: self.history,
            output_trace: self.output_trace,
            overruns: self.overruns,
            elapsed,
        }
    }
}
