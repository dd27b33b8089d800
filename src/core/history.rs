//! Transition history of a single trial run.
//!
//! Every executor records the same kind of history, which is what makes
//! emulator and device runs directly comparable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Record of a single transition.
///
/// `at` is the offset from the start of the run on the executor's clock;
/// `timestamp` is the host wall-clock time at which it was recorded.
///
/// # Example
///
/// ```rust
/// use trialsm::core::TransitionRecord;
/// use chrono::Utc;
/// use std::time::Duration;
///
/// let record = TransitionRecord {
///     from: "wait".to_string(),
///     event: "Cin".to_string(),
///     to: "reward".to_string(),
///     at: Duration::from_millis(420),
///     timestamp: Utc::now(),
/// };
/// assert!(!record.is_terminal());
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// The state being left
    pub from: String,
    /// The event label that caused the transition
    pub event: String,
    /// The state being entered, or `END`
    pub to: String,
    /// Offset from the start of the run
    pub at: Duration,
    /// When the transition was recorded
    pub timestamp: DateTime<Utc>,
}

impl TransitionRecord {
    pub fn is_terminal(&self) -> bool {
        self.to == super::END_STATE
    }
}

/// Ordered history of one trial's transitions.
///
/// # Example
///
/// ```rust
/// use trialsm::core::{TrialHistory, TransitionRecord};
/// use chrono::Utc;
/// use std::time::Duration;
///
/// let mut history = TrialHistory::new("left_valve_on");
/// history.push(TransitionRecord {
///     from: "left_valve_on".to_string(),
///     event: "Tup".to_string(),
///     to: "END".to_string(),
///     at: Duration::from_millis(100),
///     timestamp: Utc::now(),
/// });
///
/// assert_eq!(history.get_path(), vec!["left_valve_on", "END"]);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrialHistory {
    entry: Option<String>,
    transitions: Vec<TransitionRecord>,
}

impl TrialHistory {
    /// Create a history starting at `entry`.
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            entry: Some(entry.into()),
            transitions: Vec::new(),
        }
    }

    pub fn push(&mut self, transition: TransitionRecord) {
        self.transitions.push(transition);
    }

    /// Record a transition, returning a new history and leaving this one untouched.
    pub fn record(&self, transition: TransitionRecord) -> Self {
        let mut next = self.clone();
        next.push(transition);
        next
    }

    pub fn entry(&self) -> Option<&str> {
        self.entry.as_deref()
    }

    /// States traversed in order: the entry state, then each target.
    pub fn get_path(&self) -> Vec<&str> {
        let mut path = Vec::with_capacity(self.transitions.len() + 1);
        if let Some(entry) = &self.entry {
            path.push(entry.as_str());
        }
        for transition in &self.transitions {
            path.push(transition.to.as_str());
        }
        path
    }

    /// `(state, event)` pairs in order. Two runs with the same pairs behaved identically.
    pub fn sequence(&self) -> Vec<(&str, &str)> {
        self.transitions
            .iter()
            .map(|t| (t.from.as_str(), t.event.as_str()))
            .collect()
    }

    /// Offset of the last recorded transition.
    pub fn duration(&self) -> Option<Duration> {
        self.transitions.last().map(|t| t.at)
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    /// True once the run reached `END`.
    pub fn reached_end(&self) -> bool {
        self.transitions
            .last()
            .is_some_and(TransitionRecord::is_terminal)
    }
}
