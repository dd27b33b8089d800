//! Builder for a single state of a trial automaton.

use crate::core::TIMER_EVENT;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Definition of one state: timer, entry outputs and outgoing transitions.
///
/// Transition targets are plain names. They may point at states that are
/// added to the matrix later; they are only resolved by
/// [`StateMatrix::finalize`](crate::core::StateMatrix::finalize).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSpec {
    pub name: String,
    /// Seconds before `Tup` fires. Zero means the state never times out.
    #[serde(default)]
    pub timer: f64,
    /// `(event label, target state)` pairs, in declaration order.
    #[serde(default)]
    pub transitions: Vec<(String, String)>,
    #[serde(default)]
    pub outputs_on: Vec<String>,
    #[serde(default)]
    pub outputs_off: Vec<String>,
}

impl StateSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the state timer in seconds.
    pub fn timer(mut self, seconds: f64) -> Self {
        self.timer = seconds;
        self
    }

    pub fn timer_duration(self, duration: Duration) -> Self {
        self.timer(duration.as_secs_f64())
    }

    /// Add a transition taken when `event` fires in this state.
    pub fn on(mut self, event: impl Into<String>, target: impl Into<String>) -> Self {
        self.transitions.push((event.into(), target.into()));
        self
    }

    /// Add the `Tup` transition.
    pub fn on_timeout(self, target: impl Into<String>) -> Self {
        self.on(TIMER_EVENT, target)
    }

    /// Add several transitions at once, e.g. from [`transitions!`](crate::transitions).
    pub fn transitions<I, E, T>(mut self, transitions: I) -> Self
    where
        I: IntoIterator<Item = (E, T)>,
        E: Into<String>,
        T: Into<String>,
    {
        self.transitions.extend(
            transitions
                .into_iter()
                .map(|(event, target)| (event.into(), target.into())),
        );
        self
    }

    /// Outputs asserted on entry.
    pub fn outputs_on<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs_on.extend(outputs.into_iter().map(Into::into));
        self
    }

    /// Outputs cleared on entry.
    pub fn outputs_off<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs_off.extend(outputs.into_iter().map(Into::into));
        self
    }

    /// Target of the transition for `event`, if any.
    pub fn target_for(&self, event: &str) -> Option<&str> {
        self.transitions
            .iter()
            .find(|(label, _)| label == event)
            .map(|(_, target)| target.as_str())
    }
}
