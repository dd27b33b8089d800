//! Builder API for state matrix construction.
//!
//! States are described with the fluent [`StateSpec`] builder (or the
//! [`state!`](crate::state) and [`transitions!`](crate::transitions) macros)
//! and registered with [`StateMatrix::add_state`](crate::core::StateMatrix::add_state).

pub mod error;
pub mod macros;
pub mod state;

pub use error::{ConfigurationError, LabelKind, MatrixRejected};
pub use state::StateSpec;

use crate::core::END_STATE;

/// A state that asserts `outputs` for `seconds` and then moves to `next`.
///
/// # Example
///
/// ```
/// use trialsm::builder::pulse;
///
/// let spec = pulse("left_valve_on", 0.1, ["ValveL"], "left_valve_off");
/// assert_eq!(spec.target_for("Tup"), Some("left_valve_off"));
/// ```
pub fn pulse<I, S>(name: &str, seconds: f64, outputs: I, next: &str) -> StateSpec
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    StateSpec::new(name)
        .timer(seconds)
        .outputs_on(outputs)
        .on_timeout(next)
}

/// A state that clears `outputs` and waits `seconds` before moving to `next`.
pub fn delay<I, S>(name: &str, seconds: f64, outputs: I, next: &str) -> StateSpec
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    StateSpec::new(name)
        .timer(seconds)
        .outputs_off(outputs)
        .on_timeout(next)
}

/// A state that clears `outputs` and ends the trial after `seconds`.
pub fn final_delay<I, S>(name: &str, seconds: f64, outputs: I) -> StateSpec
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    delay(name, seconds, outputs, END_STATE)
}
