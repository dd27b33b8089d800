//! Event labels, state indices and transition targets.
//!
//! A [`StateMatrix`](super::StateMatrix) refers to everything by name. Once it
//! is finalized, names are resolved into the small index types defined here so
//! that executors never compare strings while a trial is running.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved event label fired when a state's timer expires.
pub const TIMER_EVENT: &str = "Tup";

/// Reserved transition target that terminates the trial automaton.
pub const END_STATE: &str = "END";

/// Most states a matrix may hold; every index stays below the wire's `END`
/// code (`0xFFFF`).
pub const MAX_STATES: usize = u16::MAX as usize;

/// Index of a state inside a compiled matrix.
///
/// States are numbered in declaration order; `StateId(0)` is the entry state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateId(pub(crate) u16);

impl StateId {
    /// The entry state of every matrix.
    pub const ENTRY: StateId = StateId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Resolved event label.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventId {
    /// The state timer expired (`Tup`).
    Timer,
    /// Declared input line, by position in the matrix's input list.
    Input(u8),
}

impl EventId {
    /// Wire code: 0 for the timer, `i + 1` for input `i`.
    pub fn code(self) -> u8 {
        match self {
            Self::Timer => 0,
            Self::Input(i) => i + 1,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Timer,
            n => Self::Input(n - 1),
        }
    }
}

/// Where a transition leads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    State(StateId),
    End,
}

impl Target {
    pub fn is_end(self) -> bool {
        matches!(self, Self::End)
    }
}
