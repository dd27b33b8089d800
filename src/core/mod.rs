//! Core state matrix types and logic.
//!
//! This module contains the pure core of the trial engine:
//! - [`StateMatrix`] definitions and their compiled form
//! - Event labels, state indices and output masks
//! - The [`Automaton`] stepping logic every executor shares
//! - Per-trial transition history
//!
//! Nothing in this module touches a clock or a device.

mod automaton;
mod event;
mod history;
mod lines;
mod matrix;

pub use automaton::{Automaton, Entry, Step};
pub use event::{EventId, StateId, Target, END_STATE, MAX_STATES, TIMER_EVENT};
pub use history::{TransitionRecord, TrialHistory};
pub use lines::{OutputMask, MAX_INPUTS, MAX_OUTPUTS};
pub use matrix::{CompiledMatrix, CompiledState, StateMatrix};
