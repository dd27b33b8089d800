//! Trialsm: timed trial state machines for behavioral rigs
//!
//! An experiment describes each trial as a small automaton: named states with
//! a timer, the output lines they assert or clear on entry, and transitions
//! taken on input events or on timer expiry (`Tup`). The automaton is validated
//! once per trial and then executed either by a microcontroller behind a
//! serial link or by an in-process emulator.
//!
//! # Core Concepts
//!
//! - **StateMatrix**: declarative trial automaton, rebuilt for every trial
//! - **HardwareExecutor**: runs one finalized matrix to `END` with
//!   millisecond-accurate timers
//! - **SessionController**: sequences trials, enforces limits and reports
//!   progress through notifications
//! - **TrialDefinition**: experiment logic supplying the next trial's matrix
//!
//! # Example
//!
//! ```rust
//! use trialsm::builder::StateSpec;
//! use trialsm::core::StateMatrix;
//!
//! let mut sm = StateMatrix::new(["Cin"], ["ValveL", "ValveR"]).unwrap();
//! sm.reset_transitions();
//! sm.add_state(
//!     StateSpec::new("wait_for_poke")
//!         .timer(5.0)
//!         .on("Cin", "reward")
//!         .on_timeout("END"),
//! )
//! .unwrap();
//! sm.add_state(
//!     StateSpec::new("reward")
//!         .timer(0.1)
//!         .outputs_on(["ValveL"])
//!         .on_timeout("END"),
//! )
//! .unwrap();
//!
//! let compiled = sm.finalize().unwrap();
//! assert_eq!(compiled.state_name(compiled.entry()), "wait_for_poke");
//! ```

pub mod builder;
pub mod config;
pub mod core;
pub mod error;
pub mod executor;
pub mod logging;
pub mod session;
pub mod tasks;
pub mod validation;

// Re-export commonly used types
pub use builder::{ConfigurationError, MatrixRejected, StateSpec};
pub use config::RigConfig;
pub use core::{CompiledMatrix, StateMatrix, END_STATE, TIMER_EVENT};
pub use error::{Error, Result};
pub use executor::{Emulator, HardwareError, HardwareExecutor, RunReport};
pub use session::{
    attach, Notification, SessionController, SessionError, SessionHandle, StopReason,
    TrialDefinition,
};
