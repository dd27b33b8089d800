//! Session orchestration.
//!
//! A [`SessionController`] owns one executor and sequences trials on it:
//!
//! ```text
//! start() -> PrepareNextTrial(0) -> ready_to_start_trial(matrix) -> run
//!         -> TrialFinished(0) -> PrepareNextTrial(1) -> ... -> SessionStopped
//! ```
//!
//! Experiment logic implements [`TrialDefinition`] and is driven by
//! [`attach`].
//!
//! # Example
//!
//! ```rust,no_run
//! use trialsm::builder::{final_delay, pulse, ConfigurationError};
//! use trialsm::config::{build_executor, RigConfig, SessionConfig};
//! use trialsm::core::StateMatrix;
//! use trialsm::session::{attach, NextTrial, SessionController, TrialDefinition};
//!
//! struct Flash(StateMatrix);
//!
//! impl TrialDefinition for Flash {
//!     fn next_trial(&mut self, _trial: u32) -> Result<NextTrial, ConfigurationError> {
//!         self.0.reset_transitions();
//!         self.0.add_state(pulse("on", 0.1, ["Led"], "off"))?;
//!         self.0.add_state(final_delay("off", 0.4, ["Led"]))?;
//!         Ok(NextTrial::Run(self.0.clone()))
//!     }
//! }
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let rig = RigConfig::emulated(["Cin"], ["Led"]);
//! let session = SessionController::spawn(
//!     build_executor(&rig)?,
//!     SessionConfig::default().with_max_trials(5),
//! )
//! .await?;
//!
//! let matrix = StateMatrix::new(rig.inputs.clone(), rig.outputs.clone())?;
//! let definition = attach(session.clone(), Flash(matrix));
//! session.start().await?;
//! session.wait_idle().await?;
//! session.shutdown().await?;
//! definition.await?;
//! # Ok(())
//! # }
//! ```

mod controller;
mod definition;
mod notify;

pub use crate::config::{HardwarePolicy, SessionConfig};
pub use controller::{SessionController, SessionError, SessionHandle};
pub use definition::{attach, NextTrial, TrialDefinition};
pub use notify::{Notification, Phase, SessionTimeoutError, StopReason};
