//! Messages exchanged with the state machine firmware.
//!
//! # Session
//!
//! ```text
//! Host                                      Device
//!   |  -- Declare { inputs, outputs } -->     |
//!   |  <-- Ready { firmware } | Error --------|
//!   |                                         |
//!   |  -- LoadMatrix { states } -->           |   once per trial
//!   |  <-- Loaded { states } | Error --------|
//!   |  -- Run -->                             |
//!   |  <-- StateEntered / Transition ... -----|
//!   |  -- Abort -->  (optional)               |
//!   |  <-- Finished { aborted } -------------|
//! ```
//!
//! States, events and lines travel as indices. Event code 0 is the timer
//! (`Tup`), code `i + 1` is declared input `i`; target [`END_TARGET`] ends
//! the run. Device timestamps are microseconds since `Run`.

use super::ProtocolError;
use crate::core::{CompiledMatrix, StateId, Target};
use serde::{Deserialize, Serialize};

/// Wire value of the `END` target.
pub const END_TARGET: u16 = 0xFFFF;

/// Host to device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostMessage {
    /// Declare line labels once per connection, with optional pin numbers.
    Declare {
        inputs: Vec<String>,
        outputs: Vec<String>,
        pins: Vec<(String, u8)>,
    },
    LoadMatrix { states: Vec<WireState> },
    Run,
    Abort,
    /// Drive the outputs directly; `0` is the safe default.
    ForceOutputs { mask: u32 },
}

/// Device to host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceMessage {
    Ready { firmware: String },
    Error { reason: String },
    Loaded { states: u16 },
    StateEntered { state: u16, at_us: u64 },
    Transition {
        from: u16,
        event: u8,
        to: u16,
        at_us: u64,
    },
    Finished { aborted: bool, at_us: u64 },
}

/// One state in the device encoding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireState {
    /// Timer in microseconds, 0 for none.
    pub timer_us: u32,
    pub on_mask: u32,
    pub off_mask: u32,
    /// `(event code, target)` pairs.
    pub transitions: Vec<(u8, u16)>,
}

impl WireState {
    pub fn target(&self, event: u8) -> Option<u16> {
        self.transitions
            .iter()
            .find(|(code, _)| *code == event)
            .map(|(_, target)| *target)
    }
}

pub fn target_to_wire(target: Target) -> u16 {
    match target {
        Target::State(id) => id.0,
        Target::End => END_TARGET,
    }
}

pub fn target_from_wire(raw: u16) -> Target {
    match raw {
        END_TARGET => Target::End,
        index => Target::State(StateId(index)),
    }
}

/// Translate a compiled matrix into the device encoding.
pub fn encode_matrix(matrix: &CompiledMatrix) -> Result<Vec<WireState>, ProtocolError> {
    if matrix.len() >= END_TARGET as usize {
        return Err(ProtocolError::Unencodable {
            reason: format!("{} states exceed the device limit", matrix.len()),
        });
    }

    matrix
        .states()
        .iter()
        .map(|state| {
            let timer_us = match state.timer {
                Some(timer) => u32::try_from(timer.as_micros())
                    .ok()
                    .filter(|us| *us > 0)
                    .ok_or_else(|| ProtocolError::Unencodable {
                        reason: format!(
                            "timer {:?} of state '{}' is outside the device range",
                            timer, state.name
                        ),
                    })?,
                None => 0,
            };
            Ok(WireState {
                timer_us,
                on_mask: state.outputs_on.bits(),
                off_mask: state.outputs_off.bits(),
                transitions: state
                    .transitions
                    .iter()
                    .map(|(event, target)| (event.code(), target_to_wire(*target)))
                    .collect(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::StateSpec;
    use crate::core::StateMatrix;

    #[test]
    fn encodes_timers_masks_and_targets() {
        let mut sm = StateMatrix::new(["Lin", "Cin"], ["ValveL", "ValveR"]).unwrap();
        sm.add_state(
            StateSpec::new("wait")
                .on("Cin", "reward")
                .on("Lin", "END")
                .outputs_off(["ValveL", "ValveR"]),
        )
        .unwrap();
        sm.add_state(
            StateSpec::new("reward")
                .timer(0.25)
                .on_timeout("END")
                .outputs_on(["ValveR"]),
        )
        .unwrap();

        let states = encode_matrix(&sm.finalize().unwrap()).unwrap();

        assert_eq!(states.len(), 2);
        assert_eq!(states[0].timer_us, 0);
        assert_eq!(states[0].off_mask, 0b11);
        assert_eq!(states[0].target(2), Some(1));
        assert_eq!(states[0].target(1), Some(END_TARGET));
        assert_eq!(states[0].target(0), None);
        assert_eq!(states[1].timer_us, 250_000);
        assert_eq!(states[1].on_mask, 0b10);
    }

    #[test]
    fn sub_microsecond_timer_is_unencodable() {
        let mut sm = StateMatrix::new(["Cin"], ["ValveL"]).unwrap();
        sm.add_state(StateSpec::new("blip").timer(1e-9).on_timeout("END"))
            .unwrap();

        assert!(matches!(
            encode_matrix(&sm.finalize().unwrap()),
            Err(ProtocolError::Unencodable { .. })
        ));
    }

    #[test]
    fn wire_targets_convert_both_ways() {
        assert_eq!(target_from_wire(END_TARGET), Target::End);
        assert_eq!(target_from_wire(3), Target::State(StateId(3)));
        assert_eq!(target_to_wire(Target::State(StateId(7))), 7);
    }
}
