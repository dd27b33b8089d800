//! Pure stepping logic shared by every executor.
//!
//! The automaton knows nothing about clocks or I/O: it tracks the current
//! state and the output levels implied by the entry actions taken so far.
//! Executors feed it events and carry out the entry actions it returns.

use super::event::{EventId, StateId, Target};
use super::lines::OutputMask;
use super::matrix::CompiledMatrix;
use std::time::Duration;

/// Entry actions for a state that has just become current.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Entry {
    pub state: StateId,
    /// Output levels after applying the state's entry actions.
    pub outputs: OutputMask,
    /// Timer to arm, `None` if the state never times out.
    pub timer: Option<Duration>,
}

/// Outcome of feeding one event to the automaton.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Moved to another state (or re-entered the same one).
    Moved {
        from: StateId,
        event: EventId,
        entry: Entry,
    },
    /// Reached `END`. Outputs are back to the safe default.
    Finished { from: StateId, event: EventId },
    /// The current state has no transition for this event.
    Ignored,
}

/// Runtime position inside a compiled matrix.
#[derive(Debug)]
pub struct Automaton<'m> {
    matrix: &'m CompiledMatrix,
    current: Option<StateId>,
    outputs: OutputMask,
}

impl<'m> Automaton<'m> {
    /// Enter the matrix's entry state with all outputs initially cleared.
    pub fn start(matrix: &'m CompiledMatrix) -> (Self, Entry) {
        let mut automaton = Self {
            matrix,
            current: None,
            outputs: OutputMask::EMPTY,
        };
        let entry = automaton.enter(matrix.entry());
        (automaton, entry)
    }

    pub fn matrix(&self) -> &'m CompiledMatrix {
        self.matrix
    }

    /// Current state, `None` once the automaton finished or halted.
    pub fn current(&self) -> Option<StateId> {
        self.current
    }

    pub fn outputs(&self) -> OutputMask {
        self.outputs
    }

    pub fn is_finished(&self) -> bool {
        self.current.is_none()
    }

    /// Feed one event.
    pub fn handle(&mut self, event: EventId) -> Step {
        let Some(from) = self.current else {
            return Step::Ignored;
        };
        let Some(target) = self.matrix.state(from).and_then(|s| s.target(event)) else {
            return Step::Ignored;
        };

        match target {
            Target::End => {
                self.halt();
                Step::Finished { from, event }
            }
            Target::State(next) => Step::Moved {
                from,
                event,
                entry: self.enter(next),
            },
        }
    }

    /// Stop without reaching `END` and drop every output to the safe default.
    pub fn halt(&mut self) -> OutputMask {
        self.current = None;
        self.outputs = OutputMask::EMPTY;
        self.outputs
    }

    fn enter(&mut self, id: StateId) -> Entry {
        let (on, off, timer) = self
            .matrix
            .state(id)
            .map_or((OutputMask::EMPTY, OutputMask::EMPTY, None), |s| {
                (s.outputs_on, s.outputs_off, s.timer)
            });
        self.current = Some(id);
        self.outputs = self.outputs.apply(on, off);
        Entry {
            state: id,
            outputs: self.outputs,
            timer,
        }
    }
}
