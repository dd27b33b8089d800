//! The state matrix: declarative definition of one trial's automaton.

use super::event::{EventId, StateId, Target, END_STATE, TIMER_EVENT};
use super::lines::OutputMask;
use crate::builder::{ConfigurationError, LabelKind, MatrixRejected, StateSpec};
use crate::validation::{self, rules};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Trial automaton under construction.
///
/// A matrix is created once with the rig's declared input and output labels,
/// then rebuilt for every trial with [`reset_transitions`](Self::reset_transitions)
/// followed by [`add_state`](Self::add_state) calls. The first state added
/// after a reset is the entry state. Execution order is otherwise decided
/// only by transitions.
///
/// # Example
///
/// ```rust
/// use trialsm::builder::StateSpec;
/// use trialsm::core::StateMatrix;
///
/// let mut sm = StateMatrix::new(["Cin"], ["ValveL", "ValveR"]).unwrap();
/// sm.reset_transitions();
/// sm.add_state(
///     StateSpec::new("left_valve_on")
///         .timer(0.1)
///         .on_timeout("left_valve_off")
///         .outputs_on(["ValveL"]),
/// )
/// .unwrap();
/// sm.add_state(
///     StateSpec::new("left_valve_off")
///         .timer(0.5)
///         .on_timeout("END")
///         .outputs_off(["ValveL", "ValveR"]),
/// )
/// .unwrap();
///
/// let compiled = sm.finalize().unwrap();
/// assert_eq!(compiled.len(), 2);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateMatrix {
    inputs: Vec<String>,
    outputs: Vec<String>,
    #[serde(default)]
    states: Vec<StateSpec>,
}

impl StateMatrix {
    /// Create an empty matrix for the given input and output labels.
    pub fn new<I, O, S, T>(inputs: I, outputs: O) -> Result<Self, MatrixRejected>
    where
        I: IntoIterator<Item = S>,
        O: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        let inputs: Vec<String> = inputs.into_iter().map(Into::into).collect();
        let outputs: Vec<String> = outputs.into_iter().map(Into::into).collect();

        let mut problems = rules::label_problems(LabelKind::Input, &inputs, super::MAX_INPUTS);
        problems.extend(rules::label_problems(
            LabelKind::Output,
            &outputs,
            super::MAX_OUTPUTS,
        ));
        if !problems.is_empty() {
            return Err(MatrixRejected::new(problems));
        }

        Ok(Self {
            inputs,
            outputs,
            states: Vec::new(),
        })
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn states(&self) -> &[StateSpec] {
        &self.states
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn state(&self, name: &str) -> Option<&StateSpec> {
        self.states.iter().find(|spec| spec.name == name)
    }

    /// Remove every state and transition, keeping the declared labels.
    pub fn reset_transitions(&mut self) {
        self.states.clear();
    }

    /// Register a new state.
    ///
    /// Fails without modifying the matrix if the name is taken, or if the
    /// state references an undeclared output or event label. Transition
    /// targets are not checked here: a state may name a successor that is
    /// added later.
    pub fn add_state(&mut self, spec: StateSpec) -> Result<&mut Self, ConfigurationError> {
        if self.state(&spec.name).is_some() {
            return Err(ConfigurationError::DuplicateState { name: spec.name });
        }

        let mut problems = rules::state_problems(&spec, &self.inputs, &self.outputs).into_iter();
        if let Some(problem) = problems.next() {
            return Err(problem);
        }

        self.states.push(spec);
        Ok(self)
    }

    /// Validate the whole matrix and resolve names into indices.
    ///
    /// Every problem is reported, not only the first one.
    pub fn finalize(&self) -> Result<CompiledMatrix, MatrixRejected> {
        validation::check(self)?;

        let position = |name: &str| {
            self.states
                .iter()
                .position(|spec| spec.name == name)
                .and_then(|i| u16::try_from(i).ok())
                .map(StateId)
        };
        let mask = |names: &[String]| {
            names
                .iter()
                .filter_map(|name| self.outputs.iter().position(|o| o == name))
                .fold(OutputMask::EMPTY, OutputMask::with)
        };

        let mut states = Vec::with_capacity(self.states.len());
        for spec in &self.states {
            let mut transitions = Vec::with_capacity(spec.transitions.len());
            for (label, target_name) in &spec.transitions {
                let event = if label == TIMER_EVENT {
                    EventId::Timer
                } else {
                    let index = self.inputs.iter().position(|i| i == label).ok_or_else(|| {
                        ConfigurationError::InvalidReference {
                            state: spec.name.clone(),
                            kind: LabelKind::Input,
                            label: label.clone(),
                        }
                    })?;
                    EventId::Input(index as u8)
                };
                let target = if target_name == END_STATE {
                    Target::End
                } else {
                    Target::State(position(target_name).ok_or_else(|| {
                        ConfigurationError::DanglingTransition {
                            state: spec.name.clone(),
                            event: label.clone(),
                            target: target_name.clone(),
                        }
                    })?)
                };
                transitions.push((event, target));
            }

            states.push(CompiledState {
                name: spec.name.clone(),
                timer: Duration::try_from_secs_f64(spec.timer)
                    .ok()
                    .filter(|_| spec.timer > 0.0),
                outputs_on: mask(&spec.outputs_on),
                outputs_off: mask(&spec.outputs_off),
                transitions,
            });
        }

        Ok(CompiledMatrix {
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            states,
        })
    }
}

impl fmt::Display for StateMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list = |names: &[String]| {
            if names.is_empty() {
                "-".to_string()
            } else {
                names.join(",")
            }
        };
        let width = self
            .states
            .iter()
            .map(|spec| spec.name.len())
            .max()
            .unwrap_or(4)
            .max(4);

        writeln!(
            f,
            "State matrix: inputs [{}], outputs [{}]",
            self.inputs.join(", "),
            self.outputs.join(", ")
        )?;
        writeln!(
            f,
            "{:>3}  {:<width$}  {:>8}  {:<16}  {:<16}  transitions",
            "#", "name", "timer", "on", "off"
        )?;
        for (index, spec) in self.states.iter().enumerate() {
            let transitions = spec
                .transitions
                .iter()
                .map(|(event, target)| format!("{event}->{target}"))
                .collect::<Vec<_>>()
                .join(" ");
            writeln!(
                f,
                "{:>3}  {:<width$}  {:>8.3}  {:<16}  {:<16}  {}",
                index,
                spec.name,
                spec.timer,
                list(&spec.outputs_on),
                list(&spec.outputs_off),
                transitions
            )?;
        }
        Ok(())
    }
}

/// A finalized state in index form.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CompiledState {
    pub name: String,
    /// `None` when the state never times out.
    pub timer: Option<Duration>,
    pub outputs_on: OutputMask,
    pub outputs_off: OutputMask,
    pub transitions: Vec<(EventId, Target)>,
}

impl CompiledState {
    pub fn target(&self, event: EventId) -> Option<Target> {
        self.transitions
            .iter()
            .find(|(e, _)| *e == event)
            .map(|(_, target)| *target)
    }
}

/// A validated, immutable matrix ready to be handed to an executor.
///
/// States live in an append-only arena indexed by [`StateId`]; every name has
/// been resolved exactly once.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CompiledMatrix {
    inputs: Vec<String>,
    outputs: Vec<String>,
    states: Vec<CompiledState>,
}

impl CompiledMatrix {
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn states(&self) -> &[CompiledState] {
        &self.states
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Where execution begins: the first state added after the last reset.
    pub fn entry(&self) -> StateId {
        StateId::ENTRY
    }

    pub fn state(&self, id: StateId) -> Option<&CompiledState> {
        self.states.get(id.index())
    }

    pub fn state_id(&self, name: &str) -> Option<StateId> {
        self.states
            .iter()
            .position(|s| s.name == name)
            .and_then(|i| u16::try_from(i).ok())
            .map(StateId)
    }

    pub fn state_name(&self, id: StateId) -> &str {
        self.state(id).map_or("?", |s| s.name.as_str())
    }

    pub fn target_name(&self, target: Target) -> &str {
        match target {
            Target::State(id) => self.state_name(id),
            Target::End => END_STATE,
        }
    }

    /// Resolve an event label, `Tup` included.
    pub fn event_id(&self, label: &str) -> Option<EventId> {
        if label == TIMER_EVENT {
            return Some(EventId::Timer);
        }
        self.inputs
            .iter()
            .position(|i| i == label)
            .map(|i| EventId::Input(i as u8))
    }

    pub fn event_label(&self, event: EventId) -> &str {
        match event {
            EventId::Timer => TIMER_EVENT,
            EventId::Input(i) => self.inputs.get(i as usize).map_or("?", String::as_str),
        }
    }

    pub fn output_index(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|o| o == name)
    }

    /// Every declared output line.
    pub fn all_outputs(&self) -> OutputMask {
        (0..self.outputs.len()).fold(OutputMask::EMPTY, OutputMask::with)
    }

    /// Names of the lines asserted in `mask`.
    pub fn output_names(&self, mask: OutputMask) -> Vec<&str> {
        mask.indices()
            .filter_map(|i| self.outputs.get(i).map(String::as_str))
            .collect()
    }

    /// True when `inputs`/`outputs` match this matrix's declarations exactly.
    pub fn declares(&self, inputs: &[String], outputs: &[String]) -> bool {
        self.inputs == inputs && self.outputs == outputs
    }
}
