//! Individual validation rules for state matrices.
//!
//! Each rule lists every problem it finds, in declaration order, so the
//! caller can either stop at the first one (`add_state`) or accumulate all of
//! them (`finalize`).

use crate::builder::{ConfigurationError, LabelKind, StateSpec};
use crate::core::{END_STATE, TIMER_EVENT};
use std::collections::HashSet;
use std::time::Duration;

/// Problems with a declared input or output label list.
pub(crate) fn label_problems(
    kind: LabelKind,
    labels: &[String],
    max: usize,
) -> Vec<ConfigurationError> {
    let mut problems = Vec::new();

    if labels.len() > max {
        problems.push(ConfigurationError::TooManyLines {
            kind,
            count: labels.len(),
            max,
        });
    }

    let mut seen = HashSet::new();
    for label in labels {
        if kind == LabelKind::Input && (label == TIMER_EVENT || label == END_STATE) {
            problems.push(ConfigurationError::ReservedLabel {
                kind,
                label: label.clone(),
            });
        }
        if !seen.insert(label.as_str()) {
            problems.push(ConfigurationError::DuplicateLabel {
                kind,
                label: label.clone(),
            });
        }
    }

    problems
}

/// Problems local to one state, checked against the declared labels.
pub(crate) fn state_problems(
    spec: &StateSpec,
    inputs: &[String],
    outputs: &[String],
) -> Vec<ConfigurationError> {
    let mut problems = Vec::new();
    let state = || spec.name.clone();

    if spec.name == END_STATE || spec.name == TIMER_EVENT {
        problems.push(ConfigurationError::ReservedName {
            name: spec.name.clone(),
        });
    }

    if Duration::try_from_secs_f64(spec.timer).is_err() {
        problems.push(ConfigurationError::InvalidTimer {
            state: state(),
            seconds: spec.timer,
        });
    }

    for output in spec.outputs_on.iter().chain(&spec.outputs_off) {
        if !outputs.contains(output) {
            problems.push(ConfigurationError::InvalidReference {
                state: state(),
                kind: LabelKind::Output,
                label: output.clone(),
            });
        }
    }

    let mut events = HashSet::new();
    for (event, _) in &spec.transitions {
        if event != TIMER_EVENT && !inputs.contains(event) {
            problems.push(ConfigurationError::InvalidReference {
                state: state(),
                kind: LabelKind::Input,
                label: event.clone(),
            });
        }
        if !events.insert(event.as_str()) {
            problems.push(ConfigurationError::DuplicateEvent {
                state: state(),
                event: event.clone(),
            });
        }
    }

    for output in &spec.outputs_on {
        if spec.outputs_off.contains(output) {
            problems.push(ConfigurationError::ConflictingOutputs {
                state: state(),
                output: output.clone(),
            });
        }
    }

    problems
}

/// More states than a [`StateId`](crate::core::StateId) can index.
pub(crate) fn count_problems(states: &[StateSpec], max: usize) -> Vec<ConfigurationError> {
    if states.len() > max {
        vec![ConfigurationError::TooManyStates {
            count: states.len(),
            max,
        }]
    } else {
        Vec::new()
    }
}

/// Repeated state names. The second and later occurrences are reported.
pub(crate) fn duplicate_problems(states: &[StateSpec]) -> Vec<ConfigurationError> {
    let mut seen = HashSet::new();
    states
        .iter()
        .filter(|spec| !seen.insert(spec.name.as_str()))
        .map(|spec| ConfigurationError::DuplicateState {
            name: spec.name.clone(),
        })
        .collect()
}

/// Transition targets that are neither a state of the matrix nor `END`.
pub(crate) fn target_problems(states: &[StateSpec]) -> Vec<ConfigurationError> {
    let names: HashSet<&str> = states.iter().map(|spec| spec.name.as_str()).collect();
    let mut problems = Vec::new();

    for spec in states {
        for (event, target) in &spec.transitions {
            if target != END_STATE && !names.contains(target.as_str()) {
                problems.push(ConfigurationError::DanglingTransition {
                    state: spec.name.clone(),
                    event: event.clone(),
                    target: target.clone(),
                });
            }
        }
    }

    problems
}
