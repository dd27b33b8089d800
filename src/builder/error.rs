//! Configuration errors raised while building or finalizing a state matrix.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Which declared label set a name was looked up in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LabelKind {
    Input,
    Output,
}

impl fmt::Display for LabelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
        }
    }
}

/// A malformed state matrix.
///
/// These are construction-time errors: a matrix that produces one is never
/// handed to an executor.
#[derive(Debug, Clone, Error, PartialEq, Serialize)]
pub enum ConfigurationError {
    #[error("State '{name}' is already defined in this matrix")]
    DuplicateState { name: String },

    #[error("State '{state}' references undeclared {kind} '{label}'")]
    InvalidReference {
        state: String,
        kind: LabelKind,
        label: String,
    },

    #[error("State '{state}' has a '{event}' transition to unknown state '{target}'")]
    DanglingTransition {
        state: String,
        event: String,
        target: String,
    },

    #[error("State '{state}' both asserts and clears output '{output}'")]
    ConflictingOutputs { state: String, output: String },

    #[error("State '{state}' defines more than one transition for '{event}'")]
    DuplicateEvent { state: String, event: String },

    #[error("State '{state}' has invalid timer {seconds}s (must be >= 0 and fit in a duration)")]
    InvalidTimer { state: String, seconds: f64 },

    #[error("'{name}' is reserved and cannot be used as a state name")]
    ReservedName { name: String },

    #[error("{kind} label '{label}' is declared more than once")]
    DuplicateLabel { kind: LabelKind, label: String },

    #[error("{kind} label '{label}' is reserved")]
    ReservedLabel { kind: LabelKind, label: String },

    #[error("Too many {kind} lines: {count} declared, at most {max} supported")]
    TooManyLines {
        kind: LabelKind,
        count: usize,
        max: usize,
    },

    #[error("Too many states: {count} defined, at most {max} supported")]
    TooManyStates { count: usize, max: usize },

    #[error("State matrix has no states. Call .add_state() before finalizing")]
    EmptyMatrix,
}

/// Every problem found while finalizing a matrix, in declaration order.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("State matrix rejected: {}", summary(.errors))]
pub struct MatrixRejected {
    errors: Vec<ConfigurationError>,
}

fn summary(errors: &[ConfigurationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl MatrixRejected {
    pub(crate) fn new(errors: Vec<ConfigurationError>) -> Self {
        Self { errors }
    }

    pub fn errors(&self) -> &[ConfigurationError] {
        &self.errors
    }

    /// The first problem in declaration order.
    pub fn first(&self) -> Option<&ConfigurationError> {
        self.errors.first()
    }

    pub fn into_errors(self) -> Vec<ConfigurationError> {
        self.errors
    }
}

impl From<ConfigurationError> for MatrixRejected {
    fn from(error: ConfigurationError) -> Self {
        Self::new(vec![error])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_state() {
        let err = ConfigurationError::InvalidReference {
            state: "reward".to_string(),
            kind: LabelKind::Output,
            label: "ValveX".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "State 'reward' references undeclared output 'ValveX'"
        );
    }

    #[test]
    fn rejection_joins_all_problems() {
        let rejected = MatrixRejected::new(vec![
            ConfigurationError::EmptyMatrix,
            ConfigurationError::DuplicateState {
                name: "a".to_string(),
            },
        ]);
        let message = rejected.to_string();
        assert!(message.contains("no states"));
        assert!(message.contains("'a' is already defined"));
        assert_eq!(rejected.errors().len(), 2);
    }
}
