//! Validation of state matrices using Stillwater's `Validation` type.
//!
//! Finalizing a matrix runs every rule and accumulates ALL problems instead
//! of stopping at the first one, so an experimenter sees every typo in a
//! trial definition in one pass.
//!
//! # Example
//!
//! ```rust
//! use trialsm::builder::{ConfigurationError, StateSpec};
//! use trialsm::core::StateMatrix;
//! use trialsm::validation;
//!
//! let mut matrix = StateMatrix::new(["Cin"], ["ValveL"]).unwrap();
//! matrix.add_state(StateSpec::new("a").on_timeout("nowhere")).unwrap();
//! matrix.add_state(StateSpec::new("b").on("Cin", "elsewhere")).unwrap();
//!
//! let rejected = validation::check(&matrix).unwrap_err();
//! assert_eq!(rejected.errors().len(), 2);
//! assert!(matches!(
//!     rejected.first(),
//!     Some(ConfigurationError::DanglingTransition { .. })
//! ));
//! ```

pub(crate) mod rules;

use crate::builder::{ConfigurationError, LabelKind, MatrixRejected};
use crate::core::{StateMatrix, MAX_INPUTS, MAX_OUTPUTS, MAX_STATES};
use stillwater::validation::Validation;
use stillwater::NonEmptyVec;

/// Result of validating a matrix: success, or every problem found.
pub type MatrixValidation = Validation<(), NonEmptyVec<ConfigurationError>>;

/// Run every rule against `matrix`, accumulating all failures.
pub fn validate(matrix: &StateMatrix) -> MatrixValidation {
    let mut problems = Vec::new();

    problems.extend(rules::label_problems(
        LabelKind::Input,
        matrix.inputs(),
        MAX_INPUTS,
    ));
    problems.extend(rules::label_problems(
        LabelKind::Output,
        matrix.outputs(),
        MAX_OUTPUTS,
    ));

    if matrix.is_empty() {
        problems.push(ConfigurationError::EmptyMatrix);
    }

    problems.extend(rules::count_problems(matrix.states(), MAX_STATES));
    problems.extend(rules::duplicate_problems(matrix.states()));
    for spec in matrix.states() {
        problems.extend(rules::state_problems(
            spec,
            matrix.inputs(),
            matrix.outputs(),
        ));
    }
    problems.extend(rules::target_problems(matrix.states()));

    let mut checks: Vec<MatrixValidation> = vec![Validation::success(())];
    checks.extend(problems.into_iter().map(Validation::fail));

    Validation::all_vec(checks).map(|_| ())
}

/// [`validate`], converted into a `Result` for `?` propagation.
pub fn check(matrix: &StateMatrix) -> Result<(), MatrixRejected> {
    match validate(matrix) {
        Validation::Success(()) => Ok(()),
        Validation::Failure(errors) => Err(MatrixRejected::new(errors.iter().cloned().collect())),
    }
}
