//! Error types for continuous-depth layers.
//!
//! Every fallible operation in the crate returns [`Result`]. Nothing is
//! retried or recovered locally: a failed integration yields no trajectory.

use thiserror::Error;

/// Main error type for HBNODE operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HbnodeError {
    /// A declared shape disagrees with a tensor at a reshape, split or
    /// concatenate boundary.
    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// The solver could not meet the requested tolerance within its budget.
    #[error("Solver failure: {0}")]
    SolverFailure(String),

    /// A precondition on the configuration was violated.
    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

/// Result type for HBNODE operations.
pub type Result<T, E = HbnodeError> = std::result::Result<T, E>;

impl HbnodeError {
    /// Create a shape mismatch error.
    pub fn shape_mismatch(
        context: &'static str,
        expected: impl Into<Vec<usize>>,
        actual: impl Into<Vec<usize>>,
    ) -> Self {
        Self::ShapeMismatch {
            context,
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a solver failure error.
    pub fn solver_failure(msg: impl Into<String>) -> Self {
        Self::SolverFailure(msg.into())
    }

    /// Create a configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
