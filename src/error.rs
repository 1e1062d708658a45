use thiserror::Error;

use crate::criteria::Operator;

/// Raised while turning a criteria sequence into a query. These describe
/// programming errors in the caller, never bad data in the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CriteriaError {
    #[error("operator {0:?} requires a field")]
    MissingField(Operator),

    #[error("invalid field identifier '{0}'")]
    InvalidField(String),

    #[error("operator {operator:?} on '{field}' expects {expected}")]
    OperandMismatch {
        field: String,
        operator: Operator,
        expected: &'static str,
    },

    #[error("operator {0:?} expects an integer value")]
    NonIntegerWindow(Operator),
}
