use thiserror::Error;

use crate::parser;

/// Fatal compilation errors. A dependency that cannot be resolved inside a
///  CTE is not represented here: it degrades to a typed NULL instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("Field not found: {0}")]
    FieldNotFound(String),

    #[error("Unsupported function: {0}")]
    UnsupportedFunction(String),

    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),

    #[error("Circular reference detected: {}", .0.join(" -> "))]
    CircularReference(Vec<String>),

    #[error("Unsupported rollup function: {0}")]
    UnsupportedRollupFunction(String),

    #[error("Function {0} called with an incorrect number of arguments (got {1})")]
    IncorrectArgCount(String, usize),

    #[error("Function {func_name}: argument {wrong_arg_index} is the wrong type")]
    ArgWrongType {
        func_name: String,
        wrong_arg_index: usize,
    },

    #[error("Field {field_id} is already mapped to CTE {existing}, refusing to remap to {requested}")]
    StateConflict {
        field_id: String,
        existing: String,
        requested: String,
    },

    #[error("Formula parse error: {0}")]
    Parse(#[from] parser::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
