//! Errors raised while building, inferring or binding graphs.

use thiserror::Error;

use crate::base::Shape;

/// Errors that can occur while talking to a graph engine.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Invalid name: {name:?}")]
    InvalidName { name: String },

    #[error("Unknown operator: {name}")]
    UnknownOperator { name: String },

    #[error("Invalid parameter `{key}` for {operator}: {message}")]
    InvalidParameter {
        operator: String,
        key: String,
        message: String,
    },

    #[error("Mismatched {what} lengths: {keys} keys, {values} values")]
    MismatchedLengths {
        what: &'static str,
        keys: usize,
        values: usize,
    },

    #[error("Invalid graph structure: {0}")]
    InvalidGraph(String),

    #[error("Invalid {kind} handle: {raw}")]
    InvalidHandle { kind: &'static str, raw: u64 },

    #[error("Operands belong to different engines")]
    EngineMismatch,

    #[error("Unknown argument: {name}")]
    UnknownArgument { name: String },

    #[error("Shape mismatch at {node}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        node: String,
        expected: Shape,
        actual: Shape,
    },

    #[error("Cannot infer shapes for: {}", unresolved.join(", "))]
    IncompleteShapes { unresolved: Vec<String> },

    #[error("Bind error: {0}")]
    Bind(String),

    #[error("Tensor error: {0}")]
    Tensor(String),

    #[error("Engine state error: {0}")]
    EngineState(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GraphError {
    pub(crate) fn bind(message: impl Into<String>) -> Self {
        Self::Bind(message.into())
    }

    pub(crate) fn invalid_graph(message: impl Into<String>) -> Self {
        Self::InvalidGraph(message.into())
    }
}
