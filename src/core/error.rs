//! Error types for diffgat.

use thiserror::Error;

/// Result type alias for diffgat operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when building or running the model.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Relation embedding width {actual} does not match layer output width {expected}")]
    RelationWidthMismatch { expected: usize, actual: usize },

    #[error("Unknown merge mode: {0}")]
    UnknownMergeMode(String),

    #[error("Unknown activation: {0}")]
    UnknownActivation(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Graph errors
    #[error("Node {index} out of range for graph with {num_nodes} nodes")]
    NodeOutOfRange { index: usize, num_nodes: usize },

    #[error("Relation {index} out of range for embedding table with {num_relations} rows")]
    RelationOutOfRange { index: usize, num_relations: usize },

    // Input errors
    #[error("Shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Recorded forward pass does not match the model: {0}")]
    TapeMismatch(String),

    #[error("Missing parameter: {0}")]
    MissingParameter(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn shape(what: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        Error::ShapeMismatch {
            what: what.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Error::DeserializationError(err.to_string())
        } else {
            Error::SerializationError(err.to_string())
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}
