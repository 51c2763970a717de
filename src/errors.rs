//! Definition of errors.

use thiserror::Error;

/// The error type for segcrf.
///
/// Only configuration and I/O problems are reported through this type.
/// Numerical anomalies, feature contract violations and exhausted search
/// budgets are logged and recovered from inside the training and decoding
/// loops.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CrfError {
    /// An argument is out of its valid range.
    #[error("InvalidArgumentError: {0}")]
    InvalidArgument(String),

    /// The graph topology specification is not recognized.
    #[error("unknown graph type: {0}")]
    UnknownTopology(String),

    /// An option value could not be parsed.
    #[error("malformed value for option `{key}`: {value}")]
    MalformedOption {
        /// Option name.
        key: String,
        /// Offending value.
        value: String,
    },

    /// No state path of the requested length exists in a label's graph.
    #[error("no path of length {len} in the graph of label {label}")]
    NoPathInGraph {
        /// Logical label.
        label: usize,
        /// Segment length.
        len: usize,
    },

    /// The flat parameter file is malformed.
    #[error("malformed parameter file at line {line}: {msg}")]
    ParameterFormat {
        /// 1-based line number.
        line: usize,
        /// Description.
        msg: String,
    },

    /// The number of weights does not match the feature generator.
    #[error("expected {expected} features, found {found}")]
    FeatureCountMismatch {
        /// Features announced by the generator.
        expected: usize,
        /// Weights supplied.
        found: usize,
    },

    /// The numerical optimizer reported a failure.
    #[error("optimizer error: {0}")]
    Optimizer(String),

    /// Model serialization failed.
    #[error(transparent)]
    Encode(#[from] bincode::error::EncodeError),

    /// Model deserialization failed.
    #[error(transparent)]
    Decode(#[from] bincode::error::DecodeError),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CrfError {
    /// Creates a new [`CrfError::InvalidArgument`].
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn malformed(key: &str, value: &str) -> Self {
        Self::MalformedOption {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

/// A specialized Result type.
pub type Result<T, E = CrfError> = core::result::Result<T, E>;
