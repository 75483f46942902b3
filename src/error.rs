use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ScmoError>;

/// Errors raised while building, mutating, or streaming chunk objects.
#[derive(Debug, Error)]
pub enum ScmoError {
    /// A raw chunk allocation could not be satisfied.
    #[error("allocation of {requested} bytes failed")]
    OutOfMemory {
        /// Number of bytes that were requested.
        requested: u64,
    },
    /// The inbound byte stream is truncated or internally inconsistent.
    #[error("malformed stream: {0}")]
    Malformed(String),
    /// A class or instance definition is invalid.
    #[error("structural error: {0}")]
    Structural(String),
    /// A value does not match the declared property type.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    /// A named property or qualifier does not exist.
    #[error("{0} not found")]
    NotFound(String),
    /// An argument is outside the accepted range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl ScmoError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        ScmoError::Malformed(msg.into())
    }

    pub(crate) fn structural(msg: impl Into<String>) -> Self {
        ScmoError::Structural(msg.into())
    }

    /// Returns true when the error came from rejecting an inbound stream.
    pub fn is_malformed(&self) -> bool {
        matches!(self, ScmoError::Malformed(_))
    }
}
