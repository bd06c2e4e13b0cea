//! Error types for the transform engine.

use thiserror::Error;

/// Transform error type.
#[derive(Debug, Error)]
pub enum TransformError {
    /// A transform name did not resolve to a registered pass.
    #[error("transform {0:?} doesn't exist")]
    UnknownTransform(String),

    /// A custom pass list breaks a required ordering.
    #[error("invalid transform order: {0}")]
    OrderViolation(String),

    /// The parsed document is missing a required element.
    #[error("document has no <{0}> element")]
    MissingElement(&'static str),

    /// The document URL could not be used as a base.
    #[error("invalid document URL {0:?}")]
    InvalidDocumentUrl(String),

    /// A pass failed.
    #[error("{pass} failed: {message}")]
    Pass {
        pass: &'static str,
        message: String,
    },
}

/// Result type for transform operations.
pub type Result<T> = std::result::Result<T, TransformError>;
