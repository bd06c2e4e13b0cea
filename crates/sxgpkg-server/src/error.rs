//! Packaging error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use sxgpkg_core::PolicyRejection;
use sxgpkg_signer::{HealthError, OcspError, SigningError};
use sxgpkg_transform::TransformError;

/// The origin could not supply a packageable response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OriginFailure {
    /// The fetch did not finish in time.
    #[error("timed out fetching {url}")]
    Timeout { url: String },

    /// Connection or protocol error.
    #[error("error fetching {url}: {message}")]
    Request { url: String, message: String },

    /// Status other than 200, 301-303 or 304.
    #[error("non-OK fetch of {url}: {status}")]
    UnexpectedStatus { url: String, status: u16 },

    /// Content-Type is not HTML.
    #[error("wrong content-type from {url}: {content_type:?}")]
    NotHtml { url: String, content_type: String },

    /// Charset other than UTF-8, or a body that does not decode.
    #[error("unsupported charset from {url}: {charset}")]
    UnsupportedCharset { url: String, charset: String },

    /// Content-Encoding other than identity.
    #[error("unsupported content-encoding from {url}: {encoding}")]
    UnsupportedEncoding { url: String, encoding: String },

    /// The response may not be stored by a shared cache.
    #[error("non-cacheable response from {url}: {reason}")]
    Uncacheable { url: String, reason: String },

    /// The body exceeds the payload limit.
    #[error("response from {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: usize },
}

impl OriginFailure {
    fn status(&self) -> StatusCode {
        match self {
            OriginFailure::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            OriginFailure::Timeout { .. } => "origin_timeout",
            OriginFailure::Request { .. } => "origin_unreachable",
            OriginFailure::UnexpectedStatus { .. } => "origin_status",
            OriginFailure::NotHtml { .. } => "not_html",
            OriginFailure::UnsupportedCharset { .. } => "unsupported_charset",
            OriginFailure::UnsupportedEncoding { .. } => "unsupported_encoding",
            OriginFailure::Uncacheable { .. } => "uncacheable",
            OriginFailure::TooLarge { .. } => "too_large",
        }
    }
}

/// Errors from a packaging request.
#[derive(Debug, Error)]
pub enum PackageError {
    /// Refused by URL or header policy.
    #[error("{0}")]
    Policy(#[from] PolicyRejection),

    /// The origin response was unusable.
    #[error("{0}")]
    Origin(#[from] OriginFailure),

    /// The markup could not be transformed.
    #[error("error transforming {url}: {source}")]
    Transform {
        url: String,
        #[source]
        source: TransformError,
    },

    /// The exchange could not be signed.
    #[error("error signing {url}: {source}")]
    Signing {
        url: String,
        #[source]
        source: SigningError,
    },

    /// No such certificate or artifact.
    #[error("not found: {0}")]
    ArtifactNotFound(String),

    /// The certificate cannot be served with a current OCSP response.
    #[error("certificate unhealthy: {0}")]
    Unhealthy(#[from] HealthError),
}

impl PackageError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            PackageError::Policy(PolicyRejection::StatefulHeaders { .. }) => StatusCode::FORBIDDEN,
            PackageError::Policy(_) => StatusCode::BAD_REQUEST,
            PackageError::Origin(e) => e.status(),
            PackageError::Transform { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            PackageError::Signing { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            PackageError::ArtifactNotFound(_) => StatusCode::NOT_FOUND,
            PackageError::Unhealthy(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            PackageError::Policy(e) => e.code(),
            PackageError::Origin(e) => e.code(),
            PackageError::Transform { .. } => "transform_error",
            PackageError::Signing { .. } => "signing_error",
            PackageError::ArtifactNotFound(_) => "not_found",
            PackageError::Unhealthy(_) => "unhealthy",
        }
    }

    /// Logs at the level that matches who is at fault.
    pub fn log(&self) {
        match self {
            PackageError::Policy(_) | PackageError::ArtifactNotFound(_) => {
                debug!("Not packaging: {}", self)
            }
            PackageError::Origin(_) => warn!("Not packaging: {}", self),
            PackageError::Transform { .. } | PackageError::Signing { .. } => {
                error!("Packaging failed: {}", self)
            }
            PackageError::Unhealthy(_) => error!("{}", self),
        }
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for PackageError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
        };

        (self.status(), axum::Json(body)).into_response()
    }
}

/// A background refresh failed; the previous value stays in use.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("error fetching {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("non-OK fetch of {url}: {status}")]
    Status { url: String, status: u16 },

    #[error("response from {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: usize },

    #[error(transparent)]
    Ocsp(#[from] OcspError),

    #[error("invalid runtime metadata: {0}")]
    Metadata(String),

    #[error(transparent)]
    Signing(#[from] SigningError),
}

/// Result type for packaging operations.
pub type Result<T> = std::result::Result<T, PackageError>;
