//! Error types for configuration and URL policy.

use std::path::PathBuf;

use thiserror::Error;

/// Configuration error. Always fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or does not fit the schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A pattern failed to compile.
    #[error("invalid regexp {pattern:?} in {field}: {source}")]
    Regex {
        field: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// A semantic rule of the configuration was violated.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Reason a request was refused by policy. Surfaced as a 4xx.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyRejection {
    /// The URL could not be parsed as an absolute http(s) URL.
    #[error("unparseable URL {url:?}: {reason}")]
    Unparseable { url: String, reason: String },

    /// Scheme other than http or https.
    #[error("unsupported scheme {scheme:?}")]
    UnsupportedScheme { scheme: String },

    /// URL carries a username or password.
    #[error("URL must not contain user info")]
    UserInfo,

    /// No URLSet matched.
    #[error("fetch/sign URLs do not match config")]
    NoMatch { url: String },

    /// Request shape was wrong (missing or repeated parameters).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Origin returned stateful headers and the matched rule forbids them.
    #[error("origin response carries stateful header {header:?}")]
    StatefulHeaders { header: String },
}

impl PolicyRejection {
    /// Returns a short machine-readable code for this rejection.
    pub fn code(&self) -> &'static str {
        match self {
            PolicyRejection::Unparseable { .. } => "unparseable_url",
            PolicyRejection::UnsupportedScheme { .. } => "unsupported_scheme",
            PolicyRejection::UserInfo => "user_info",
            PolicyRejection::NoMatch { .. } => "no_match",
            PolicyRejection::BadRequest(_) => "bad_request",
            PolicyRejection::StatefulHeaders { .. } => "stateful_headers",
        }
    }
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;
