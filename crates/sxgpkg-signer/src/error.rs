//! Error types for certificates, signing and exchange parsing.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Certificate loading error. Fatal at startup.
#[derive(Debug, Error)]
pub enum CertificateError {
    /// Failed to read a PEM file.
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The PEM input held no certificate.
    #[error("No certificate found in PEM input")]
    NoCertificate,

    /// The PEM input held no usable private key.
    #[error("No private key found in PEM input")]
    NoPrivateKey,

    /// A certificate could not be parsed.
    #[error("Failed to parse certificate: {0}")]
    Parse(String),

    /// The leaf lacks the CanSignHttpExchanges extension.
    #[error("Leaf certificate lacks the CanSignHttpExchanges extension")]
    LeafNotEligible,

    /// An issuer carries the CanSignHttpExchanges extension.
    #[error("Issuer certificate {index} must not carry CanSignHttpExchanges")]
    IssuerEligible { index: usize },

    /// The key is not a P-256 key.
    #[error("Unsupported private key: {0}")]
    UnsupportedKey(String),

    /// The key does not belong to the leaf.
    #[error("Private key does not match the leaf certificate")]
    KeyMismatch,

    /// The leaf is valid for longer than exchanges allow.
    #[error("Leaf certificate validity of {days} days exceeds {max} days")]
    ValidityTooLong { days: i64, max: i64 },
}

/// Per-request signing error.
#[derive(Debug, Error)]
pub enum SigningError {
    /// The leaf expires before the exchange would.
    #[error("Certificate expires at {not_after}, before exchange expiry {expires}")]
    ValidityWindowTooShort { not_after: i64, expires: i64 },

    /// The leaf is not valid yet.
    #[error("Certificate is not valid until {not_before}")]
    CertificateNotYetValid { not_before: i64 },

    /// A field does not fit the envelope.
    #[error("Exchange field too large: {0}")]
    TooLarge(&'static str),

    /// CBOR encoding failed.
    #[error("CBOR encoding failed: {0}")]
    Cbor(String),

    /// A cert or validity URL could not be built.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// A signed exchange could not be parsed or verified.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("Exchange is truncated reading {0}")]
    Truncated(&'static str),

    #[error("Bad magic; not a b3 signed exchange")]
    BadMagic,

    #[error("Invalid response headers: {0}")]
    Headers(String),

    #[error("Invalid signature header: {0}")]
    SignatureHeader(String),

    #[error("Payload integrity check failed: {0}")]
    Integrity(String),

    #[error("Signature verification failed")]
    BadSignature,
}

/// An OCSP request could not be built, or a response is unusable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OcspError {
    /// DER input did not have the expected shape.
    #[error("Malformed OCSP data: {0}")]
    Malformed(String),

    /// The responder answered with a non-successful status.
    #[error("OCSP responder returned status {0}")]
    ResponderStatus(u8),

    /// No single response names the leaf.
    #[error("OCSP response does not cover the leaf certificate")]
    NoMatchingResponse,

    /// The leaf is revoked or unknown to the responder.
    #[error("Certificate status is {0}")]
    NotGood(&'static str),

    /// thisUpdate lies in the future.
    #[error("OCSP response is not valid until {0}")]
    NotYetValid(DateTime<Utc>),

    /// nextUpdate has passed.
    #[error("OCSP response expired at {0}")]
    Expired(DateTime<Utc>),

    /// The response omits nextUpdate.
    #[error("OCSP response has no nextUpdate")]
    MissingNextUpdate,

    /// The response is valid for longer than exchanges allow.
    #[error("OCSP response validity of {days} days exceeds {max} days")]
    LifetimeTooLong { days: i64, max: i64 },

    /// The chain holds no certificate that issued the leaf.
    #[error("Issuer of the leaf certificate is not in the chain")]
    NoIssuer,

    /// The leaf has no OCSP responder in its AIA extension.
    #[error("Leaf certificate names no OCSP responder")]
    NoResponder,

    /// Nothing has been stapled yet.
    #[error("No OCSP response loaded")]
    Missing,
}

/// Why the packager should not sign right now.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HealthError {
    #[error("Certificate expired at {0}")]
    CertificateExpired(DateTime<Utc>),

    #[error("Certificate is not valid until {0}")]
    CertificateNotYetValid(DateTime<Utc>),

    #[error(transparent)]
    Ocsp(#[from] OcspError),
}

/// Result type for certificate operations.
pub type Result<T> = std::result::Result<T, CertificateError>;
