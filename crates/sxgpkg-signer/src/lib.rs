//! SXG Packager Signer - Certificates and b3 signed exchanges.
//!
//! - [`certs`] loads and validates the signing certificate
//! - [`mi`] implements the `mi-sha256-03` payload encoding
//! - [`exchange`] encodes and parses the envelope
//! - [`signer`] produces signed exchanges
//! - [`chain`] serializes the certificate chain served to clients
//! - [`ocsp`] builds OCSP requests and checks the stapled response

pub mod certs;
pub mod chain;
mod der;
pub mod error;
pub mod exchange;
pub mod mi;
pub mod ocsp;
pub mod signer;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use certs::{can_sign_http_exchanges, der_can_sign_http_exchanges, CertificateContext, CertificateStore};
pub use chain::{cert_chain_cbor, CertChainCache, CERT_CHAIN_CONTENT_TYPE};
pub use error::{CertificateError, ExchangeError, HealthError, OcspError, Result, SigningError};
pub use exchange::{cert_url_from_signature, extract_cert_url, Exchange, SignatureHeader, SignedExchange};
pub use ocsp::{
    responder_url, verify_response, CertId, OcspRequest, OcspWindow, MAX_OCSP_RESPONSE_BYTES,
    OCSP_REQUEST_CONTENT_TYPE,
};
pub use signer::{cert_url, validity_url, Signer, SigningMaterial, SigningOptions, CERT_PATH_PREFIX, VALIDITY_PATH};
