//! SXG Packager Core - URL policy, configuration, and header rules.
//!
//! This crate holds the request-independent policy of the packager:
//!
//! - [`matcher`] decides whether a URL may be signed, fetched, or neither
//! - [`config`] loads and validates the TOML configuration
//! - [`headers`] classifies HTTP headers (hop-by-hop, stateful, caching)
//! - [`negotiation`] handles `Accept` and `AMP-Cache-Transform`
//!
//! ## Decision Flow
//!
//! ```text
//! sign URL (+ optional fetch URL)
//!        │
//!        ▼
//!   CandidateUrl::parse ──(unparseable / userinfo / scheme)──► Reject
//!        │
//!        ▼
//!   for each URLSet, in order:
//!        ├── sign pattern matches (and fetch pair valid) ──► Sign(index)
//!        └── fetch pattern matches ─────────────────────────► Fetch(index)
//!        │
//!        ▼
//!      Reject
//! ```

pub mod config;
pub mod error;
pub mod headers;
pub mod matcher;
pub mod negotiation;

pub use config::{PackagerConfig, UrlPatternConfig, UrlSetConfig};
pub use error::{ConfigError, PolicyRejection, Result};
pub use matcher::{Authorization, CandidateUrl, MatchDecision, UrlMatcher, UrlPattern, UrlSet};
pub use negotiation::{accepts_signed_exchange, select_version, should_send_sxg, VersionRange};

/// Media type of a `b3` signed exchange.
pub const SXG_CONTENT_TYPE: &str = "application/signed-exchange;v=b3";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sxg_content_type_is_b3() {
        assert_eq!(SXG_CONTENT_TYPE, "application/signed-exchange;v=b3");
    }
}
