//! Packager configuration, loaded from TOML.
//!
//! ```toml
//! port = 8080
//! cert_file = "/etc/sxgpkg/cert.pem"
//! key_file = "/etc/sxgpkg/key.pem"
//!
//! [[url_set]]
//! [url_set.sign]
//! domain = "example.com"
//! path_regexp = "/amp/.*"
//!
//! [url_set.fetch]
//! scheme = ["http"]
//! domain = "origin.internal"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use url::Url;

use crate::error::{ConfigError, Result};
use crate::matcher::UrlMatcher;

/// Default listen host.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default listen port.
pub const DEFAULT_PORT: u16 = 8080;

/// Default origin fetch timeout.
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 60;

/// Default maximum origin payload (4 MiB).
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 4 << 20;

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_fetch_timeout_secs() -> u64 {
    DEFAULT_FETCH_TIMEOUT_SECS
}

fn default_max_payload_bytes() -> usize {
    DEFAULT_MAX_PAYLOAD_BYTES
}

/// Top-level packager configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackagerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to.
    #[serde(default = "default_port")]
    pub port: u16,
    /// PEM file holding the leaf certificate followed by its issuers.
    pub cert_file: PathBuf,
    /// PEM file holding the P-256 private key of the leaf.
    pub key_file: PathBuf,
    /// DER OCSP response to staple as is. When unset, responses are fetched
    /// from the leaf's OCSP responder and kept fresh in the background.
    #[serde(default)]
    pub ocsp_file: Option<PathBuf>,
    /// Absolute https base for cert URLs. Its path is kept as a prefix.
    /// Defaults to the origin of the sign URL.
    #[serde(default)]
    pub cert_url_base: Option<String>,
    /// Only sign when the request negotiates SXG; otherwise proxy.
    #[serde(default)]
    pub require_headers: bool,
    /// Transform names to run instead of the default pipeline.
    #[serde(default)]
    pub transforms: Option<Vec<String>>,
    /// AMP runtime version stamped on inlined runtime CSS.
    #[serde(default)]
    pub runtime_version: Option<String>,
    /// File whose contents are inlined as the AMP runtime CSS.
    #[serde(default)]
    pub runtime_css_file: Option<PathBuf>,
    /// AMP runtime metadata JSON (e.g. `https://cdn.ampproject.org/rtv/metadata`).
    /// When set, the runtime version and CSS are polled from it hourly and
    /// the two static settings above only apply until the first poll.
    #[serde(default)]
    pub runtime_metadata_url: Option<String>,
    /// Origin fetch timeout in seconds.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Maximum accepted origin body size.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// Ordered URL policy.
    #[serde(rename = "url_set", default)]
    pub url_sets: Vec<UrlSetConfig>,
}

/// One `[[url_set]]` entry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UrlSetConfig {
    /// Pattern for URLs that may be signed.
    pub sign: UrlPatternConfig,
    /// Pattern for URLs that may be fetched.
    #[serde(default)]
    pub fetch: Option<UrlPatternConfig>,
}

/// A URL pattern as written in the config file.
///
/// Every field is named; unrecognized keys are a parse error.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct UrlPatternConfig {
    /// Allowed schemes. Sign: `https` only. Fetch: `http` and `https`.
    pub scheme: Vec<String>,
    /// Exact host, compared case-insensitively.
    pub domain: Option<String>,
    /// Host pattern (fetch only), as an alternative to `domain`.
    pub domain_regexp: Option<String>,
    /// Full-match path pattern. Defaults to `.*`.
    pub path_regexp: Option<String>,
    /// Paths matching any of these are excluded.
    pub path_exclude_regexp: Vec<String>,
    /// Full-match query pattern. Unset means the query must be empty.
    pub query_regexp: Option<String>,
    /// Maximum URL length. Defaults to 2000.
    pub max_length: Option<usize>,
    /// Fetch only: fetch host must equal the sign host.
    pub same_origin: bool,
    /// Fetch only: alternative host accepted when `same_origin` is set.
    pub source_origin_override: Option<String>,
    /// Fetch only: fetch path and query must equal the sign URL's. Defaults to true.
    pub same_path: Option<bool>,
    /// Sign only: refuse origin responses with stateful headers.
    pub error_on_stateful_headers: bool,
}

impl PackagerConfig {
    /// Parses and validates a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: PackagerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses, and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::info!(
            "Loaded config from {:?} with {} url sets",
            path,
            config.url_sets.len()
        );
        Ok(config)
    }

    /// Checks every rule that does not need the filesystem.
    pub fn validate(&self) -> Result<()> {
        self.build_matcher()?;
        if let Some(base) = &self.cert_url_base {
            self.parsed_cert_url_base(base)?;
        }
        self.runtime_metadata_url()?;
        if self.fetch_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "fetch_timeout_secs must be positive".to_string(),
            ));
        }
        if self.max_payload_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_payload_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Compiles the URL policy.
    pub fn build_matcher(&self) -> Result<UrlMatcher> {
        UrlMatcher::compile(&self.url_sets)
    }

    /// Returns the cert URL base, if configured.
    pub fn cert_url_base(&self) -> Result<Option<Url>> {
        self.cert_url_base
            .as_deref()
            .map(|base| self.parsed_cert_url_base(base))
            .transpose()
    }

    /// Returns the runtime metadata URL, if configured.
    pub fn runtime_metadata_url(&self) -> Result<Option<Url>> {
        let Some(text) = self.runtime_metadata_url.as_deref() else {
            return Ok(None);
        };
        let url = Url::parse(text).map_err(|e| {
            ConfigError::Invalid(format!("runtime_metadata_url {:?}: {}", text, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid(format!(
                "runtime_metadata_url {:?} must be http or https",
                text
            )));
        }
        Ok(Some(url))
    }

    fn parsed_cert_url_base(&self, base: &str) -> Result<Url> {
        let url = Url::parse(base)
            .map_err(|e| ConfigError::Invalid(format!("cert_url_base {:?}: {}", base, e)))?;
        if url.scheme() != "https" {
            return Err(ConfigError::Invalid(format!(
                "cert_url_base {:?} must be https",
                base
            )));
        }
        Ok(url)
    }
}
