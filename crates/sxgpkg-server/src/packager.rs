//! The packaging state machine: authorize, fetch, validate, transform, sign.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use url::Url;

use sxgpkg_core::headers::{
    connection_tokens, is_conditional, is_hop_by_hop, is_stateful, uncacheable_reason,
    MediaType, NOT_MODIFIED_PASSTHROUGH,
};
use sxgpkg_core::{
    accepts_signed_exchange, should_send_sxg, select_version, ConfigError, MatchDecision,
    PackagerConfig, PolicyRejection, UrlMatcher,
};
use sxgpkg_signer::{
    cert_url, validity_url, CertChainCache, CertificateStore, Signer, SigningMaterial,
    SigningOptions,
};
use sxgpkg_transform::{Pipeline, TransformRequest};

use crate::error::{OriginFailure, PackageError, Result};
use crate::origin::{DirectResolver, OriginClient, OriginRequest, OriginResolver, OriginResponse};
use crate::refresh::RuntimeCache;

/// Content-Security-Policy placed on every signed document.
pub const CONTENT_SECURITY_POLICY: &str = concat!(
    "default-src * blob: data:; ",
    "script-src blob: https://cdn.ampproject.org/rtv/ https://cdn.ampproject.org/v0.js ",
    "https://cdn.ampproject.org/v0/ https://cdn.ampproject.org/viewer/; ",
    "object-src 'none'; ",
    "style-src 'unsafe-inline' https://cdn.ampproject.org/rtv/ https://cdn.materialdesignicons.com ",
    "https://cloud.typography.com https://fast.fonts.net https://fonts.googleapis.com ",
    "https://maxcdn.bootstrapcdn.com https://p.typekit.net https://pro.fontawesome.com ",
    "https://use.fontawesome.com https://use.typekit.net; ",
    "report-uri https://csp-collector.appspot.com/csp/amp"
);

/// Content-Type of the signed inner response.
pub const INNER_CONTENT_TYPE: &str = "text/html;charset=utf-8";

/// Inbound request: the `sign`/`fetch` parameters and request headers.
#[derive(Debug, Clone, Default)]
pub struct PackageRequest {
    pub sign: Vec<String>,
    pub fetch: Vec<String>,
    pub headers: Vec<(String, String)>,
}

impl PackageRequest {
    /// Collects `sign` and `fetch` from a query string.
    pub fn from_query(query: &str, headers: Vec<(String, String)>) -> Self {
        let mut request = Self {
            headers,
            ..Self::default()
        };
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "sign" => request.sign.push(value.into_owned()),
                "fetch" => request.fetch.push(value.into_owned()),
                _ => {}
            }
        }
        request
    }

    /// Sign URL carried in the path; the query belongs to that URL.
    pub fn from_path(sign: &str, query: Option<&str>, headers: Vec<(String, String)>) -> Self {
        let mut sign = sign.strip_prefix('/').unwrap_or(sign).to_string();
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            sign.push('?');
            sign.push_str(query);
        }
        Self {
            sign: vec![sign],
            fetch: Vec::new(),
            headers,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn target(&self) -> std::result::Result<(&str, Option<&str>), PolicyRejection> {
        if self.fetch.len() > 1 {
            return Err(PolicyRejection::BadRequest(
                "More than 1 fetch param".to_string(),
            ));
        }
        if self.sign.len() != 1 {
            return Err(PolicyRejection::BadRequest(
                "Not exactly 1 sign param".to_string(),
            ));
        }
        let fetch = self.fetch.first().map(String::as_str).filter(|f| !f.is_empty());
        Ok((self.sign[0].as_str(), fetch))
    }
}

/// Result of a packaging request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageOutcome {
    /// A signed exchange, with the negotiated `AMP-Cache-Transform` value.
    Signed {
        exchange: Vec<u8>,
        amp_cache_transform: Option<String>,
    },
    /// An unsigned origin response passed through.
    Proxied(OriginResponse),
}

/// Per-deployment knobs of the packager.
#[derive(Debug, Clone)]
pub struct PackagerSettings {
    /// Only sign when the client negotiates an exchange.
    pub require_headers: bool,
    /// Where cert chains are served; defaults to the sign URL's origin.
    pub cert_url_base: Option<Url>,
    pub max_payload_bytes: usize,
    pub signing: SigningOptions,
}

impl Default for PackagerSettings {
    fn default() -> Self {
        Self {
            require_headers: false,
            cert_url_base: None,
            max_payload_bytes: sxgpkg_core::config::DEFAULT_MAX_PAYLOAD_BYTES,
            signing: SigningOptions::default(),
        }
    }
}

impl PackagerSettings {
    /// Settings from a loaded config.
    pub fn from_config(config: &PackagerConfig) -> std::result::Result<Self, ConfigError> {
        Ok(Self {
            require_headers: config.require_headers,
            cert_url_base: config.cert_url_base()?,
            max_payload_bytes: config.max_payload_bytes,
            signing: SigningOptions::default(),
        })
    }
}

/// Negotiated exchange parameters.
struct Negotiated {
    header: Option<String>,
    version: i64,
}

/// Fetches, transforms and signs documents.
pub struct Packager {
    matcher: UrlMatcher,
    pipeline: Pipeline,
    certs: Arc<CertificateStore>,
    chains: Arc<CertChainCache>,
    client: Arc<dyn OriginClient>,
    resolver: Arc<dyn OriginResolver>,
    runtime: Arc<RuntimeCache>,
    settings: PackagerSettings,
}

impl Packager {
    pub fn new(
        matcher: UrlMatcher,
        pipeline: Pipeline,
        certs: Arc<CertificateStore>,
        client: Arc<dyn OriginClient>,
    ) -> Self {
        Self {
            matcher,
            pipeline,
            certs,
            chains: Arc::new(CertChainCache::new()),
            client,
            resolver: Arc::new(DirectResolver),
            runtime: Arc::new(RuntimeCache::default()),
            settings: PackagerSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: PackagerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn OriginResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_chain_cache(mut self, chains: Arc<CertChainCache>) -> Self {
        self.chains = chains;
        self
    }

    /// Runtime version and CSS to use, possibly kept fresh by a poller.
    pub fn with_runtime(mut self, runtime: Arc<RuntimeCache>) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn certs(&self) -> &Arc<CertificateStore> {
        &self.certs
    }

    pub fn chains(&self) -> &Arc<CertChainCache> {
        &self.chains
    }

    pub fn runtime(&self) -> &Arc<RuntimeCache> {
        &self.runtime
    }

    pub fn settings(&self) -> &PackagerSettings {
        &self.settings
    }

    /// Runs one request through the packaging flow.
    pub async fn package(&self, request: PackageRequest) -> Result<PackageOutcome> {
        self.run(request).await.inspect_err(PackageError::log)
    }

    async fn run(&self, request: PackageRequest) -> Result<PackageOutcome> {
        let (sign, fetch) = request.target()?;
        let auth = self.matcher.authorize(sign, fetch)?;

        let origin_request = OriginRequest {
            url: self.resolver.resolve(&auth.fetch_url),
            headers: request
                .headers
                .iter()
                .filter(|(name, _)| is_conditional(name))
                .cloned()
                .collect(),
        };
        let fetch_url = auth.fetch_url.to_string();
        let response = self.client.fetch(origin_request).await?;

        if let MatchDecision::Fetch(_) = auth.decision {
            debug!("Proxying {} (fetch-only match)", fetch_url);
            return Ok(PackageOutcome::Proxied(proxied(response)));
        }

        if let Err(e) = self.certs.current().health(Utc::now()) {
            warn!("Not packaging {} because the certificate is unhealthy: {}", fetch_url, e);
            return Ok(PackageOutcome::Proxied(proxied(response)));
        }

        match response.status {
            200 => {}
            301 | 302 | 303 => return Ok(PackageOutcome::Proxied(redirect(response))),
            304 => return Ok(PackageOutcome::Proxied(not_modified(response))),
            status => {
                return Err(OriginFailure::UnexpectedStatus {
                    url: fetch_url,
                    status,
                }
                .into())
            }
        }

        self.validate(&fetch_url, &response)?;
        let headers = strip_stateful(&response.headers, auth.error_on_stateful_headers)?;

        let negotiated = match self.negotiate(&request) {
            Some(negotiated) => negotiated,
            None => {
                info!("Not packaging {}: client did not negotiate an exchange", fetch_url);
                return Ok(PackageOutcome::Proxied(proxied(response)));
            }
        };

        let markup = String::from_utf8(response.body).map_err(|_| {
            OriginFailure::UnsupportedCharset {
                url: fetch_url.clone(),
                charset: "invalid utf-8".to_string(),
            }
        })?;

        let sign_url = auth.sign_url.to_string();
        let runtime = self.runtime.current();
        let transform_request = TransformRequest {
            markup,
            document_url: auth.sign_url.clone(),
            transforms: None,
            runtime_version: runtime.version.clone(),
            runtime_css: runtime.css.clone(),
            version: negotiated.version,
        };
        let transformed = self
            .pipeline
            .apply(&transform_request)
            .map_err(|source| PackageError::Transform {
                url: sign_url.clone(),
                source,
            })?;

        let exchange = self
            .sign(&auth.sign_url, inner_headers(headers, &self.settings.signing), transformed.as_bytes())
            .map_err(|source| PackageError::Signing {
                url: sign_url.clone(),
                source,
            })?;

        info!("Packaged {} ({} bytes)", sign_url, exchange.len());
        Ok(PackageOutcome::Signed {
            exchange,
            amp_cache_transform: negotiated.header,
        })
    }

    fn validate(&self, url: &str, response: &OriginResponse) -> Result<()> {
        if let Some(reason) =
            uncacheable_reason(response.header("cache-control"), response.header("vary"))
        {
            return Err(OriginFailure::Uncacheable {
                url: url.to_string(),
                reason,
            }
            .into());
        }

        let content_type = response.header("content-type").unwrap_or("");
        let media_type = MediaType::parse(content_type).filter(|m| m.essence == "text/html");
        let Some(media_type) = media_type else {
            return Err(OriginFailure::NotHtml {
                url: url.to_string(),
                content_type: content_type.to_string(),
            }
            .into());
        };
        if !media_type.is_utf8_html() {
            return Err(OriginFailure::UnsupportedCharset {
                url: url.to_string(),
                charset: media_type.charset.unwrap_or_default(),
            }
            .into());
        }

        if let Some(encoding) = response
            .header("content-encoding")
            .map(str::trim)
            .filter(|e| !e.is_empty() && !e.eq_ignore_ascii_case("identity"))
        {
            return Err(OriginFailure::UnsupportedEncoding {
                url: url.to_string(),
                encoding: encoding.to_string(),
            }
            .into());
        }

        if response.body.len() > self.settings.max_payload_bytes {
            return Err(OriginFailure::TooLarge {
                url: url.to_string(),
                limit: self.settings.max_payload_bytes,
            }
            .into());
        }
        Ok(())
    }

    /// `None` means the client should get the unsigned document.
    fn negotiate(&self, request: &PackageRequest) -> Option<Negotiated> {
        let act = request.header("amp-cache-transform").and_then(should_send_sxg);
        if self.settings.require_headers {
            let (header, version) = act?;
            if !request.header("accept").is_some_and(accepts_signed_exchange) {
                return None;
            }
            return Some(Negotiated {
                header: Some(header),
                version,
            });
        }
        match act {
            Some((header, version)) => Some(Negotiated {
                header: Some(header),
                version,
            }),
            None => Some(Negotiated {
                header: None,
                version: select_version(&[]).unwrap_or(1),
            }),
        }
    }

    fn sign(
        &self,
        sign_url: &Url,
        headers: Vec<(String, String)>,
        body: &[u8],
    ) -> std::result::Result<Vec<u8>, sxgpkg_signer::SigningError> {
        let context = self.certs.current();
        self.chains.get_or_insert(&context)?;

        let cert_url = cert_url(self.settings.cert_url_base.as_ref(), sign_url, &context)?;
        let validity_url = validity_url(sign_url)?;
        let signer = Signer::with_options(context, self.settings.signing);
        signer.sign(SigningMaterial {
            request_url: sign_url,
            status: 200,
            headers,
            body,
            cert_url: &cert_url,
            validity_url: &validity_url,
        })
    }
}

/// Origin headers minus hop-by-hop ones, including those named by
/// `Connection`. Content-Length is recomputed on the way out.
fn forwardable(headers: &[(String, String)]) -> Vec<(String, String)> {
    let named: Vec<String> = headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case("connection"))
        .flat_map(|(_, v)| connection_tokens(v))
        .collect();
    headers
        .iter()
        .filter(|(n, _)| {
            !is_hop_by_hop(n)
                && !n.eq_ignore_ascii_case("content-length")
                && !named.iter().any(|t| t.eq_ignore_ascii_case(n))
        })
        .cloned()
        .collect()
}

fn proxied(response: OriginResponse) -> OriginResponse {
    OriginResponse {
        headers: forwardable(&response.headers),
        ..response
    }
}

fn redirect(response: OriginResponse) -> OriginResponse {
    let mut out = OriginResponse::new(response.status).with_body(response.body.clone());
    if let Some(location) = response.header("location") {
        out = out.with_header("location", location);
    }
    out
}

fn not_modified(response: OriginResponse) -> OriginResponse {
    OriginResponse {
        status: 304,
        headers: response
            .headers
            .into_iter()
            .filter(|(n, _)| NOT_MODIFIED_PASSTHROUGH.iter().any(|h| h.eq_ignore_ascii_case(n)))
            .collect(),
        body: Vec::new(),
    }
}

fn strip_stateful(
    headers: &[(String, String)],
    error_on_stateful_headers: bool,
) -> std::result::Result<Vec<(String, String)>, PolicyRejection> {
    let mut kept = Vec::with_capacity(headers.len());
    for (name, value) in forwardable(headers) {
        if is_stateful(&name) {
            if error_on_stateful_headers {
                return Err(PolicyRejection::StatefulHeaders {
                    header: name.to_ascii_lowercase(),
                });
            }
            continue;
        }
        kept.push((name, value));
    }
    Ok(kept)
}

/// Headers of the signed inner response.
fn inner_headers(
    origin: Vec<(String, String)>,
    signing: &SigningOptions,
) -> Vec<(String, String)> {
    const REPLACED: &[&str] = &[
        "link",
        "content-type",
        "content-encoding",
        "digest",
        "x-content-type-options",
        "content-security-policy",
    ];
    let mut headers: Vec<(String, String)> = origin
        .into_iter()
        .map(|(n, v)| (n.to_ascii_lowercase(), v))
        .filter(|(n, _)| !REPLACED.contains(&n.as_str()))
        .collect();

    if !headers.iter().any(|(n, _)| n == "cache-control") {
        headers.push((
            "cache-control".to_string(),
            format!("public, max-age={}", signing.lifetime.num_seconds()),
        ));
    }
    headers.push(("content-type".to_string(), INNER_CONTENT_TYPE.to_string()));
    headers.push(("x-content-type-options".to_string(), "nosniff".to_string()));
    headers.push((
        "content-security-policy".to_string(),
        CONTENT_SECURITY_POLICY.to_string(),
    ));
    headers
}
