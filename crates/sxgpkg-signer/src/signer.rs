//! Signing a response into a b3 exchange.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use p256::ecdsa::signature::Signer as _;
use p256::ecdsa::Signature;
use tracing::debug;
use url::Url;

use crate::certs::CertificateContext;
use crate::error::SigningError;
use crate::exchange::{signed_message, Exchange, SignatureHeader, INTEGRITY};

/// Path prefix under which certificate chains are served.
pub const CERT_PATH_PREFIX: &str = "/amppkg/cert/";

/// Path of the validity data.
pub const VALIDITY_PATH: &str = "/amppkg/validity";

/// Cert URL for `context`.
///
/// Without a `base` the chain is served from the origin of `sign_url`. A
/// configured `base` keeps its scheme, host and path, so
/// `https://cdn.example/sxg` yields `https://cdn.example/sxg/amppkg/cert/...`.
pub fn cert_url(
    base: Option<&Url>,
    sign_url: &Url,
    context: &CertificateContext,
) -> Result<Url, SigningError> {
    let name = context.cert_url_name();
    let joined = match base {
        None => sign_url.join(&format!("{}{}", CERT_PATH_PREFIX, name)),
        Some(base) => {
            let mut base = base.clone();
            base.set_query(None);
            base.set_fragment(None);
            if !base.path().ends_with('/') {
                let dir = format!("{}/", base.path());
                base.set_path(&dir);
            }
            base.join(&format!("{}{}", CERT_PATH_PREFIX.trim_start_matches('/'), name))
        }
    };
    joined.map_err(|e| SigningError::InvalidUrl(e.to_string()))
}

/// Validity URL on the origin of `sign_url`.
pub fn validity_url(sign_url: &Url) -> Result<Url, SigningError> {
    sign_url
        .join(VALIDITY_PATH)
        .map_err(|e| SigningError::InvalidUrl(e.to_string()))
}

/// Timing of the signature window.
#[derive(Debug, Clone, Copy)]
pub struct SigningOptions {
    /// How far `date` is set before now, to absorb client clock skew.
    pub backdate: Duration,
    /// Distance from `date` to `expires`.
    pub lifetime: Duration,
}

impl Default for SigningOptions {
    fn default() -> Self {
        Self {
            backdate: Duration::days(1),
            lifetime: Duration::days(7),
        }
    }
}

/// Everything that goes into one exchange.
#[derive(Debug, Clone)]
pub struct SigningMaterial<'a> {
    pub request_url: &'a Url,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: &'a [u8],
    pub cert_url: &'a Url,
    pub validity_url: &'a Url,
}

/// Signs exchanges with one certificate context.
#[derive(Debug, Clone)]
pub struct Signer {
    context: Arc<CertificateContext>,
    options: SigningOptions,
}

impl Signer {
    pub fn new(context: Arc<CertificateContext>) -> Self {
        Self::with_options(context, SigningOptions::default())
    }

    pub fn with_options(context: Arc<CertificateContext>, options: SigningOptions) -> Self {
        Self { context, options }
    }

    pub fn context(&self) -> &CertificateContext {
        &self.context
    }

    /// `(date, expires)` for a signature made at `now`.
    pub fn window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let date = now - self.options.backdate;
        (date, date + self.options.lifetime)
    }

    /// Signs at the current time.
    pub fn sign(&self, material: SigningMaterial<'_>) -> Result<Vec<u8>, SigningError> {
        self.sign_at(material, Utc::now())
    }

    /// Signs as if the current time were `now`.
    pub fn sign_at(
        &self,
        material: SigningMaterial<'_>,
        now: DateTime<Utc>,
    ) -> Result<Vec<u8>, SigningError> {
        let (date, expires) = self.window(now);
        if self.context.not_before() > now {
            return Err(SigningError::CertificateNotYetValid {
                not_before: self.context.not_before().timestamp(),
            });
        }
        if self.context.not_after() < expires {
            return Err(SigningError::ValidityWindowTooShort {
                not_after: self.context.not_after().timestamp(),
                expires: expires.timestamp(),
            });
        }

        let exchange = Exchange::new(
            material.request_url.as_str(),
            material.status,
            material.headers,
            material.body,
        );
        let headers_cbor = exchange.headers_cbor()?;

        let mut header = SignatureHeader {
            label: "label".to_string(),
            sig: Vec::new(),
            integrity: INTEGRITY.to_string(),
            validity_url: material.validity_url.to_string(),
            cert_url: material.cert_url.to_string(),
            cert_sha256: self.context.fingerprint().to_vec(),
            date: date.timestamp().max(0) as u64,
            expires: expires.timestamp().max(0) as u64,
        };
        let message = signed_message(&header, exchange.request_url.as_str(), &headers_cbor);
        let signature: Signature = self.context.signing_key().sign(&message);
        header.sig = signature.to_der().as_bytes().to_vec();

        let bytes = exchange.encode(&header)?;
        debug!(
            "Signed {} ({} payload bytes, {} total, expires {})",
            material.request_url,
            material.body.len(),
            bytes.len(),
            expires
        );
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::SignedExchange;
    use crate::testing::{generate_chain, ChainOptions};
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    struct Urls {
        request: Url,
        cert: Url,
        validity: Url,
    }

    fn urls(ctx: &CertificateContext) -> Urls {
        let request = Url::parse("https://example.com/article.html").unwrap();
        Urls {
            cert: cert_url(None, &request, ctx).unwrap(),
            validity: validity_url(&request).unwrap(),
            request,
        }
    }

    fn material<'a>(urls: &'a Urls, body: &'a [u8]) -> SigningMaterial<'a> {
        SigningMaterial {
            request_url: &urls.request,
            status: 200,
            headers: vec![(
                "content-type".to_string(),
                "text/html;charset=utf-8".to_string(),
            )],
            body,
            cert_url: &urls.cert,
            validity_url: &urls.validity,
        }
    }

    #[test]
    fn window_backdates_one_day() {
        let signer = Signer::new(Arc::new(generate_chain(&ChainOptions::default()).context()));
        let (date, expires) = signer.window(at(2026, 1, 15));
        assert_eq!(date, at(2026, 1, 14));
        assert_eq!(expires, at(2026, 1, 21));
    }

    #[test]
    fn urls_follow_layout() {
        let ctx = generate_chain(&ChainOptions::default()).context();
        let u = urls(&ctx);
        assert_eq!(u.validity.as_str(), "https://example.com/amppkg/validity");
        assert_eq!(
            u.cert.as_str(),
            format!("https://example.com/amppkg/cert/{}", ctx.cert_url_name())
        );
    }

    #[test]
    fn cert_url_base_keeps_path_prefix() {
        let ctx = generate_chain(&ChainOptions::default()).context();
        let sign_url = Url::parse("https://example.com/news/a.html").unwrap();
        let name = ctx.cert_url_name();

        let root = Url::parse("https://cdn.example.net").unwrap();
        assert_eq!(
            cert_url(Some(&root), &sign_url, &ctx).unwrap().as_str(),
            format!("https://cdn.example.net/amppkg/cert/{}", name)
        );

        for base in ["https://cdn.example.net/sxg", "https://cdn.example.net/sxg/?x=1"] {
            let base = Url::parse(base).unwrap();
            assert_eq!(
                cert_url(Some(&base), &sign_url, &ctx).unwrap().as_str(),
                format!("https://cdn.example.net/sxg/amppkg/cert/{}", name)
            );
        }

        assert_eq!(
            cert_url(None, &sign_url, &ctx).unwrap().as_str(),
            format!("https://example.com/amppkg/cert/{}", name)
        );
    }

    #[test]
    fn signs_and_verifies() {
        let ctx = Arc::new(generate_chain(&ChainOptions::default()).context());
        let signer = Signer::new(Arc::clone(&ctx));
        let u = urls(&ctx);
        let bytes = signer
            .sign_at(material(&u, b"<html>hi</html>"), at(2026, 1, 15))
            .unwrap();

        let parsed = SignedExchange::parse(&bytes).unwrap();
        parsed.verify(&ctx.verifying_key()).unwrap();
        assert_eq!(parsed.payload().unwrap(), b"<html>hi</html>");
        assert_eq!(parsed.signature.date, at(2026, 1, 14).timestamp() as u64);
        assert_eq!(parsed.signature.cert_sha256, ctx.fingerprint().to_vec());
        assert_eq!(parsed.cert_url().unwrap(), u.cert.as_str());
        assert_eq!(
            parsed.exchange.header("content-encoding"),
            Some("mi-sha256-03")
        );
    }

    #[test]
    fn other_key_does_not_verify() {
        let ctx = Arc::new(generate_chain(&ChainOptions::default()).context());
        let other = generate_chain(&ChainOptions::default()).context();
        let u = urls(&ctx);
        let bytes = Signer::new(Arc::clone(&ctx))
            .sign_at(material(&u, b"x"), at(2026, 1, 15))
            .unwrap();
        let parsed = SignedExchange::parse(&bytes).unwrap();
        assert!(parsed.verify(&other.verifying_key()).is_err());
    }

    #[test]
    fn rejects_certificate_expiring_inside_window() {
        let ctx = Arc::new(generate_chain(&ChainOptions::default()).context());
        let u = urls(&ctx);
        let err = Signer::new(Arc::clone(&ctx))
            .sign_at(material(&u, b"x"), at(2026, 2, 25))
            .unwrap_err();
        assert!(matches!(err, SigningError::ValidityWindowTooShort { .. }));
    }

    #[test]
    fn rejects_certificate_not_yet_valid() {
        let ctx = Arc::new(generate_chain(&ChainOptions::default()).context());
        let u = urls(&ctx);
        let err = Signer::new(Arc::clone(&ctx))
            .sign_at(material(&u, b"x"), at(2025, 12, 15))
            .unwrap_err();
        assert!(matches!(err, SigningError::CertificateNotYetValid { .. }));
    }
}
