//! Certificate loading, eligibility checks and the swappable store.

use std::fmt;
use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use p256::ecdsa::SigningKey;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::DecodePrivateKey;
use p256::SecretKey;
use parking_lot::RwLock;
use rustls_pemfile::Item;
use sha2::{Digest, Sha256};
use x509_parser::certificate::X509Certificate;

use crate::error::{CertificateError, HealthError, OcspError, Result};
use crate::ocsp::{parse_response, CertId, OcspWindow};

/// OID of the CanSignHttpExchanges extension.
pub const CAN_SIGN_HTTP_EXCHANGES_OID: &str = "1.3.6.1.4.1.11129.2.1.22";

/// DER encoding of ASN.1 NULL, the only allowed extension value.
const DER_NULL: &[u8] = &[0x05, 0x00];

/// Longest leaf validity period a signed exchange certificate may have.
pub const MAX_LEAF_VALIDITY_DAYS: i64 = 90;

/// True iff the certificate carries CanSignHttpExchanges with a NULL value.
pub fn can_sign_http_exchanges(cert: &X509Certificate<'_>) -> bool {
    cert.extensions()
        .iter()
        .any(|ext| ext.oid.to_id_string() == CAN_SIGN_HTTP_EXCHANGES_OID && ext.value == DER_NULL)
}

/// DER variant of [`can_sign_http_exchanges`]. Unparseable input is ineligible.
pub fn der_can_sign_http_exchanges(der: &[u8]) -> bool {
    x509_parser::parse_x509_certificate(der)
        .map(|(_, cert)| can_sign_http_exchanges(&cert))
        .unwrap_or(false)
}

/// Path segment under which a certificate chain is served.
pub fn cert_url_name(leaf_der: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(Sha256::digest(leaf_der))
}

// ===== Certificate Context =====

/// Leaf, issuers and signing key, validated together.
#[derive(Clone)]
pub struct CertificateContext {
    leaf_der: Vec<u8>,
    issuers_der: Vec<Vec<u8>>,
    signing_key: SigningKey,
    fingerprint: [u8; 32],
    cert_url_name: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    ocsp: Vec<u8>,
    ocsp_window: std::result::Result<OcspWindow, OcspError>,
}

// Key material stays out of Debug output.
impl fmt::Debug for CertificateContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateContext")
            .field("cert_url_name", &self.cert_url_name)
            .field("issuers", &self.issuers_der.len())
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("ocsp_len", &self.ocsp.len())
            .field("ocsp_window", &self.ocsp_window)
            .finish()
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|source| CertificateError::Read {
        path: path.display().to_string(),
        source,
    })
}

fn asn1_to_utc(time: &x509_parser::time::ASN1Time) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(time.timestamp(), 0)
        .single()
        .ok_or_else(|| CertificateError::Parse("validity timestamp out of range".to_string()))
}

impl CertificateContext {
    /// Loads a PEM chain (leaf first) and a PEM private key from disk.
    pub fn load(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let cert_pem = read_file(cert_path.as_ref())?;
        let key_pem = read_file(key_path.as_ref())?;
        let context = Self::from_pem(&cert_pem, &key_pem)?;
        tracing::info!(
            "Loaded certificate {} from {:?} (valid until {})",
            context.cert_url_name,
            cert_path.as_ref(),
            context.not_after
        );
        Ok(context)
    }

    /// Builds a context from PEM bytes.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let chain: Vec<Vec<u8>> = rustls_pemfile::certs(&mut BufReader::new(cert_pem))
            .map(|c| c.map(|der| der.as_ref().to_vec()))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| CertificateError::Parse(e.to_string()))?;
        let (leaf_der, issuers_der) = chain
            .split_first()
            .map(|(leaf, rest)| (leaf.clone(), rest.to_vec()))
            .ok_or(CertificateError::NoCertificate)?;

        let (_, leaf) = x509_parser::parse_x509_certificate(&leaf_der)
            .map_err(|e| CertificateError::Parse(e.to_string()))?;
        if !can_sign_http_exchanges(&leaf) {
            return Err(CertificateError::LeafNotEligible);
        }
        for (index, der) in issuers_der.iter().enumerate() {
            let (_, issuer) = x509_parser::parse_x509_certificate(der)
                .map_err(|e| CertificateError::Parse(e.to_string()))?;
            if can_sign_http_exchanges(&issuer) {
                return Err(CertificateError::IssuerEligible { index });
            }
        }

        let not_before = asn1_to_utc(&leaf.validity().not_before)?;
        let not_after = asn1_to_utc(&leaf.validity().not_after)?;
        let days = (not_after - not_before).num_days();
        if days > MAX_LEAF_VALIDITY_DAYS {
            return Err(CertificateError::ValidityTooLong {
                days,
                max: MAX_LEAF_VALIDITY_DAYS,
            });
        }

        let secret = parse_private_key(key_pem)?;
        let point = secret.public_key().to_encoded_point(false);
        if leaf.public_key().subject_public_key.data.as_ref() != point.as_bytes() {
            return Err(CertificateError::KeyMismatch);
        }

        let fingerprint: [u8; 32] = Sha256::digest(&leaf_der).into();
        Ok(Self {
            cert_url_name: cert_url_name(&leaf_der),
            leaf_der,
            issuers_der,
            signing_key: SigningKey::from(&secret),
            fingerprint,
            not_before,
            not_after,
            ocsp: Vec::new(),
            ocsp_window: Err(OcspError::Missing),
        })
    }

    /// Attaches a DER OCSP response for the leaf.
    ///
    /// The response is stapled as given; a response that does not parse
    /// leaves the context unhealthy (see [`Self::health`]).
    pub fn with_ocsp(mut self, ocsp: Vec<u8>) -> Self {
        self.ocsp_window = if ocsp.is_empty() {
            Err(OcspError::Missing)
        } else {
            CertId::for_context(&self).and_then(|id| parse_response(&ocsp, &id))
        };
        if let Err(e) = &self.ocsp_window {
            tracing::warn!("OCSP response for {} is unusable: {}", self.cert_url_name, e);
        }
        self.ocsp = ocsp;
        self
    }

    /// Loads the OCSP response from a file.
    pub fn with_ocsp_file(self, path: impl AsRef<Path>) -> Result<Self> {
        let ocsp = read_file(path.as_ref())?;
        Ok(self.with_ocsp(ocsp))
    }

    pub fn leaf_der(&self) -> &[u8] {
        &self.leaf_der
    }

    pub fn issuers_der(&self) -> &[Vec<u8>] {
        &self.issuers_der
    }

    pub fn ocsp(&self) -> &[u8] {
        &self.ocsp
    }

    /// SHA-256 of the leaf DER.
    pub fn fingerprint(&self) -> &[u8; 32] {
        &self.fingerprint
    }

    /// base64url (unpadded) of [`Self::fingerprint`].
    pub fn cert_url_name(&self) -> &str {
        &self.cert_url_name
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Window of the stapled OCSP response, if it parsed.
    pub fn ocsp_window(&self) -> std::result::Result<OcspWindow, OcspError> {
        self.ocsp_window.clone()
    }

    /// Whether exchanges signed now would verify: the leaf is inside its
    /// validity period and the stapled OCSP response is current.
    pub fn health(&self, now: DateTime<Utc>) -> std::result::Result<OcspWindow, HealthError> {
        if now < self.not_before {
            return Err(HealthError::CertificateNotYetValid(self.not_before));
        }
        if now >= self.not_after {
            return Err(HealthError::CertificateExpired(self.not_after));
        }
        let window = self.ocsp_window.clone()?;
        window.check(now)?;
        Ok(window)
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// Key that verifies signatures made with this context.
    pub fn verifying_key(&self) -> p256::ecdsa::VerifyingKey {
        *self.signing_key.verifying_key()
    }
}

/// Reads the first P-256 key (PKCS#8 or SEC1) from PEM input.
fn parse_private_key(key_pem: &[u8]) -> Result<SecretKey> {
    for item in rustls_pemfile::read_all(&mut BufReader::new(key_pem)) {
        let item = item.map_err(|e| CertificateError::UnsupportedKey(e.to_string()))?;
        match item {
            Item::Pkcs8Key(key) => {
                return SecretKey::from_pkcs8_der(key.secret_pkcs8_der())
                    .map_err(|e| CertificateError::UnsupportedKey(e.to_string()));
            }
            Item::Sec1Key(key) => {
                return SecretKey::from_sec1_der(key.secret_sec1_der())
                    .map_err(|e| CertificateError::UnsupportedKey(e.to_string()));
            }
            Item::Pkcs1Key(_) => {
                return Err(CertificateError::UnsupportedKey(
                    "RSA keys cannot sign exchanges".to_string(),
                ));
            }
            _ => continue,
        }
    }
    Err(CertificateError::NoPrivateKey)
}

// ===== Certificate Store =====

/// Holds the active certificate context. A reload swaps it whole.
#[derive(Debug)]
pub struct CertificateStore {
    current: RwLock<Arc<CertificateContext>>,
}

impl CertificateStore {
    pub fn new(context: CertificateContext) -> Self {
        Self {
            current: RwLock::new(Arc::new(context)),
        }
    }

    /// The context in use right now.
    pub fn current(&self) -> Arc<CertificateContext> {
        Arc::clone(&self.current.read())
    }

    /// Replaces the context, returning the previous one.
    pub fn replace(&self, context: CertificateContext) -> Arc<CertificateContext> {
        let next = Arc::new(context);
        tracing::info!("Switching certificate to {}", next.cert_url_name());
        std::mem::replace(&mut *self.current.write(), next)
    }

    /// Staples a new OCSP response onto the current context.
    pub fn update_ocsp(&self, ocsp: Vec<u8>) -> Arc<CertificateContext> {
        let mut current = self.current.write();
        let next = Arc::new(current.as_ref().clone().with_ocsp(ocsp));
        *current = Arc::clone(&next);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{generate_chain, ocsp_response, ChainOptions, OcspStatus};
    use chrono::Duration;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn leaf_is_eligible_issuer_is_not() {
        let chain = generate_chain(&ChainOptions::default());
        assert!(der_can_sign_http_exchanges(&chain.leaf_der));
        assert!(!der_can_sign_http_exchanges(&chain.issuer_der));
        assert!(!der_can_sign_http_exchanges(b"not a cert"));
    }

    #[test]
    fn loads_valid_chain() {
        let chain = generate_chain(&ChainOptions::default());
        let ctx = CertificateContext::from_pem(chain.chain_pem().as_bytes(), chain.key_pem.as_bytes())
            .unwrap();
        assert_eq!(ctx.leaf_der(), chain.leaf_der.as_slice());
        assert_eq!(ctx.issuers_der().len(), 1);
        assert_eq!(ctx.cert_url_name(), cert_url_name(&chain.leaf_der));
        assert!(!ctx.cert_url_name().contains('='));
        assert!(format!("{:?}", ctx).contains("cert_url_name"));
    }

    #[test]
    fn load_reads_files() {
        let chain = generate_chain(&ChainOptions::default());
        let mut cert_file = NamedTempFile::new().unwrap();
        cert_file.write_all(chain.chain_pem().as_bytes()).unwrap();
        let mut key_file = NamedTempFile::new().unwrap();
        key_file.write_all(chain.key_pem.as_bytes()).unwrap();

        let ctx = CertificateContext::load(cert_file.path(), key_file.path()).unwrap();
        assert_eq!(ctx.issuers_der().len(), 1);

        let missing = CertificateContext::load("/nonexistent/cert.pem", key_file.path());
        assert!(matches!(missing, Err(CertificateError::Read { .. })));
    }

    #[test]
    fn rejects_ineligible_leaf() {
        let chain = generate_chain(&ChainOptions {
            eligible_leaf: false,
            ..ChainOptions::default()
        });
        let err = CertificateContext::from_pem(chain.chain_pem().as_bytes(), chain.key_pem.as_bytes())
            .unwrap_err();
        assert!(matches!(err, CertificateError::LeafNotEligible));
    }

    #[test]
    fn rejects_eligible_issuer() {
        let chain = generate_chain(&ChainOptions {
            eligible_issuer: true,
            ..ChainOptions::default()
        });
        let err = CertificateContext::from_pem(chain.chain_pem().as_bytes(), chain.key_pem.as_bytes())
            .unwrap_err();
        assert!(matches!(err, CertificateError::IssuerEligible { index: 0 }));
    }

    #[test]
    fn rejects_mismatched_key() {
        let chain = generate_chain(&ChainOptions::default());
        let err = CertificateContext::from_pem(
            chain.chain_pem().as_bytes(),
            chain.issuer_key_pem.as_bytes(),
        )
        .unwrap_err();
        assert!(matches!(err, CertificateError::KeyMismatch));
    }

    #[test]
    fn rejects_long_validity() {
        let chain = generate_chain(&ChainOptions {
            not_after: (2026, 6, 1),
            ..ChainOptions::default()
        });
        let err = CertificateContext::from_pem(chain.chain_pem().as_bytes(), chain.key_pem.as_bytes())
            .unwrap_err();
        assert!(matches!(err, CertificateError::ValidityTooLong { .. }));
    }

    #[test]
    fn rejects_empty_input() {
        assert!(matches!(
            CertificateContext::from_pem(b"", b""),
            Err(CertificateError::NoCertificate)
        ));
        let chain = generate_chain(&ChainOptions::default());
        assert!(matches!(
            CertificateContext::from_pem(chain.chain_pem().as_bytes(), b""),
            Err(CertificateError::NoPrivateKey)
        ));
    }

    #[test]
    fn store_swaps_whole_context() {
        let first = generate_chain(&ChainOptions::default());
        let second = generate_chain(&ChainOptions::default());
        let store = CertificateStore::new(first.context());
        let before = store.current();
        let previous = store.replace(second.context());
        assert_eq!(previous.cert_url_name(), before.cert_url_name());
        assert_ne!(store.current().cert_url_name(), before.cert_url_name());
    }

    #[test]
    fn health_needs_current_ocsp() {
        let ctx = generate_chain(&ChainOptions::around_now()).context();
        let now = Utc::now();
        assert_eq!(ctx.health(now), Err(HealthError::Ocsp(OcspError::Missing)));

        let good = ocsp_response(&ctx, now - Duration::hours(1), Some(now + Duration::days(2)), OcspStatus::Good);
        let ctx = ctx.with_ocsp(good);
        let window = ctx.health(now).unwrap();
        assert_eq!(ctx.ocsp_window(), Ok(window));
        assert!(matches!(
            ctx.health(now + Duration::days(3)),
            Err(HealthError::Ocsp(OcspError::Expired(_)))
        ));
        assert!(matches!(
            ctx.health(now + Duration::days(90)),
            Err(HealthError::CertificateExpired(_))
        ));

        let ctx = ctx.with_ocsp(vec![1, 2, 3]);
        assert!(matches!(ctx.health(now), Err(HealthError::Ocsp(OcspError::Malformed(_)))));
        assert_eq!(ctx.ocsp(), &[1, 2, 3]);
    }

    #[test]
    fn update_ocsp_swaps_context() {
        let ctx = generate_chain(&ChainOptions::around_now()).context();
        let now = Utc::now();
        let good = ocsp_response(&ctx, now - Duration::hours(1), Some(now + Duration::days(2)), OcspStatus::Good);
        let store = CertificateStore::new(ctx);
        let before = store.current();

        let after = store.update_ocsp(good.clone());
        assert_eq!(after.cert_url_name(), before.cert_url_name());
        assert!(before.ocsp().is_empty());
        assert_eq!(store.current().ocsp(), good.as_slice());
        assert!(store.current().health(now).is_ok());
    }
}
