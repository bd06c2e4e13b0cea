//! OCSP for the signing leaf.
//!
//! Builds the request a responder expects and checks the DER response
//! before it is stapled into the cert chain. The responder's signature is
//! not verified here; clients verify the stapled response themselves.

use base64::Engine;
use chrono::{DateTime, Utc};
use sha1::{Digest, Sha1};
use x509_parser::extensions::{GeneralName, ParsedExtension};

use crate::certs::CertificateContext;
use crate::der::{
    explicit, implicit, parse_generalized_time, sequence, tlv, Reader, ENUMERATED,
    GENERALIZED_TIME, INTEGER, OCTET_STRING, OID, SEQUENCE,
};
use crate::error::OcspError;

/// Largest response body accepted from a responder.
pub const MAX_OCSP_RESPONSE_BYTES: usize = 1024 * 1024;

/// Longest thisUpdate..nextUpdate span a stapled response may have.
pub const MAX_OCSP_LIFETIME_DAYS: i64 = 7;

pub const OCSP_REQUEST_CONTENT_TYPE: &str = "application/ocsp-request";

/// Requests longer than this as a GET URL are POSTed instead.
const MAX_GET_URL_LEN: usize = 255;

const ID_AD_OCSP: &str = "1.3.6.1.5.5.7.48.1";

/// AlgorithmIdentifier for SHA-1 with NULL parameters.
const SHA1_ALGORITHM: &[u8] = &[0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00];
const SHA1_OID: &[u8] = &[0x2b, 0x0e, 0x03, 0x02, 0x1a];

/// id-pkix-ocsp-basic
pub(crate) const BASIC_RESPONSE_OID: &[u8] = &[0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x30, 0x01, 0x01];

fn parse_cert(der: &[u8]) -> Result<x509_parser::certificate::X509Certificate<'_>, OcspError> {
    x509_parser::parse_x509_certificate(der)
        .map(|(_, cert)| cert)
        .map_err(|e| OcspError::Malformed(e.to_string()))
}

// ===== Cert ID =====

/// Names the leaf to a responder: SHA-1 of the issuer name and key, plus
/// the leaf serial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertId {
    pub issuer_name_hash: [u8; 20],
    pub issuer_key_hash: [u8; 20],
    pub serial: Vec<u8>,
}

impl CertId {
    /// Finds the leaf's issuer in the chain and hashes it.
    pub fn for_context(context: &CertificateContext) -> Result<Self, OcspError> {
        let leaf = parse_cert(context.leaf_der())?;
        for der in context.issuers_der() {
            let issuer = parse_cert(der)?;
            if issuer.subject().as_raw() == leaf.issuer().as_raw() {
                return Ok(Self {
                    issuer_name_hash: Sha1::digest(issuer.subject().as_raw()).into(),
                    issuer_key_hash: Sha1::digest(issuer.public_key().subject_public_key.data.as_ref())
                        .into(),
                    serial: leaf.raw_serial().to_vec(),
                });
            }
        }
        Err(OcspError::NoIssuer)
    }

    pub fn to_der(&self) -> Vec<u8> {
        sequence(&[
            SHA1_ALGORITHM,
            &tlv(OCTET_STRING, &self.issuer_name_hash),
            &tlv(OCTET_STRING, &self.issuer_key_hash),
            &tlv(INTEGER, &self.serial),
        ])
    }

    /// Whether a CertID from a response names the same certificate.
    ///
    /// Responders may hash with another algorithm; then only the serial
    /// can be compared.
    fn matches(&self, content: &[u8]) -> Result<bool, OcspError> {
        let mut id = Reader::new(content);
        let mut algorithm = Reader::new(id.read(SEQUENCE)?);
        let oid = algorithm.read(OID)?;
        let name_hash = id.read(OCTET_STRING)?;
        let key_hash = id.read(OCTET_STRING)?;
        let serial = id.read(INTEGER)?;
        if serial != self.serial.as_slice() {
            return Ok(false);
        }
        if oid != SHA1_OID {
            return Ok(true);
        }
        Ok(name_hash == self.issuer_name_hash.as_slice()
            && key_hash == self.issuer_key_hash.as_slice())
    }
}

/// The leaf's OCSP responder, from its Authority Information Access.
pub fn responder_url(leaf_der: &[u8]) -> Result<String, OcspError> {
    let leaf = parse_cert(leaf_der)?;
    for ext in leaf.extensions() {
        if let ParsedExtension::AuthorityInfoAccess(aia) = ext.parsed_extension() {
            for desc in &aia.accessdescs {
                if desc.access_method.to_id_string() != ID_AD_OCSP {
                    continue;
                }
                if let GeneralName::URI(uri) = &desc.access_location {
                    return Ok(uri.to_string());
                }
            }
        }
    }
    Err(OcspError::NoResponder)
}

// ===== Request =====

/// A DER OCSPRequest for one certificate and where to send it.
#[derive(Debug, Clone)]
pub struct OcspRequest {
    pub responder: String,
    pub cert_id: CertId,
    pub der: Vec<u8>,
}

impl OcspRequest {
    pub fn for_context(context: &CertificateContext) -> Result<Self, OcspError> {
        let responder = responder_url(context.leaf_der())?;
        let cert_id = CertId::for_context(context)?;
        let request = sequence(&[&cert_id.to_der()]);
        let request_list = sequence(&[&request]);
        let tbs_request = sequence(&[&request_list]);
        Ok(Self {
            responder,
            cert_id,
            der: sequence(&[&tbs_request]),
        })
    }

    /// The GET form of the request, when it is short enough.
    pub fn get_url(&self) -> Option<String> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(&self.der);
        let escaped: String = url::form_urlencoded::byte_serialize(encoded.as_bytes()).collect();
        let url = format!("{}/{}", self.responder.trim_end_matches('/'), escaped);
        (url.len() <= MAX_GET_URL_LEN).then_some(url)
    }
}

// ===== Response =====

/// thisUpdate and nextUpdate of a good response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OcspWindow {
    pub this_update: DateTime<Utc>,
    pub next_update: DateTime<Utc>,
}

impl OcspWindow {
    /// When a fresh response should be fetched.
    pub fn midpoint(&self) -> DateTime<Utc> {
        self.this_update + (self.next_update - self.this_update) / 2
    }

    /// Fails unless `now` lies inside the window.
    pub fn check(&self, now: DateTime<Utc>) -> Result<(), OcspError> {
        if self.this_update > now {
            return Err(OcspError::NotYetValid(self.this_update));
        }
        if self.next_update <= now {
            return Err(OcspError::Expired(self.next_update));
        }
        Ok(())
    }
}

/// Walks a DER OCSPResponse to the single response for `cert_id`.
///
/// The status must be good, nextUpdate must be present and the window may
/// span at most [`MAX_OCSP_LIFETIME_DAYS`]. Times are not compared with the
/// clock; see [`OcspWindow::check`].
pub fn parse_response(der: &[u8], cert_id: &CertId) -> Result<OcspWindow, OcspError> {
    let mut response = Reader::new(Reader::new(der).read(SEQUENCE)?);
    match response.read(ENUMERATED)? {
        [0] => {}
        [status] => return Err(OcspError::ResponderStatus(*status)),
        _ => return Err(OcspError::Malformed("responseStatus".to_string())),
    }

    let response_bytes = response.read(explicit(0))?;
    let mut response_bytes = Reader::new(Reader::new(response_bytes).read(SEQUENCE)?);
    if response_bytes.read(OID)? != BASIC_RESPONSE_OID {
        return Err(OcspError::Malformed("not a basic OCSP response".to_string()));
    }
    let basic = response_bytes.read(OCTET_STRING)?;
    let mut basic = Reader::new(Reader::new(basic).read(SEQUENCE)?);

    let mut tbs = Reader::new(basic.read(SEQUENCE)?);
    tbs.read_optional(explicit(0))?;
    let (responder_id, _) = tbs.read_any()?;
    if responder_id != explicit(1) && responder_id != explicit(2) {
        return Err(OcspError::Malformed("responderID".to_string()));
    }
    tbs.read(GENERALIZED_TIME)?;

    let mut responses = Reader::new(tbs.read(SEQUENCE)?);
    while !responses.is_empty() {
        let mut single = Reader::new(responses.read(SEQUENCE)?);
        if !cert_id.matches(single.read(SEQUENCE)?)? {
            continue;
        }

        let (status, _) = single.read_any()?;
        if status == explicit(1) {
            return Err(OcspError::NotGood("revoked"));
        } else if status == implicit(2) {
            return Err(OcspError::NotGood("unknown"));
        } else if status != implicit(0) {
            return Err(OcspError::Malformed("certStatus".to_string()));
        }

        let this_update = parse_generalized_time(single.read(GENERALIZED_TIME)?)?;
        let next_update = match single.read_optional(explicit(0))? {
            Some(content) => {
                parse_generalized_time(Reader::new(content).read(GENERALIZED_TIME)?)?
            }
            None => return Err(OcspError::MissingNextUpdate),
        };

        let lifetime = next_update - this_update;
        if lifetime > chrono::Duration::days(MAX_OCSP_LIFETIME_DAYS) {
            return Err(OcspError::LifetimeTooLong {
                days: lifetime.num_days(),
                max: MAX_OCSP_LIFETIME_DAYS,
            });
        }
        return Ok(OcspWindow {
            this_update,
            next_update,
        });
    }
    Err(OcspError::NoMatchingResponse)
}

/// Parses `der` for the context's leaf and checks it against `now`.
pub fn verify_response(
    der: &[u8],
    context: &CertificateContext,
    now: DateTime<Utc>,
) -> Result<OcspWindow, OcspError> {
    let window = parse_response(der, &CertId::for_context(context)?)?;
    window.check(now)?;
    Ok(window)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        generate_chain, ocsp_error_response, ocsp_response, ChainOptions, OcspStatus,
    };
    use chrono::Duration;

    fn context_with_responder() -> CertificateContext {
        generate_chain(&ChainOptions {
            ocsp_responder: Some("http://ocsp.example.net".to_string()),
            ..ChainOptions::around_now()
        })
        .context()
    }

    // ==================== Request Tests ====================

    #[test]
    fn cert_id_hashes_issuer() {
        let chain = generate_chain(&ChainOptions::default());
        let ctx = chain.context();
        let id = CertId::for_context(&ctx).unwrap();

        let (_, issuer) = x509_parser::parse_x509_certificate(&chain.issuer_der).unwrap();
        let expected: [u8; 20] = Sha1::digest(issuer.subject().as_raw()).into();
        assert_eq!(id.issuer_name_hash, expected);
        let (_, leaf) = x509_parser::parse_x509_certificate(&chain.leaf_der).unwrap();
        assert_eq!(id.serial, leaf.raw_serial());
        assert!(id.matches(Reader::new(&id.to_der()).read(SEQUENCE).unwrap()).unwrap());
    }

    #[test]
    fn cert_id_needs_issuer_in_chain() {
        let chain = generate_chain(&ChainOptions::default());
        let leaf_only =
            CertificateContext::from_pem(chain.leaf_pem.as_bytes(), chain.key_pem.as_bytes())
                .unwrap();
        assert_eq!(CertId::for_context(&leaf_only), Err(OcspError::NoIssuer));
    }

    #[test]
    fn responder_comes_from_aia() {
        let ctx = context_with_responder();
        assert_eq!(responder_url(ctx.leaf_der()).unwrap(), "http://ocsp.example.net");

        let plain = generate_chain(&ChainOptions::default()).context();
        assert_eq!(responder_url(plain.leaf_der()), Err(OcspError::NoResponder));
        assert!(matches!(
            OcspRequest::for_context(&plain),
            Err(OcspError::NoResponder)
        ));
    }

    #[test]
    fn request_wraps_cert_id() {
        let ctx = context_with_responder();
        let request = OcspRequest::for_context(&ctx).unwrap();

        let mut outer = Reader::new(Reader::new(&request.der).read(SEQUENCE).unwrap());
        let mut tbs = Reader::new(outer.read(SEQUENCE).unwrap());
        let mut list = Reader::new(tbs.read(SEQUENCE).unwrap());
        let mut single = Reader::new(list.read(SEQUENCE).unwrap());
        assert_eq!(single.read_raw().unwrap(), request.cert_id.to_der().as_slice());
        assert!(outer.is_empty() && tbs.is_empty() && list.is_empty());

        let url = request.get_url().unwrap();
        assert!(url.starts_with("http://ocsp.example.net/M"));
        assert!(!url[24..].contains('/'));
    }

    #[test]
    fn long_requests_are_posted() {
        let mut request = OcspRequest::for_context(&context_with_responder()).unwrap();
        request.responder = format!("http://ocsp.example.net/{}", "p".repeat(200));
        assert!(request.get_url().is_none());
    }

    // ==================== Response Tests ====================

    #[test]
    fn accepts_good_response() {
        let ctx = context_with_responder();
        let now = Utc::now();
        let this_update = now - Duration::hours(12);
        let der = ocsp_response(&ctx, this_update, Some(now + Duration::days(3)), OcspStatus::Good);

        let window = verify_response(&der, &ctx, now).unwrap();
        assert_eq!(window.this_update.timestamp(), this_update.timestamp());
        assert!(window.midpoint() > window.this_update && window.midpoint() < window.next_update);
    }

    #[test]
    fn rejects_bad_status() {
        let ctx = context_with_responder();
        let now = Utc::now();
        let next = Some(now + Duration::days(1));
        let revoked = ocsp_response(&ctx, now - Duration::hours(1), next, OcspStatus::Revoked);
        assert_eq!(verify_response(&revoked, &ctx, now), Err(OcspError::NotGood("revoked")));
        let unknown = ocsp_response(&ctx, now - Duration::hours(1), next, OcspStatus::Unknown);
        assert_eq!(verify_response(&unknown, &ctx, now), Err(OcspError::NotGood("unknown")));
        assert_eq!(
            verify_response(&ocsp_error_response(6), &ctx, now),
            Err(OcspError::ResponderStatus(6))
        );
    }

    #[test]
    fn rejects_bad_windows() {
        let ctx = context_with_responder();
        let now = Utc::now();

        let future = ocsp_response(&ctx, now + Duration::hours(1), Some(now + Duration::days(2)), OcspStatus::Good);
        assert!(matches!(verify_response(&future, &ctx, now), Err(OcspError::NotYetValid(_))));

        let stale = ocsp_response(&ctx, now - Duration::days(3), Some(now - Duration::hours(1)), OcspStatus::Good);
        assert!(matches!(verify_response(&stale, &ctx, now), Err(OcspError::Expired(_))));

        let long = ocsp_response(&ctx, now - Duration::days(1), Some(now + Duration::days(8)), OcspStatus::Good);
        assert!(matches!(
            verify_response(&long, &ctx, now),
            Err(OcspError::LifetimeTooLong { max: 7, .. })
        ));

        let open = ocsp_response(&ctx, now - Duration::days(1), None, OcspStatus::Good);
        assert_eq!(verify_response(&open, &ctx, now), Err(OcspError::MissingNextUpdate));
    }

    #[test]
    fn rejects_response_for_other_certificate() {
        let ctx = context_with_responder();
        let other = generate_chain(&ChainOptions::around_now()).context();
        let now = Utc::now();
        let der = ocsp_response(&other, now - Duration::hours(1), Some(now + Duration::days(1)), OcspStatus::Good);
        assert_eq!(verify_response(&der, &ctx, now), Err(OcspError::NoMatchingResponse));
    }

    #[test]
    fn rejects_garbage() {
        let ctx = context_with_responder();
        assert!(matches!(
            verify_response(b"not der", &ctx, Utc::now()),
            Err(OcspError::Malformed(_))
        ));
        assert!(matches!(
            verify_response(&[], &ctx, Utc::now()),
            Err(OcspError::Malformed(_))
        ));
    }
}
