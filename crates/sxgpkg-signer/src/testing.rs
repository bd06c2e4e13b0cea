//! Certificate chain fixtures for tests.
//!
//! Chains are generated with rcgen: a self-signed issuer and a P-256 leaf
//! carrying the CanSignHttpExchanges extension. OCSP responses are built
//! with the crate's DER writer and carry a placeholder signature.

use chrono::{DateTime, Datelike, Duration, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, CustomExtension, IsCa, Issuer, KeyPair,
};

use crate::certs::CertificateContext;
use crate::der::{
    explicit, generalized_time, implicit, sequence, tlv, BIT_STRING, ENUMERATED, OCTET_STRING, OID,
    SEQUENCE,
};
use crate::ocsp::{CertId, BASIC_RESPONSE_OID};

const CAN_SIGN_HTTP_EXCHANGES: &[u64] = &[1, 3, 6, 1, 4, 1, 11129, 2, 1, 22];
const AUTHORITY_INFO_ACCESS: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 1, 1];
const ID_AD_OCSP: &[u8] = &[0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x30, 0x01];
const ECDSA_WITH_SHA256: &[u8] = &[0x2a, 0x86, 0x48, 0xce, 0x3d, 0x04, 0x03, 0x02];

/// Knobs for [`generate_chain`].
#[derive(Debug, Clone)]
pub struct ChainOptions {
    pub domain: String,
    pub eligible_leaf: bool,
    pub eligible_issuer: bool,
    /// Leaf `notBefore` as (year, month, day).
    pub not_before: (i32, u8, u8),
    /// Leaf `notAfter` as (year, month, day).
    pub not_after: (i32, u8, u8),
    /// OCSP responder named in the leaf's AIA extension.
    pub ocsp_responder: Option<String>,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            domain: "example.com".to_string(),
            eligible_leaf: true,
            eligible_issuer: false,
            not_before: (2026, 1, 1),
            not_after: (2026, 3, 1),
            ocsp_responder: None,
        }
    }
}

impl ChainOptions {
    /// A leaf valid from 20 days ago until 60 days from now.
    pub fn around_now() -> Self {
        let now = Utc::now();
        let ymd = |d: chrono::DateTime<Utc>| (d.year(), d.month() as u8, d.day() as u8);
        Self {
            not_before: ymd(now - Duration::days(20)),
            not_after: ymd(now + Duration::days(60)),
            ..Self::default()
        }
    }
}

/// A generated issuer and leaf with their keys.
#[derive(Debug, Clone)]
pub struct TestChain {
    pub leaf_der: Vec<u8>,
    pub issuer_der: Vec<u8>,
    pub leaf_pem: String,
    pub issuer_pem: String,
    pub key_pem: String,
    pub issuer_key_pem: String,
}

impl TestChain {
    /// Leaf followed by the issuer.
    pub fn chain_pem(&self) -> String {
        format!("{}{}", self.leaf_pem, self.issuer_pem)
    }

    pub fn context(&self) -> CertificateContext {
        CertificateContext::from_pem(self.chain_pem().as_bytes(), self.key_pem.as_bytes())
            .expect("generated chain should load")
    }

    /// The context with a good OCSP response valid from an hour ago for
    /// three days.
    pub fn stapled_context(&self) -> CertificateContext {
        let context = self.context();
        let now = Utc::now();
        let ocsp = ocsp_response(
            &context,
            now - Duration::hours(1),
            Some(now + Duration::days(3)),
            OcspStatus::Good,
        );
        context.with_ocsp(ocsp)
    }
}

fn eligible_extension() -> CustomExtension {
    CustomExtension::from_oid_content(CAN_SIGN_HTTP_EXCHANGES, vec![0x05, 0x00])
}

/// Generates a chain per `options`.
pub fn generate_chain(options: &ChainOptions) -> TestChain {
    let issuer_key = KeyPair::generate().expect("issuer key");
    let mut issuer_params = CertificateParams::new(Vec::<String>::new()).expect("issuer params");
    issuer_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    if options.eligible_issuer {
        issuer_params.custom_extensions.push(eligible_extension());
    }
    let issuer_cert = issuer_params.self_signed(&issuer_key).expect("issuer cert");
    let issuer_key_pem = issuer_key.serialize_pem();
    let issuer = Issuer::new(issuer_params, issuer_key);

    let leaf_key = KeyPair::generate().expect("leaf key");
    let mut leaf_params =
        CertificateParams::new(vec![options.domain.clone()]).expect("leaf params");
    let (y, m, d) = options.not_before;
    leaf_params.not_before = rcgen::date_time_ymd(y, m, d);
    let (y, m, d) = options.not_after;
    leaf_params.not_after = rcgen::date_time_ymd(y, m, d);
    if options.eligible_leaf {
        leaf_params.custom_extensions.push(eligible_extension());
    }
    if let Some(responder) = &options.ocsp_responder {
        let access = sequence(&[&tlv(OID, ID_AD_OCSP), &tlv(implicit(6), responder.as_bytes())]);
        leaf_params.custom_extensions.push(CustomExtension::from_oid_content(
            AUTHORITY_INFO_ACCESS,
            sequence(&[&access]),
        ));
    }
    let leaf_cert = leaf_params
        .signed_by(&leaf_key, &issuer)
        .expect("leaf cert");

    TestChain {
        leaf_der: leaf_cert.der().to_vec(),
        issuer_der: issuer_cert.der().to_vec(),
        leaf_pem: leaf_cert.pem(),
        issuer_pem: issuer_cert.pem(),
        key_pem: leaf_key.serialize_pem(),
        issuer_key_pem,
    }
}

// ===== OCSP =====

/// Certificate status reported by [`ocsp_response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcspStatus {
    Good,
    Revoked,
    Unknown,
}

/// A successful OCSP response for the context's leaf.
pub fn ocsp_response(
    context: &CertificateContext,
    this_update: DateTime<Utc>,
    next_update: Option<DateTime<Utc>>,
    status: OcspStatus,
) -> Vec<u8> {
    let cert_id = CertId::for_context(context).expect("chain should hold the issuer");
    let cert_status = match status {
        OcspStatus::Good => tlv(implicit(0), &[]),
        OcspStatus::Revoked => tlv(explicit(1), &generalized_time(this_update)),
        OcspStatus::Unknown => tlv(implicit(2), &[]),
    };
    let mut single = vec![cert_id.to_der(), cert_status, generalized_time(this_update)];
    if let Some(next_update) = next_update {
        single.push(tlv(explicit(0), &generalized_time(next_update)));
    }
    let responses = sequence(&[&tlv(SEQUENCE, &single.concat())]);

    let responder_id = tlv(explicit(2), &tlv(OCTET_STRING, &[0u8; 20]));
    let tbs = sequence(&[&responder_id, &generalized_time(this_update), &responses]);
    let algorithm = sequence(&[&tlv(OID, ECDSA_WITH_SHA256)]);
    let basic = sequence(&[&tbs, &algorithm, &tlv(BIT_STRING, &[0, 0])]);

    let response_bytes = sequence(&[&tlv(OID, BASIC_RESPONSE_OID), &tlv(OCTET_STRING, &basic)]);
    sequence(&[&tlv(ENUMERATED, &[0]), &tlv(explicit(0), &response_bytes)])
}

/// An OCSP response carrying only a non-successful `responseStatus`.
pub fn ocsp_error_response(status: u8) -> Vec<u8> {
    sequence(&[&tlv(ENUMERATED, &[status])])
}
