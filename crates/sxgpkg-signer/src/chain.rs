//! CBOR certificate chains served at the cert URL.

use std::collections::HashMap;
use std::sync::Arc;

use ciborium::Value;
use parking_lot::RwLock;

use crate::certs::CertificateContext;
use crate::error::SigningError;

/// Media type of a serialized chain.
pub const CERT_CHAIN_CONTENT_TYPE: &str = "application/cert-chain+cbor";

const CHAIN_MAGIC: &str = "\u{1F4DC}\u{26D3}";

/// Serializes `["📜⛓", {cert, ocsp}, {cert}...]`.
///
/// Only the leaf entry carries `ocsp`; it is empty when no response was
/// configured.
pub fn cert_chain_cbor(context: &CertificateContext) -> Result<Vec<u8>, SigningError> {
    let mut items = Vec::with_capacity(2 + context.issuers_der().len());
    items.push(Value::Text(CHAIN_MAGIC.to_string()));
    items.push(Value::Map(vec![
        (
            Value::Text("cert".to_string()),
            Value::Bytes(context.leaf_der().to_vec()),
        ),
        (
            Value::Text("ocsp".to_string()),
            Value::Bytes(context.ocsp().to_vec()),
        ),
    ]));
    for issuer in context.issuers_der() {
        items.push(Value::Map(vec![(
            Value::Text("cert".to_string()),
            Value::Bytes(issuer.clone()),
        )]));
    }

    let mut out = Vec::new();
    ciborium::into_writer(&Value::Array(items), &mut out)
        .map_err(|e| SigningError::Cbor(e.to_string()))?;
    Ok(out)
}

/// Serialized chains by cert URL name.
///
/// An entry is written on first use and only replaced by [`Self::refresh`]
/// when a new OCSP response is stapled.
#[derive(Debug, Default)]
pub struct CertChainCache {
    entries: RwLock<HashMap<String, Arc<Vec<u8>>>>,
}

impl CertChainCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Vec<u8>>> {
        self.entries.read().get(name).cloned()
    }

    /// Returns the chain for `context`, serializing it on first use.
    pub fn get_or_insert(&self, context: &CertificateContext) -> Result<Arc<Vec<u8>>, SigningError> {
        if let Some(chain) = self.get(context.cert_url_name()) {
            return Ok(chain);
        }
        let chain = Arc::new(cert_chain_cbor(context)?);
        let mut entries = self.entries.write();
        let entry = entries
            .entry(context.cert_url_name().to_string())
            .or_insert(chain);
        Ok(Arc::clone(entry))
    }

    /// Re-serializes the chain for `context`, replacing any cached bytes.
    pub fn refresh(&self, context: &CertificateContext) -> Result<Arc<Vec<u8>>, SigningError> {
        let chain = Arc::new(cert_chain_cbor(context)?);
        self.entries
            .write()
            .insert(context.cert_url_name().to_string(), Arc::clone(&chain));
        Ok(chain)
    }
}
