//! Application state for the packager server.

use std::sync::Arc;

use sxgpkg_signer::{CertChainCache, CertificateStore};

use crate::packager::Packager;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// The packaging pipeline.
    pub packager: Arc<Packager>,
    /// Active signing certificate.
    pub certs: Arc<CertificateStore>,
    /// Serialized chains, by cert URL name.
    pub chains: Arc<CertChainCache>,
}

impl AppState {
    /// Creates state sharing the packager's certificate store and chain cache.
    pub fn new(packager: Packager) -> Self {
        let certs = Arc::clone(packager.certs());
        let chains = Arc::clone(packager.chains());
        Self {
            packager: Arc::new(packager),
            certs,
            chains,
        }
    }
}
