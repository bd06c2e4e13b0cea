//! SXG Packager Server - HTTP front end.
//!
//! Fetches documents from the origin, transforms them and serves them as
//! signed exchanges, along with the certificate chain needed to verify them.
//!
//! ## Endpoints
//!
//! - `GET /priv/doc?sign=<url>[&fetch=<url>]` - Package a document
//! - `GET /priv/doc/{*sign}` - Package the document named in the path
//! - `GET /amppkg/cert/{name}` - Certificate chain (CBOR)
//! - `GET /amppkg/validity` - Validity data (CBOR)
//! - `GET /healthz` - Certificate and OCSP health (JSON)
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use sxgpkg_core::PackagerConfig;
//! use sxgpkg_server::{AppState, HttpOriginClient, Packager, Server, ServerConfig};
//! use sxgpkg_signer::{CertificateContext, CertificateStore};
//! use sxgpkg_transform::Pipeline;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PackagerConfig::load("sxgpkg.toml")?;
//!     let certs = CertificateContext::load(&config.cert_file, &config.key_file)?;
//!     let client = HttpOriginClient::new(Duration::from_secs(60), config.max_payload_bytes)?;
//!     let packager = Packager::new(
//!         config.build_matcher()?,
//!         Pipeline::default(),
//!         Arc::new(CertificateStore::new(certs)),
//!         Arc::new(client),
//!     );
//!     let server = Server::with_state(ServerConfig::default(), AppState::new(packager))?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod error;
mod handlers;
pub mod origin;
pub mod packager;
pub mod refresh;
pub mod state;

use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use error::{OriginFailure, PackageError, RefreshError, Result};
pub use origin::{
    BaseUrlOverride, DirectResolver, HttpOriginClient, OriginClient, OriginRequest,
    OriginResolver, OriginResponse,
};
pub use packager::{PackageOutcome, PackageRequest, Packager, PackagerSettings};
pub use refresh::{OcspRefresher, RuntimeCache, RuntimeInfo, RuntimePoller};
pub use state::AppState;

/// Default server port.
pub const DEFAULT_PORT: u16 = sxgpkg_core::config::DEFAULT_PORT;

/// Default server host.
pub const DEFAULT_HOST: &str = sxgpkg_core::config::DEFAULT_HOST;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to (default: 0.0.0.0).
    pub host: String,
    /// Port to bind to (default: 8080).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    /// Sets the host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind to {0}: {1}")]
    BindError(SocketAddr, std::io::Error),

    /// Server runtime error.
    #[error("server error: {0}")]
    Runtime(String),
}

/// Builds the router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/priv/doc", get(handlers::package_query))
        .route("/priv/doc/{*sign}", get(handlers::package_path))
        .route("/amppkg/cert/{name}", get(handlers::cert_chain))
        .route("/amppkg/validity", get(handlers::validity))
        .route("/healthz", get(handlers::healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The packager HTTP server.
pub struct Server {
    router: Router,
    addr: SocketAddr,
}

impl Server {
    /// Creates a server with the given application state.
    pub fn with_state(
        config: ServerConfig,
        state: AppState,
    ) -> std::result::Result<Self, ServerError> {
        let addr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| ServerError::Runtime(format!("invalid address: {}", e)))?;

        Ok(Self {
            router: router(state),
            addr,
        })
    }

    /// Returns the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Runs the server until shutdown.
    pub async fn run(self) -> std::result::Result<(), ServerError> {
        info!("Starting packager on {}", self.addr);

        let domain = if self.addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        // Allow rebinding while old sockets sit in TIME_WAIT
        socket
            .set_reuse_address(true)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        socket
            .bind(&self.addr.into())
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .listen(1024)
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = tokio::net::TcpListener::from_std(std_listener)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        axum::serve(listener, self.router)
            .await
            .map_err(|e| ServerError::Runtime(e.to_string()))?;

        Ok(())
    }

    /// Returns the router for testing.
    pub fn router(&self) -> Router {
        self.router.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use sxgpkg_signer::{cert_chain_cbor, extract_cert_url, SignedExchange};
    use tower::ServiceExt;

    use crate::packager::test_support::{packager, StubOrigin, ARTICLE};

    fn create_test_app(origin: Arc<StubOrigin>) -> (Router, sxgpkg_signer::testing::TestChain) {
        let (packager, chain) = packager(origin, PackagerSettings::default());
        (router(AppState::new(packager)), chain)
    }

    async fn get(app: &Router, uri: &str) -> axum::response::Response {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        app.clone().oneshot(request).await.unwrap()
    }

    async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn test_sign_and_serve_chain() {
        let origin = StubOrigin::html(ARTICLE);
        let (app, chain) = create_test_app(Arc::clone(&origin));

        let response = get(&app, "/priv/doc?sign=https%3A%2F%2Fexample.com%2Farticle.html").await;
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers().clone();
        assert_eq!(headers["content-type"], "application/signed-exchange;v=b3");
        assert_eq!(headers["cache-control"], "no-transform");
        assert_eq!(headers["x-content-type-options"], "nosniff");
        assert_eq!(headers["vary"], "Accept, AMP-Cache-Transform");

        let bytes = body_bytes(response).await;
        let ctx = chain.context();
        let parsed = SignedExchange::parse(&bytes).unwrap();
        parsed.verify(&ctx.verifying_key()).unwrap();
        assert_eq!(origin.calls(), 1);

        let cert_url = extract_cert_url(&bytes).unwrap();
        assert_eq!(cert_url.host_str(), Some("example.com"));
        assert_eq!(
            cert_url.path(),
            format!("/amppkg/cert/{}", ctx.cert_url_name())
        );

        let response = get(&app, cert_url.path()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "application/cert-chain+cbor"
        );
        // The stapled response runs three days from an hour ago
        let cache_control = response.headers()["cache-control"].to_str().unwrap().to_string();
        let max_age: i64 = cache_control
            .strip_prefix("public, max-age=")
            .unwrap()
            .parse()
            .unwrap();
        assert!((30 * 3600..=36 * 3600).contains(&max_age), "{}", cache_control);

        let served = body_bytes(response).await;
        let value: ciborium::Value = ciborium::from_reader(served.as_slice()).unwrap();
        let leaf = value.as_array().unwrap()[1].as_map().unwrap().clone();
        assert_eq!(leaf[0].1.as_bytes(), Some(&chain.leaf_der));
        assert!(!leaf[1].1.as_bytes().unwrap().is_empty());
        assert_ne!(served, cert_chain_cbor(&ctx).unwrap());
    }

    #[tokio::test]
    async fn test_path_form() {
        let origin = StubOrigin::html(ARTICLE);
        let (app, _) = create_test_app(Arc::clone(&origin));

        let response = get(&app, "/priv/doc/https://example.com/article.html").await;
        assert_eq!(response.status(), StatusCode::OK);
        let seen = origin.seen.lock();
        assert_eq!(seen[0].url.as_str(), "https://example.com/article.html");
    }

    #[tokio::test]
    async fn test_reject_does_not_fetch() {
        let origin = StubOrigin::html(ARTICLE);
        let (app, _) = create_test_app(Arc::clone(&origin));

        let response = get(&app, "/priv/doc?sign=https%3A%2F%2Fevil.com%2F").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(json["code"], "no_match");
        assert_eq!(origin.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_sign_param() {
        let origin = StubOrigin::html(ARTICLE);
        let (app, _) = create_test_app(Arc::clone(&origin));

        let response = get(&app, "/priv/doc").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(origin.calls(), 0);
    }

    #[tokio::test]
    async fn test_redirect_passthrough() {
        let origin = StubOrigin::new(Ok(OriginResponse::new(301)
            .with_header("location", "https://example.com/moved")));
        let (app, _) = create_test_app(origin);

        let response = get(&app, "/priv/doc?sign=https%3A%2F%2Fexample.com%2Fold").await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()["location"], "https://example.com/moved");
    }

    #[tokio::test]
    async fn test_unknown_cert_is_not_found() {
        let (app, _) = create_test_app(StubOrigin::html(ARTICLE));
        let response = get(&app, "/amppkg/cert/unknown").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_validity() {
        let (app, _) = create_test_app(StubOrigin::html(ARTICLE));
        let response = get(&app, "/amppkg/validity").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "application/cbor");
        assert_eq!(body_bytes(response).await, vec![0xa0]);
    }

    fn unstapled_app() -> Router {
        let chain = sxgpkg_signer::testing::generate_chain(
            &sxgpkg_signer::testing::ChainOptions::around_now(),
        );
        let packager = Packager::new(
            sxgpkg_core::UrlMatcher::compile(&crate::packager::test_support::url_sets()).unwrap(),
            sxgpkg_transform::Pipeline::default(),
            Arc::new(sxgpkg_signer::CertificateStore::new(chain.context())),
            StubOrigin::html(ARTICLE),
        );
        router(AppState::new(packager))
    }

    #[tokio::test]
    async fn test_healthz() {
        let (app, chain) = create_test_app(StubOrigin::html(ARTICLE));
        let response = get(&app, "/healthz").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["cache-control"], "no-store");
        let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(json["healthy"], true);
        assert_eq!(json["certificate"], chain.context().cert_url_name());
        assert!(json["ocsp_next_update"].is_string());
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn test_unhealthy_without_ocsp() {
        let app = unstapled_app();
        let response = get(&app, "/healthz").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(json["healthy"], false);
        assert_eq!(json["error"], "No OCSP response loaded");

        // Documents go out unsigned
        let response = get(&app, "/priv/doc?sign=https%3A%2F%2Fexample.com%2Fa").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/html; charset=utf-8");
        assert_eq!(body_bytes(response).await, ARTICLE.as_bytes());
    }

    #[tokio::test]
    async fn test_chain_needs_ocsp() {
        let app = unstapled_app();
        let response = get(&app, "/healthz").await;
        let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        let name = json["certificate"].as_str().unwrap().to_string();

        let response = get(&app, &format!("/amppkg/cert/{}", name)).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(json["code"], "unhealthy");
    }

    #[test]
    fn test_server_config_builder() {
        let config = ServerConfig::default().with_port(9000).with_host("127.0.0.1");
        let (packager, _) = packager(StubOrigin::html(ARTICLE), PackagerSettings::default());
        let server = Server::with_state(config, AppState::new(packager)).unwrap();
        assert_eq!(server.addr().to_string(), "127.0.0.1:9000");
    }
}
