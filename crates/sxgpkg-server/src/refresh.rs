//! Background refreshers: the stapled OCSP response and the AMP runtime.
//!
//! Both keep serving the last good value when a refresh fails.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE};
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use sxgpkg_core::headers::max_age;
use sxgpkg_signer::{
    verify_response, CertChainCache, CertificateStore, OcspRequest, MAX_OCSP_RESPONSE_BYTES,
    OCSP_REQUEST_CONTENT_TYPE,
};

use crate::error::RefreshError;
use crate::origin::USER_AGENT;

/// How often the OCSP refresher wakes up.
pub const OCSP_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Wake-up interval while a refresh is due but has not succeeded.
pub const OCSP_RETRY_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// How often runtime metadata is polled.
pub const RUNTIME_POLL_INTERVAL: Duration = Duration::from_secs(60 * 60);

const REFRESH_TIMEOUT: Duration = Duration::from_secs(60);

/// Largest runtime metadata or CSS body accepted.
const MAX_RUNTIME_BYTES: usize = 1024 * 1024;

fn http_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(REFRESH_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()
}

fn fetch_error(url: &str, e: reqwest::Error) -> RefreshError {
    RefreshError::Fetch {
        url: url.to_string(),
        message: e.to_string(),
    }
}

/// Sends `request` and buffers a 200 body of at most `limit` bytes.
async fn read_ok(
    request: reqwest::RequestBuilder,
    url: &str,
    limit: usize,
) -> Result<(reqwest::header::HeaderMap, Vec<u8>), RefreshError> {
    let mut response = request.send().await.map_err(|e| fetch_error(url, e))?;
    let status = response.status().as_u16();
    if status != 200 {
        return Err(RefreshError::Status {
            url: url.to_string(),
            status,
        });
    }
    let headers = response.headers().clone();
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(|e| fetch_error(url, e))? {
        if body.len() + chunk.len() > limit {
            return Err(RefreshError::TooLarge {
                url: url.to_string(),
                limit,
            });
        }
        body.extend_from_slice(&chunk);
    }
    Ok((headers, body))
}

// ===== OCSP =====

/// Keeps a current OCSP response stapled to the active certificate.
///
/// A new response is fetched once the current one passes the midpoint of
/// its window, or earlier if the responder's Cache-Control says so.
pub struct OcspRefresher {
    client: reqwest::Client,
    certs: Arc<CertificateStore>,
    chains: Arc<CertChainCache>,
    http_expiry: Mutex<Option<DateTime<Utc>>>,
}

impl OcspRefresher {
    pub fn new(certs: Arc<CertificateStore>, chains: Arc<CertChainCache>) -> reqwest::Result<Self> {
        Ok(Self {
            client: http_client()?,
            certs,
            chains,
            http_expiry: Mutex::new(None),
        })
    }

    /// Whether the stapled response is missing, unusable or due for renewal.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        let Ok(window) = self.certs.current().ocsp_window() else {
            return true;
        };
        if now >= window.midpoint() || window.check(now).is_err() {
            return true;
        }
        self.http_expiry.lock().is_some_and(|expiry| now >= expiry)
    }

    /// Fetches and staples a fresh response when one is due.
    ///
    /// Returns whether the stapled response changed.
    pub async fn refresh(&self) -> Result<bool, RefreshError> {
        let now = Utc::now();
        if !self.needs_refresh(now) {
            return Ok(false);
        }

        let context = self.certs.current();
        let request = OcspRequest::for_context(&context)?;
        let (builder, url) = match request.get_url() {
            Some(url) => (self.client.get(&url), url),
            None => (
                self.client
                    .post(&request.responder)
                    .header(CONTENT_TYPE, OCSP_REQUEST_CONTENT_TYPE)
                    .body(request.der.clone()),
                request.responder.clone(),
            ),
        };
        debug!("Fetching OCSP response from {}", url);
        let (headers, der) = read_ok(builder, &url, MAX_OCSP_RESPONSE_BYTES).await?;

        let window = verify_response(&der, &context, now)?;
        let expiry = headers
            .get(CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .and_then(max_age)
            .and_then(|secs| chrono::Duration::try_seconds(secs as i64))
            .map(|age| now + age);

        let updated = self.certs.update_ocsp(der);
        self.chains.refresh(&updated)?;
        *self.http_expiry.lock() = expiry;
        info!(
            "Stapled OCSP response for {} (next update {}, refresh after {})",
            updated.cert_url_name(),
            window.next_update,
            window.midpoint()
        );
        Ok(true)
    }

    /// Refreshes until the task is dropped, hourly or every
    /// [`OCSP_RETRY_INTERVAL`] while a refresh is overdue.
    pub async fn run(self: Arc<Self>) {
        loop {
            let wait = if self.needs_refresh(Utc::now()) {
                OCSP_RETRY_INTERVAL
            } else {
                OCSP_CHECK_INTERVAL
            };
            tokio::time::sleep(wait).await;
            if let Err(e) = self.refresh().await {
                warn!("OCSP refresh failed, keeping the current response: {}", e);
            }
        }
    }
}

// ===== AMP Runtime =====

/// Runtime version and inline CSS handed to the transforms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeInfo {
    pub version: Option<String>,
    pub css: Option<String>,
}

/// The runtime info in use; swapped whole by the poller.
#[derive(Debug, Default)]
pub struct RuntimeCache {
    current: RwLock<Arc<RuntimeInfo>>,
}

impl RuntimeCache {
    pub fn new(info: RuntimeInfo) -> Self {
        Self {
            current: RwLock::new(Arc::new(info)),
        }
    }

    pub fn current(&self) -> Arc<RuntimeInfo> {
        Arc::clone(&self.current.read())
    }

    pub fn set(&self, info: RuntimeInfo) {
        *self.current.write() = Arc::new(info);
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuntimeMetadata {
    #[serde(default)]
    amp_runtime_version: String,
    #[serde(default)]
    amp_css_url: String,
}

/// Polls runtime metadata and fetches the CSS of each new version.
pub struct RuntimePoller {
    client: reqwest::Client,
    metadata_url: Url,
    cache: Arc<RuntimeCache>,
}

impl RuntimePoller {
    pub fn new(metadata_url: Url, cache: Arc<RuntimeCache>) -> reqwest::Result<Self> {
        Ok(Self {
            client: http_client()?,
            metadata_url,
            cache,
        })
    }

    /// Fetches the metadata; the CSS is only fetched when the version moved.
    ///
    /// Returns whether the cache changed.
    pub async fn poll(&self) -> Result<bool, RefreshError> {
        let url = self.metadata_url.as_str();
        let (_, body) = read_ok(self.client.get(url), url, MAX_RUNTIME_BYTES).await?;
        let metadata: RuntimeMetadata =
            serde_json::from_slice(&body).map_err(|e| RefreshError::Metadata(e.to_string()))?;
        if metadata.amp_runtime_version.is_empty() {
            return Err(RefreshError::Metadata("ampRuntimeVersion is missing".to_string()));
        }
        if metadata.amp_css_url.is_empty() {
            return Err(RefreshError::Metadata("ampCssUrl is missing".to_string()));
        }
        let css_url = self
            .metadata_url
            .join(&metadata.amp_css_url)
            .map_err(|e| RefreshError::Metadata(format!("ampCssUrl {:?}: {}", metadata.amp_css_url, e)))?;

        if self.cache.current().version.as_deref() == Some(metadata.amp_runtime_version.as_str()) {
            return Ok(false);
        }

        let (_, css) = read_ok(self.client.get(css_url.clone()), css_url.as_str(), MAX_RUNTIME_BYTES).await?;
        let css = String::from_utf8(css)
            .map_err(|_| RefreshError::Metadata(format!("{} is not UTF-8", css_url)))?;
        info!("AMP runtime version is now {}", metadata.amp_runtime_version);
        self.cache.set(RuntimeInfo {
            version: Some(metadata.amp_runtime_version),
            css: Some(css),
        });
        Ok(true)
    }

    /// Polls every [`RUNTIME_POLL_INTERVAL`] until the task is dropped.
    pub async fn run(self: Arc<Self>) {
        loop {
            tokio::time::sleep(RUNTIME_POLL_INTERVAL).await;
            if let Err(e) = self.poll().await {
                warn!("Runtime metadata poll failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as TimeDelta;
    use sxgpkg_signer::testing::{
        generate_chain, ocsp_error_response, ocsp_response, ChainOptions, OcspStatus,
    };
    use sxgpkg_signer::{CertificateContext, HealthError, OcspError};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Reads request headers and any Content-Length body.
    async fn read_request(stream: &mut tokio::net::TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&data).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if data.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&data).to_string()
    }

    /// Answers one connection per canned response, recording request lines.
    fn serve(listener: TcpListener, responses: Vec<Vec<u8>>) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        tokio::spawn(async move {
            for response in responses {
                let (mut stream, _) = listener.accept().await.unwrap();
                let request = read_request(&mut stream).await;
                log.lock().push(request.lines().next().unwrap_or("").to_string());
                let _ = stream.write_all(&response).await;
                let _ = stream.shutdown().await;
            }
        });
        seen
    }

    fn http_response(status: &str, extra: &str, body: &[u8]) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n{}\r\n",
            status,
            body.len(),
            extra
        )
        .into_bytes();
        out.extend_from_slice(body);
        out
    }

    async fn bound() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        (listener, base)
    }

    fn responder_context(responder: &str) -> CertificateContext {
        generate_chain(&ChainOptions {
            ocsp_responder: Some(responder.to_string()),
            ..ChainOptions::around_now()
        })
        .context()
    }

    fn good_for(context: &CertificateContext) -> Vec<u8> {
        let now = Utc::now();
        ocsp_response(
            context,
            now - TimeDelta::hours(1),
            Some(now + TimeDelta::days(3)),
            OcspStatus::Good,
        )
    }

    fn refresher(context: CertificateContext) -> (OcspRefresher, Arc<CertificateStore>, Arc<CertChainCache>) {
        let certs = Arc::new(CertificateStore::new(context));
        let chains = Arc::new(CertChainCache::new());
        let refresher =
            tokio_test::assert_ok!(OcspRefresher::new(Arc::clone(&certs), Arc::clone(&chains)));
        (refresher, certs, chains)
    }

    // ==================== OCSP Refresh Tests ====================

    #[tokio::test]
    async fn staples_fetched_response() {
        let (listener, base) = bound().await;
        let context = responder_context(&base);
        let der = good_for(&context);
        let seen = serve(
            listener,
            vec![http_response("200 OK", "Cache-Control: max-age=600\r\n", &der)],
        );

        let (refresher, certs, chains) = refresher(context);
        let stale_chain = chains.get_or_insert(&certs.current()).unwrap();
        assert!(refresher.needs_refresh(Utc::now()));
        assert!(tokio_test::assert_ok!(refresher.refresh().await));

        let current = certs.current();
        assert_eq!(current.ocsp(), der.as_slice());
        assert!(current.health(Utc::now()).is_ok());
        let served = chains.get(current.cert_url_name()).unwrap();
        assert!(!Arc::ptr_eq(&served, &stale_chain));
        assert_eq!(*served, sxgpkg_signer::cert_chain_cbor(&current).unwrap());

        assert!(seen.lock()[0].starts_with("GET /M"));
        assert!(!refresher.needs_refresh(Utc::now()));
        assert!(refresher.needs_refresh(Utc::now() + TimeDelta::seconds(601)));
        assert!(!tokio_test::assert_ok!(refresher.refresh().await));
    }

    #[tokio::test]
    async fn long_requests_are_posted() {
        let (listener, base) = bound().await;
        let responder = format!("{}/{}", base, "ocsp".repeat(60));
        let context = responder_context(&responder);
        let der = good_for(&context);
        let seen = serve(listener, vec![http_response("200 OK", "", &der)]);

        let (refresher, certs, _) = refresher(context);
        assert!(tokio_test::assert_ok!(refresher.refresh().await));
        assert!(certs.current().health(Utc::now()).is_ok());
        assert!(seen.lock()[0].starts_with("POST /ocspocsp"));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_current_response() {
        let (listener, base) = bound().await;
        let context = responder_context(&base);
        let now = Utc::now();
        // Past its midpoint, so a refresh is due, but still valid.
        let aging = ocsp_response(
            &context,
            now - TimeDelta::days(2),
            Some(now + TimeDelta::days(1)),
            OcspStatus::Good,
        );
        let context = context.with_ocsp(aging.clone());
        serve(
            listener,
            vec![
                http_response("500 Internal Server Error", "", b""),
                http_response("200 OK", "", &ocsp_error_response(3)),
            ],
        );

        let (refresher, certs, _) = refresher(context);
        assert!(refresher.needs_refresh(now));
        assert!(matches!(
            refresher.refresh().await,
            Err(RefreshError::Status { status: 500, .. })
        ));
        assert!(matches!(
            refresher.refresh().await,
            Err(RefreshError::Ocsp(OcspError::ResponderStatus(3)))
        ));
        assert_eq!(certs.current().ocsp(), aging.as_slice());
        assert!(certs.current().health(Utc::now()).is_ok());
    }

    #[tokio::test]
    async fn refresh_without_responder_fails() {
        let context = generate_chain(&ChainOptions::around_now()).context();
        let (refresher, certs, _) = refresher(context);
        assert!(matches!(
            refresher.refresh().await,
            Err(RefreshError::Ocsp(OcspError::NoResponder))
        ));
        assert_eq!(
            certs.current().health(Utc::now()),
            Err(HealthError::Ocsp(OcspError::Missing))
        );
    }

    // ==================== Runtime Poll Tests ====================

    fn metadata(version: &str, css_path: &str) -> Vec<u8> {
        let body = format!(
            r#"{{"ampRuntimeVersion":"{}","ampCssUrl":"{}","canaryPercentage":"0.005"}}"#,
            version, css_path
        );
        http_response("200 OK", "Content-Type: application/json\r\n", body.as_bytes())
    }

    #[tokio::test]
    async fn poll_fetches_css_for_new_version() {
        let (listener, base) = bound().await;
        let seen = serve(
            listener,
            vec![
                metadata("012345678901234", "/rtv/012345678901234/v0.css"),
                http_response("200 OK", "", b"html{color:red}"),
                metadata("012345678901234", "/rtv/012345678901234/v0.css"),
            ],
        );
        let cache = Arc::new(RuntimeCache::default());
        let url = Url::parse(&format!("{}/rtv/metadata", base)).unwrap();
        let poller = tokio_test::assert_ok!(RuntimePoller::new(url, Arc::clone(&cache)));

        assert!(tokio_test::assert_ok!(poller.poll().await));
        assert_eq!(
            *cache.current(),
            RuntimeInfo {
                version: Some("012345678901234".to_string()),
                css: Some("html{color:red}".to_string()),
            }
        );
        assert!(!tokio_test::assert_ok!(poller.poll().await));
        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert!(seen[1].starts_with("GET /rtv/012345678901234/v0.css"));
    }

    #[tokio::test]
    async fn poll_rejects_incomplete_metadata() {
        let (listener, base) = bound().await;
        serve(
            listener,
            vec![http_response("200 OK", "", br#"{"ampCssUrl":"/v0.css"}"#)],
        );
        let cache = Arc::new(RuntimeCache::new(RuntimeInfo {
            version: Some("static".to_string()),
            css: None,
        }));
        let url = Url::parse(&format!("{}/rtv/metadata", base)).unwrap();
        let poller = tokio_test::assert_ok!(RuntimePoller::new(url, Arc::clone(&cache)));

        assert!(matches!(poller.poll().await, Err(RefreshError::Metadata(_))));
        assert_eq!(cache.current().version.as_deref(), Some("static"));
    }
}
