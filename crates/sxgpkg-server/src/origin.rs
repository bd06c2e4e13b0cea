//! Fetching documents from the origin.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use crate::error::OriginFailure;

/// User-Agent sent to origins. AMP servers key content negotiation off a
/// mobile Chrome UA.
pub const USER_AGENT: &str = concat!(
    "Mozilla/5.0 (Linux; Android 6.0.1; Nexus 5X Build/MMB29P) ",
    "AppleWebKit/537.36 (KHTML, like Gecko) ",
    "Chrome/41.0.2272.96 Mobile Safari/537.36 ",
    "(compatible; sxgpkg/",
    env!("CARGO_PKG_VERSION"),
    "; +https://github.com/sxgpkg/sxgpkg)"
);

/// A GET to the origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginRequest {
    pub url: Url,
    pub headers: Vec<(String, String)>,
}

/// A fully buffered origin response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginResponse {
    pub status: u16,
    /// Header names are lowercase.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl OriginResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .push((name.to_ascii_lowercase(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Performs origin fetches.
#[async_trait]
pub trait OriginClient: Send + Sync {
    async fn fetch(&self, request: OriginRequest) -> Result<OriginResponse, OriginFailure>;
}

/// Maps an authorized fetch URL to the URL actually requested.
pub trait OriginResolver: Send + Sync {
    fn resolve(&self, fetch_url: &Url) -> Url;
}

/// Fetches the authorized URL as is.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectResolver;

impl OriginResolver for DirectResolver {
    fn resolve(&self, fetch_url: &Url) -> Url {
        fetch_url.clone()
    }
}

/// Sends every fetch to one base URL, keeping path and query.
///
/// Used to point the packager at a local or staging backend.
#[derive(Debug, Clone)]
pub struct BaseUrlOverride {
    base: Url,
}

impl BaseUrlOverride {
    pub fn new(base: Url) -> Self {
        Self { base }
    }
}

impl OriginResolver for BaseUrlOverride {
    fn resolve(&self, fetch_url: &Url) -> Url {
        let mut url = self.base.clone();
        url.set_path(fetch_url.path());
        url.set_query(fetch_url.query());
        url
    }
}

// ===== HTTP client =====

/// reqwest-backed [`OriginClient`]. Redirects are not followed.
#[derive(Debug, Clone)]
pub struct HttpOriginClient {
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl HttpOriginClient {
    pub fn new(timeout: Duration, max_body_bytes: usize) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            max_body_bytes,
        })
    }
}

fn request_failure(url: &Url, e: reqwest::Error) -> OriginFailure {
    if e.is_timeout() {
        OriginFailure::Timeout {
            url: url.to_string(),
        }
    } else {
        OriginFailure::Request {
            url: url.to_string(),
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl OriginClient for HttpOriginClient {
    async fn fetch(&self, request: OriginRequest) -> Result<OriginResponse, OriginFailure> {
        debug!("Fetching {}", request.url);
        let mut builder = self.client.get(request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let mut response = builder
            .send()
            .await
            .map_err(|e| request_failure(&request.url, e))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| request_failure(&request.url, e))?
        {
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(OriginFailure::TooLarge {
                    url: request.url.to_string(),
                    limit: self.max_body_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(OriginResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_resolver_is_identity() {
        let url = Url::parse("https://example.com/a?b=c").unwrap();
        assert_eq!(DirectResolver.resolve(&url), url);
    }

    #[test]
    fn base_override_keeps_path_and_query() {
        let resolver = BaseUrlOverride::new(Url::parse("http://127.0.0.1:9000").unwrap());
        let url = Url::parse("https://example.com/news/a.html?x=1").unwrap();
        assert_eq!(
            resolver.resolve(&url).as_str(),
            "http://127.0.0.1:9000/news/a.html?x=1"
        );
    }

    #[test]
    fn response_header_lookup_ignores_case() {
        let response = OriginResponse::new(200).with_header("Content-Type", "text/html");
        assert_eq!(response.header("content-type"), Some("text/html"));
        assert_eq!(response.header("CONTENT-TYPE"), Some("text/html"));
        assert_eq!(response.header("etag"), None);
    }

    #[test]
    fn user_agent_names_the_packager() {
        assert!(USER_AGENT.contains("(compatible; sxgpkg/"));
        assert!(USER_AGENT.starts_with("Mozilla/5.0"));
    }

    // ==================== HTTP Client Tests ====================

    /// Serves one canned HTTP response on a local port.
    async fn serve_once(response: &'static [u8]) -> Url {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(response).await;
            let _ = stream.shutdown().await;
        });
        Url::parse(&format!("http://{}/doc.html", addr)).unwrap()
    }

    fn get(url: Url) -> OriginRequest {
        OriginRequest {
            url,
            headers: Vec::new(),
        }
    }

    fn client(max_body_bytes: usize) -> HttpOriginClient {
        tokio_test::assert_ok!(HttpOriginClient::new(
            Duration::from_secs(5),
            max_body_bytes
        ))
    }

    #[tokio::test]
    async fn fetch_reads_status_headers_and_body() {
        let url = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
        )
        .await;
        let response = tokio_test::assert_ok!(client(1024).fetch(get(url)).await);
        assert_eq!(response.status, 200);
        assert_eq!(response.header("content-type"), Some("text/html"));
        assert_eq!(response.body, b"hello");
    }

    #[tokio::test]
    async fn fetch_does_not_follow_redirects() {
        let url = serve_once(
            b"HTTP/1.1 301 Moved Permanently\r\nLocation: http://127.0.0.1:1/elsewhere\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let response = tokio_test::assert_ok!(client(1024).fetch(get(url)).await);
        assert_eq!(response.status, 301);
        assert_eq!(
            response.header("location"),
            Some("http://127.0.0.1:1/elsewhere")
        );
    }

    #[tokio::test]
    async fn fetch_caps_body_size() {
        let url = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 16\r\nConnection: close\r\n\r\n0123456789abcdef",
        )
        .await;
        let err = tokio_test::assert_err!(client(8).fetch(get(url)).await);
        assert!(matches!(err, OriginFailure::TooLarge { limit: 8, .. }));
    }

    #[tokio::test]
    async fn fetch_reports_connection_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = Url::parse(&format!("http://{}/", addr)).unwrap();
        let err = tokio_test::assert_err!(client(1024).fetch(get(url)).await);
        assert!(matches!(err, OriginFailure::Request { .. }));
    }
}
