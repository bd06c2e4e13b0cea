//! Header classification rules shared by the orchestrator.
//!
//! These helpers work on header names and values as strings so they can be
//! applied to any HTTP header map.

/// Headers that describe a single connection and are never forwarded.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Headers that carry per-user state and must not appear in a signed exchange.
pub const STATEFUL: &[&str] = &[
    "authentication-control",
    "authentication-info",
    "clear-site-data",
    "optional-www-authenticate",
    "proxy-authenticate",
    "proxy-authentication-info",
    "public-key-pins",
    "sec-websocket-accept",
    "set-cookie",
    "set-cookie2",
    "setprofile",
    "strict-transport-security",
    "www-authenticate",
];

/// Conditional request headers forwarded to the origin.
pub const CONDITIONAL_REQUEST: &[&str] = &[
    "if-match",
    "if-modified-since",
    "if-none-match",
    "if-range",
    "if-unmodified-since",
];

/// Headers copied through on a `304 Not Modified`.
pub const NOT_MODIFIED_PASSTHROUGH: &[&str] = &[
    "cache-control",
    "content-location",
    "date",
    "etag",
    "expires",
    "vary",
];

fn contains(list: &[&str], name: &str) -> bool {
    list.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Returns true for connection-scoped headers.
pub fn is_hop_by_hop(name: &str) -> bool {
    contains(HOP_BY_HOP, name)
}

/// Returns true for headers that carry user state.
pub fn is_stateful(name: &str) -> bool {
    contains(STATEFUL, name)
}

/// Returns true for conditional request headers.
pub fn is_conditional(name: &str) -> bool {
    contains(CONDITIONAL_REQUEST, name)
}

/// Header names listed in a `Connection` value, lowercased.
pub fn connection_tokens(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Returns why a response may not be shared by a cache, or `None` if it may.
pub fn uncacheable_reason(cache_control: Option<&str>, vary: Option<&str>) -> Option<String> {
    if let Some(cc) = cache_control {
        for directive in cc.split(',') {
            let name = directive
                .split('=')
                .next()
                .unwrap_or("")
                .trim()
                .to_ascii_lowercase();
            if matches!(name.as_str(), "no-store" | "private" | "no-cache") {
                return Some(format!("Cache-Control: {}", name));
            }
        }
    }
    if let Some(vary) = vary {
        if vary.split(',').any(|v| v.trim() == "*") {
            return Some("Vary: *".to_string());
        }
    }
    None
}

/// The `max-age` directive of a Cache-Control value, in seconds.
pub fn max_age(cache_control: &str) -> Option<u64> {
    cache_control.split(',').find_map(|directive| {
        let (name, value) = directive.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("max-age") {
            return None;
        }
        value.trim().trim_matches('"').parse().ok()
    })
}

/// A parsed `Content-Type` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaType {
    /// Lowercased `type/subtype`.
    pub essence: String,
    /// Lowercased charset parameter, unquoted.
    pub charset: Option<String>,
}

impl MediaType {
    /// Parses a media type, returning `None` when there is no `/`.
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split(';');
        let essence = parts.next()?.trim().to_ascii_lowercase();
        if !essence.contains('/') {
            return None;
        }
        let charset = parts.find_map(|p| {
            let (name, val) = p.split_once('=')?;
            name.trim()
                .eq_ignore_ascii_case("charset")
                .then(|| val.trim().trim_matches('"').to_ascii_lowercase())
        });
        Some(Self { essence, charset })
    }

    /// True for `text/html` with no charset or a UTF-8 charset.
    pub fn is_utf8_html(&self) -> bool {
        self.essence == "text/html"
            && self
                .charset
                .as_deref()
                .map_or(true, |c| c == "utf-8" || c == "utf8")
    }
}
