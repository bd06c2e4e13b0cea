//! URL pattern matching for sign and fetch authorization.
//!
//! A configuration is an ordered list of [`UrlSet`]s. Each set has a sign
//! pattern (URLs we may produce signed exchanges for) and an optional fetch
//! pattern (URLs we may retrieve content from). The first set that matches
//! wins; there is no notion of a "more specific" rule.

use regex::Regex;
use tracing::debug;
use url::{Host, Url};

use crate::config::{UrlPatternConfig, UrlSetConfig};
use crate::error::{ConfigError, PolicyRejection};

/// Default cap on the serialized URL length.
pub const DEFAULT_MAX_LENGTH: usize = 2000;

// ===== Candidate URLs =====

/// A parsed, normalized URL ready to be matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateUrl {
    url: Url,
    authority: String,
    path: String,
    query: String,
}

impl CandidateUrl {
    /// Parses an absolute http(s) URL.
    ///
    /// Dot segments are resolved, the fragment is dropped, and percent-escapes
    /// in the path are normalized so `/%61b` and `/ab` compare equal.
    pub fn parse(input: &str) -> Result<Self, PolicyRejection> {
        let mut url = Url::parse(input).map_err(|e| PolicyRejection::Unparseable {
            url: input.to_string(),
            reason: e.to_string(),
        })?;

        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(PolicyRejection::UnsupportedScheme {
                    scheme: other.to_string(),
                })
            }
        }
        if url.cannot_be_a_base() {
            return Err(PolicyRejection::Unparseable {
                url: input.to_string(),
                reason: "opaque URL".to_string(),
            });
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(PolicyRejection::UserInfo);
        }

        let host = url
            .host_str()
            .ok_or_else(|| PolicyRejection::Unparseable {
                url: input.to_string(),
                reason: "missing host".to_string(),
            })?
            .to_ascii_lowercase();
        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host,
        };

        let path = normalize_percent_encoding(url.path());
        url.set_path(&path);
        url.set_fragment(None);
        let query = url.query().unwrap_or("").to_string();

        Ok(Self {
            url,
            authority,
            path,
            query,
        })
    }

    /// The normalized URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Host, plus `:port` when the port is not the scheme default.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Normalized path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw query string, empty when absent.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Length of the serialized URL.
    pub fn len(&self) -> usize {
        self.url.as_str().len()
    }

    /// Always false; a parsed URL has at least a scheme.
    pub fn is_empty(&self) -> bool {
        self.url.as_str().is_empty()
    }
}

/// Decodes percent-escapes of unreserved characters and uppercases the rest.
fn normalize_percent_encoding(path: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";

    let bytes = path.as_bytes();
    let mut out = String::with_capacity(path.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = bytes.get(i + 1).and_then(|b| hex_value(*b));
            let lo = bytes.get(i + 2).and_then(|b| hex_value(*b));
            if let (Some(hi), Some(lo)) = (hi, lo) {
                let decoded = (hi << 4) | lo;
                if is_unreserved(decoded) {
                    out.push(decoded as char);
                } else {
                    out.push('%');
                    out.push(HEX[hi as usize] as char);
                    out.push(HEX[lo as usize] as char);
                }
                i += 3;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
}

// ===== Patterns =====

/// Whether a pattern authorizes signing or fetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternRole {
    Sign,
    Fetch,
}

impl PatternRole {
    fn default_schemes(self) -> Vec<String> {
        match self {
            PatternRole::Sign => vec!["https".to_string()],
            PatternRole::Fetch => vec!["http".to_string(), "https".to_string()],
        }
    }

    fn allows_scheme(self, scheme: &str) -> bool {
        match self {
            PatternRole::Sign => scheme == "https",
            PatternRole::Fetch => scheme == "https" || scheme == "http",
        }
    }
}

#[derive(Debug, Clone)]
enum HostRule {
    Exact(String),
    Pattern(Regex),
}

impl HostRule {
    fn matches(&self, authority: &str) -> bool {
        match self {
            HostRule::Exact(domain) => domain == authority,
            HostRule::Pattern(re) => re.is_match(authority),
        }
    }
}

/// A compiled URL pattern.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    role: PatternRole,
    schemes: Vec<String>,
    host: HostRule,
    path: Regex,
    path_excludes: Vec<Regex>,
    query: Regex,
    max_length: usize,
    same_origin: bool,
    source_origin_override: Option<String>,
    same_path: bool,
    error_on_stateful_headers: bool,
}

fn full_match(field: &str, pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(&format!(r"\A(?:{})\z", pattern)).map_err(|source| ConfigError::Regex {
        field: field.to_string(),
        pattern: pattern.to_string(),
        source,
    })
}

/// Canonical `host[:port]` for a configured domain, in the form
/// [`CandidateUrl`] produces (punycode, lowercase).
fn exact_authority(domain: &str) -> Result<String, url::ParseError> {
    let (host, port) = match domain.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            (host, Some(port))
        }
        _ => (domain, None),
    };
    let host = Host::parse(host)?.to_string();
    Ok(match port {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    })
}

impl UrlPattern {
    /// Compiles a pattern, validating the fields allowed for its role.
    pub fn compile(
        config: &UrlPatternConfig,
        role: PatternRole,
        context: &str,
    ) -> Result<Self, ConfigError> {
        let invalid = |msg: &str| ConfigError::Invalid(format!("{}: {}", context, msg));

        let schemes: Vec<String> = if config.scheme.is_empty() {
            role.default_schemes()
        } else {
            config
                .scheme
                .iter()
                .map(|s| s.to_ascii_lowercase())
                .collect()
        };
        if let Some(bad) = schemes.iter().find(|s| !role.allows_scheme(s)) {
            return Err(invalid(&format!("scheme {:?} is not allowed", bad)));
        }

        let host = match (&config.domain, &config.domain_regexp) {
            (Some(domain), None) if !domain.trim().is_empty() => HostRule::Exact(
                exact_authority(domain.trim())
                    .map_err(|e| invalid(&format!("domain {:?}: {}", domain, e)))?,
            ),
            (None, Some(pattern)) if role == PatternRole::Fetch => HostRule::Pattern(full_match(
                &format!("{}.domain_regexp", context),
                pattern,
            )?),
            (None, Some(_)) => return Err(invalid("domain_regexp is only valid on fetch patterns")),
            (Some(_), Some(_)) => return Err(invalid("set only one of domain and domain_regexp")),
            _ => return Err(invalid("domain is required")),
        };

        match role {
            PatternRole::Sign => {
                if config.same_origin
                    || config.source_origin_override.is_some()
                    || config.same_path.is_some()
                {
                    return Err(invalid("origin and path pairing options belong on fetch patterns"));
                }
            }
            PatternRole::Fetch => {
                if config.error_on_stateful_headers {
                    return Err(invalid("error_on_stateful_headers belongs on sign patterns"));
                }
                if config.source_origin_override.is_some() && !config.same_origin {
                    return Err(invalid("source_origin_override requires same_origin"));
                }
            }
        }

        let path = full_match(
            &format!("{}.path_regexp", context),
            config.path_regexp.as_deref().unwrap_or(".*"),
        )?;
        let path_excludes = config
            .path_exclude_regexp
            .iter()
            .map(|p| full_match(&format!("{}.path_exclude_regexp", context), p))
            .collect::<Result<Vec<_>, _>>()?;
        let query = full_match(
            &format!("{}.query_regexp", context),
            config.query_regexp.as_deref().unwrap_or(""),
        )?;

        Ok(Self {
            role,
            schemes,
            host,
            path,
            path_excludes,
            query,
            max_length: config.max_length.unwrap_or(DEFAULT_MAX_LENGTH),
            same_origin: config.same_origin,
            source_origin_override: config
                .source_origin_override
                .as_ref()
                .map(|o| o.trim().to_ascii_lowercase()),
            same_path: config.same_path.unwrap_or(true),
            error_on_stateful_headers: config.error_on_stateful_headers,
        })
    }

    /// Returns the role this pattern was compiled for.
    pub fn role(&self) -> PatternRole {
        self.role
    }

    /// True if stateful origin headers should fail the request.
    pub fn error_on_stateful_headers(&self) -> bool {
        self.error_on_stateful_headers
    }

    /// Returns true if the candidate satisfies every clause of the pattern.
    pub fn matches(&self, candidate: &CandidateUrl) -> bool {
        candidate.len() <= self.max_length
            && self.schemes.iter().any(|s| s == candidate.url.scheme())
            && self.host.matches(&candidate.authority)
            && self.path.is_match(&candidate.path)
            && !self.path_excludes.iter().any(|re| re.is_match(&candidate.path))
            && self.query.is_match(&candidate.query)
    }

    /// Checks the pairing constraints of a fetch pattern against a sign URL.
    fn permits_pair(&self, fetch: &CandidateUrl, sign: &CandidateUrl) -> bool {
        if self.same_path && (fetch.path != sign.path || fetch.query != sign.query) {
            return false;
        }
        if self.same_origin {
            let overridden = self
                .source_origin_override
                .as_deref()
                .is_some_and(|o| o == fetch.authority);
            if fetch.authority != sign.authority && !overridden {
                return false;
            }
        }
        true
    }
}

// ===== Sets and Matcher =====

/// One entry of the policy: a sign pattern and an optional fetch pattern.
#[derive(Debug, Clone)]
pub struct UrlSet {
    pub sign: UrlPattern,
    pub fetch: Option<UrlPattern>,
}

/// Outcome of matching a single URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchDecision {
    /// The URL may be signed; index of the matching set.
    Sign(usize),
    /// The URL may only be proxied; index of the matching set.
    Fetch(usize),
    /// No set matched.
    Reject,
}

impl MatchDecision {
    /// Returns the matched URLSet index, if any.
    pub fn index(&self) -> Option<usize> {
        match self {
            MatchDecision::Sign(i) | MatchDecision::Fetch(i) => Some(*i),
            MatchDecision::Reject => None,
        }
    }

    /// Returns a short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            MatchDecision::Sign(_) => "sign",
            MatchDecision::Fetch(_) => "fetch",
            MatchDecision::Reject => "reject",
        }
    }
}

/// An approved request: what to fetch and under which URL to sign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    /// `Sign` or `Fetch`, never `Reject`.
    pub decision: MatchDecision,
    /// URL the exchange will be signed for.
    pub sign_url: Url,
    /// URL to retrieve from the origin.
    pub fetch_url: Url,
    /// Whether stateful origin headers must fail the request.
    pub error_on_stateful_headers: bool,
}

/// Ordered, first-match URL policy.
#[derive(Debug, Clone)]
pub struct UrlMatcher {
    sets: Vec<UrlSet>,
}

impl UrlMatcher {
    /// Compiles the configured URLSets.
    pub fn compile(configs: &[UrlSetConfig]) -> Result<Self, ConfigError> {
        if configs.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one url_set is required".to_string(),
            ));
        }
        let sets = configs
            .iter()
            .enumerate()
            .map(|(i, set)| {
                let sign =
                    UrlPattern::compile(&set.sign, PatternRole::Sign, &format!("url_set[{}].sign", i))?;
                let fetch = set
                    .fetch
                    .as_ref()
                    .map(|f| {
                        UrlPattern::compile(f, PatternRole::Fetch, &format!("url_set[{}].fetch", i))
                    })
                    .transpose()?;
                Ok(UrlSet { sign, fetch })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self { sets })
    }

    /// Returns the compiled sets.
    pub fn sets(&self) -> &[UrlSet] {
        &self.sets
    }

    /// Classifies a single URL. Pure: same input, same answer.
    pub fn classify(&self, url: &str) -> MatchDecision {
        match self.authorize(url, None) {
            Ok(auth) => auth.decision,
            Err(_) => MatchDecision::Reject,
        }
    }

    /// Authorizes a sign URL, optionally paired with an explicit fetch URL.
    ///
    /// Within each set the sign pattern is tried before the fetch pattern.
    /// An explicit fetch URL must match the same set's fetch pattern and its
    /// pairing rules; otherwise the search continues with the next set.
    pub fn authorize(
        &self,
        sign: &str,
        fetch: Option<&str>,
    ) -> Result<Authorization, PolicyRejection> {
        let sign_url = CandidateUrl::parse(sign)?;
        let fetch_url = fetch.map(CandidateUrl::parse).transpose()?;

        for (index, set) in self.sets.iter().enumerate() {
            if set.sign.matches(&sign_url) {
                match (&fetch_url, &set.fetch) {
                    (None, _) => {
                        return Ok(Authorization {
                            decision: MatchDecision::Sign(index),
                            sign_url: sign_url.url.clone(),
                            fetch_url: sign_url.url.clone(),
                            error_on_stateful_headers: set.sign.error_on_stateful_headers,
                        });
                    }
                    (Some(f), Some(pattern))
                        if pattern.matches(f) && pattern.permits_pair(f, &sign_url) =>
                    {
                        return Ok(Authorization {
                            decision: MatchDecision::Sign(index),
                            sign_url: sign_url.url.clone(),
                            fetch_url: f.url.clone(),
                            error_on_stateful_headers: set.sign.error_on_stateful_headers,
                        });
                    }
                    _ => {}
                }
            }

            if fetch_url.is_none() {
                if let Some(pattern) = &set.fetch {
                    if pattern.matches(&sign_url) {
                        return Ok(Authorization {
                            decision: MatchDecision::Fetch(index),
                            sign_url: sign_url.url.clone(),
                            fetch_url: sign_url.url.clone(),
                            error_on_stateful_headers: false,
                        });
                    }
                }
            }
        }

        debug!("No URLSet matched sign={} fetch={:?}", sign, fetch);
        Err(PolicyRejection::NoMatch {
            url: sign.to_string(),
        })
    }
}
