//! The `application/signed-exchange;v=b3` format.
//!
//! ```text
//! "sxg1-b3\0"
//! u16   fallback URL length, URL
//! u24   signature header length
//! u24   response headers length
//! signature header, CBOR response headers, mi-sha256-03 payload
//! ```

use base64::Engine;
use ciborium::Value;
use once_cell::sync::Lazy;
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use regex::Regex;
use url::Url;

use crate::error::{ExchangeError, SigningError};
use crate::mi;

/// Envelope magic.
pub const MAGIC: &[u8; 8] = b"sxg1-b3\0";

/// Value of the `integrity` signature parameter.
pub const INTEGRITY: &str = "digest/mi-sha256-03";

const CONTEXT_STRING: &[u8] = b"HTTP Exchange 1 b3";
const MAX_URL_LEN: usize = 8 * 1024 - 1;
const MAX_SIGNATURE_LEN: usize = 16 * 1024;
const MAX_HEADERS_LEN: usize = 512 * 1024;

static CERT_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"; cert-url=(".*"); cert-sha256=\*"#).expect("Invalid regex pattern")
});

fn b64() -> base64::engine::GeneralPurpose {
    base64::engine::general_purpose::STANDARD
}

// ============================================================================
// Exchange
// ============================================================================

/// A response prepared for signing: headers plus the encoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub request_url: String,
    pub status: u16,
    /// Lowercased, deduplicated header names.
    pub headers: Vec<(String, String)>,
    /// The mi-sha256-03 encoded payload.
    pub payload: Vec<u8>,
}

impl Exchange {
    /// Builds an exchange, encoding `body` and adding the integrity headers.
    ///
    /// Repeated header names are joined with `", "`.
    pub fn new(
        request_url: impl Into<String>,
        status: u16,
        headers: impl IntoIterator<Item = (String, String)>,
        body: &[u8],
    ) -> Self {
        let mut merged: Vec<(String, String)> = Vec::new();
        for (name, value) in headers {
            let name = name.to_ascii_lowercase();
            if name == "content-encoding" || name == "digest" {
                continue;
            }
            match merged.iter_mut().find(|(n, _)| *n == name) {
                Some((_, existing)) => {
                    existing.push_str(", ");
                    existing.push_str(&value);
                }
                None => merged.push((name, value)),
            }
        }

        let encoded = mi::encode(body, mi::RECORD_SIZE);
        merged.push(("content-encoding".to_string(), mi::ENCODING.to_string()));
        merged.push(("digest".to_string(), encoded.digest_header()));

        Self {
            request_url: request_url.into(),
            status,
            headers: merged,
            payload: encoded.body,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Canonical CBOR map of `:status` and the response headers.
    pub fn headers_cbor(&self) -> Result<Vec<u8>, SigningError> {
        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(self.headers.len() + 1);
        entries.push((b":status".to_vec(), self.status.to_string().into_bytes()));
        for (name, value) in &self.headers {
            entries.push((name.as_bytes().to_vec(), value.as_bytes().to_vec()));
        }
        // Canonical CBOR: shorter keys first, then bytewise.
        entries.sort_by(|a, b| a.0.len().cmp(&b.0.len()).then_with(|| a.0.cmp(&b.0)));

        let map = Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (Value::Bytes(k), Value::Bytes(v)))
                .collect(),
        );
        let mut out = Vec::new();
        ciborium::into_writer(&map, &mut out).map_err(|e| SigningError::Cbor(e.to_string()))?;
        Ok(out)
    }

    /// Decodes the payload, checking it against the `digest` header.
    pub fn decoded_payload(&self) -> Result<Vec<u8>, ExchangeError> {
        let digest_header = self
            .header("digest")
            .ok_or_else(|| ExchangeError::Integrity("missing digest header".to_string()))?;
        let encoded = digest_header
            .strip_prefix(mi::ENCODING)
            .and_then(|rest| rest.strip_prefix('='))
            .ok_or_else(|| ExchangeError::Integrity("unsupported digest".to_string()))?;
        let digest: [u8; 32] = b64()
            .decode(encoded)
            .ok()
            .and_then(|d| d.try_into().ok())
            .ok_or_else(|| ExchangeError::Integrity("malformed digest".to_string()))?;
        mi::decode(&self.payload, &digest)
    }

    /// Serializes the envelope around a finished signature header.
    pub fn encode(&self, signature: &SignatureHeader) -> Result<Vec<u8>, SigningError> {
        let headers = self.headers_cbor()?;
        let signature = signature.to_string();
        let url = self.request_url.as_bytes();

        if url.len() > MAX_URL_LEN {
            return Err(SigningError::TooLarge("fallback URL"));
        }
        if signature.len() > MAX_SIGNATURE_LEN {
            return Err(SigningError::TooLarge("signature header"));
        }
        if headers.len() > MAX_HEADERS_LEN {
            return Err(SigningError::TooLarge("response headers"));
        }

        let mut out = Vec::with_capacity(
            MAGIC.len() + 2 + url.len() + 6 + signature.len() + headers.len() + self.payload.len(),
        );
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&(url.len() as u16).to_be_bytes());
        out.extend_from_slice(url);
        out.extend_from_slice(&u24(signature.len()));
        out.extend_from_slice(&u24(headers.len()));
        out.extend_from_slice(signature.as_bytes());
        out.extend_from_slice(&headers);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }
}

fn u24(n: usize) -> [u8; 3] {
    let b = (n as u32).to_be_bytes();
    [b[1], b[2], b[3]]
}

/// The byte string the ECDSA signature covers.
pub fn signed_message(
    signature: &SignatureHeader,
    request_url: &str,
    headers_cbor: &[u8],
) -> Vec<u8> {
    let mut msg = Vec::with_capacity(
        64 + CONTEXT_STRING.len()
            + 1
            + 1
            + signature.cert_sha256.len()
            + 8 * 5
            + signature.validity_url.len()
            + request_url.len()
            + headers_cbor.len(),
    );
    msg.extend_from_slice(&[0x20; 64]);
    msg.extend_from_slice(CONTEXT_STRING);
    msg.push(0);
    msg.push(signature.cert_sha256.len() as u8);
    msg.extend_from_slice(&signature.cert_sha256);
    msg.extend_from_slice(&(signature.validity_url.len() as u64).to_be_bytes());
    msg.extend_from_slice(signature.validity_url.as_bytes());
    msg.extend_from_slice(&signature.date.to_be_bytes());
    msg.extend_from_slice(&signature.expires.to_be_bytes());
    msg.extend_from_slice(&(request_url.len() as u64).to_be_bytes());
    msg.extend_from_slice(request_url.as_bytes());
    msg.extend_from_slice(&(headers_cbor.len() as u64).to_be_bytes());
    msg.extend_from_slice(headers_cbor);
    msg
}

// ============================================================================
// Signature header
// ============================================================================

/// One entry of the `Signature` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub label: String,
    pub sig: Vec<u8>,
    pub integrity: String,
    pub validity_url: String,
    pub cert_url: String,
    pub cert_sha256: Vec<u8>,
    /// Seconds since the epoch.
    pub date: u64,
    pub expires: u64,
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

impl std::fmt::Display for SignatureHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}; sig=*{}*; validity-url={}; integrity={}; cert-url={}; cert-sha256=*{}*; date={}; expires={}",
            self.label,
            b64().encode(&self.sig),
            quote(&self.validity_url),
            quote(&self.integrity),
            quote(&self.cert_url),
            b64().encode(&self.cert_sha256),
            self.date,
            self.expires
        )
    }
}

enum Param {
    Bytes(Vec<u8>),
    Str(String),
    Int(u64),
}

struct Cursor<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(' ') | Some('\t')) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, want: char) -> Result<(), ExchangeError> {
        match self.bump() {
            Some(c) if c == want => Ok(()),
            other => Err(ExchangeError::SignatureHeader(format!(
                "expected {:?} at {}, found {:?}",
                want, self.pos, other
            ))),
        }
    }

    fn token(&mut self) -> Result<&'a str, ExchangeError> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '*' | '/'))
        {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(ExchangeError::SignatureHeader(format!(
                "expected token at {}",
                start
            )));
        }
        Ok(&self.input[start..self.pos])
    }

    fn value(&mut self) -> Result<Param, ExchangeError> {
        match self.peek() {
            Some('*') => {
                self.bump();
                let start = self.pos;
                while let Some(c) = self.peek() {
                    if c == '*' {
                        break;
                    }
                    // Base64 alphabet is ASCII; anything else cannot decode
                    if !c.is_ascii() {
                        return Err(ExchangeError::SignatureHeader(format!(
                            "non-ASCII {:?} in byte sequence at {}",
                            c, self.pos
                        )));
                    }
                    self.pos += 1;
                }
                let raw = &self.input[start..self.pos];
                self.expect('*')?;
                b64()
                    .decode(raw)
                    .map(Param::Bytes)
                    .map_err(|e| ExchangeError::SignatureHeader(e.to_string()))
            }
            Some('"') => {
                self.bump();
                let mut out = String::new();
                loop {
                    match self.bump() {
                        Some('"') => return Ok(Param::Str(out)),
                        Some('\\') => match self.bump() {
                            Some(c) => out.push(c),
                            None => break,
                        },
                        Some(c) => out.push(c),
                        None => break,
                    }
                }
                Err(ExchangeError::SignatureHeader("unterminated string".to_string()))
            }
            Some(c) if c.is_ascii_digit() => {
                let start = self.pos;
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
                self.input[start..self.pos]
                    .parse()
                    .map(Param::Int)
                    .map_err(|e: std::num::ParseIntError| {
                        ExchangeError::SignatureHeader(e.to_string())
                    })
            }
            other => Err(ExchangeError::SignatureHeader(format!(
                "unexpected {:?} at {}",
                other, self.pos
            ))),
        }
    }
}

impl SignatureHeader {
    /// Parses a single-entry `Signature` header.
    pub fn parse(input: &str) -> Result<Self, ExchangeError> {
        let mut cur = Cursor { input, pos: 0 };
        cur.skip_ws();
        let label = cur.token()?.to_string();

        let mut sig = None;
        let mut integrity = None;
        let mut validity_url = None;
        let mut cert_url = None;
        let mut cert_sha256 = None;
        let mut date = None;
        let mut expires = None;

        loop {
            cur.skip_ws();
            match cur.peek() {
                None => break,
                Some(',') => {
                    return Err(ExchangeError::SignatureHeader(
                        "multiple signatures are not supported".to_string(),
                    ))
                }
                _ => cur.expect(';')?,
            }
            cur.skip_ws();
            let key = cur.token()?;
            cur.expect('=')?;
            let value = cur.value()?;
            match (key, value) {
                ("sig", Param::Bytes(b)) => sig = Some(b),
                ("integrity", Param::Str(s)) => integrity = Some(s),
                ("validity-url", Param::Str(s)) => validity_url = Some(s),
                ("cert-url", Param::Str(s)) => cert_url = Some(s),
                ("cert-sha256", Param::Bytes(b)) => cert_sha256 = Some(b),
                ("date", Param::Int(n)) => date = Some(n),
                ("expires", Param::Int(n)) => expires = Some(n),
                (key, _) => {
                    return Err(ExchangeError::SignatureHeader(format!(
                        "unexpected parameter {:?}",
                        key
                    )))
                }
            }
        }

        fn required<T>(v: Option<T>, name: &str) -> Result<T, ExchangeError> {
            v.ok_or_else(|| ExchangeError::SignatureHeader(format!("missing {}", name)))
        }
        Ok(Self {
            label,
            sig: required(sig, "sig")?,
            integrity: required(integrity, "integrity")?,
            validity_url: required(validity_url, "validity-url")?,
            cert_url: required(cert_url, "cert-url")?,
            cert_sha256: required(cert_sha256, "cert-sha256")?,
            date: required(date, "date")?,
            expires: required(expires, "expires")?,
        })
    }
}

/// Pulls the cert URL out of a serialized signature header.
pub fn cert_url_from_signature(signature: &str) -> Option<String> {
    let quoted = CERT_URL.captures(signature)?.get(1)?.as_str();
    let inner = quoted.strip_prefix('"')?.strip_suffix('"')?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            out.push(chars.next()?);
        } else {
            out.push(c);
        }
    }
    Some(out)
}

// ============================================================================
// Parsing
// ============================================================================

/// A parsed envelope.
#[derive(Debug, Clone)]
pub struct SignedExchange {
    pub exchange: Exchange,
    pub signature: SignatureHeader,
    /// The signature header exactly as it appeared on the wire.
    pub signature_value: String,
    headers_cbor: Vec<u8>,
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], ExchangeError> {
        if self.buf.len() < n {
            return Err(ExchangeError::Truncated(what));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn length(&mut self, width: usize, what: &'static str) -> Result<usize, ExchangeError> {
        Ok(self
            .take(width, what)?
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize))
    }
}

fn parse_headers(bytes: &[u8]) -> Result<(u16, Vec<(String, String)>), ExchangeError> {
    let value: Value =
        ciborium::from_reader(bytes).map_err(|e| ExchangeError::Headers(e.to_string()))?;
    let Value::Map(entries) = value else {
        return Err(ExchangeError::Headers("not a map".to_string()));
    };

    let mut status = None;
    let mut headers = Vec::with_capacity(entries.len());
    for (k, v) in entries {
        let (Value::Bytes(k), Value::Bytes(v)) = (k, v) else {
            return Err(ExchangeError::Headers("entries must be byte strings".to_string()));
        };
        let k = String::from_utf8(k).map_err(|e| ExchangeError::Headers(e.to_string()))?;
        let v = String::from_utf8(v).map_err(|e| ExchangeError::Headers(e.to_string()))?;
        if k == ":status" {
            status = Some(
                v.parse::<u16>()
                    .map_err(|_| ExchangeError::Headers(format!("bad status {:?}", v)))?,
            );
        } else {
            headers.push((k, v));
        }
    }
    let status = status.ok_or_else(|| ExchangeError::Headers("missing :status".to_string()))?;
    Ok((status, headers))
}

impl SignedExchange {
    /// Parses an envelope and checks payload integrity.
    ///
    /// The signature itself is checked by [`SignedExchange::verify`].
    pub fn parse(bytes: &[u8]) -> Result<Self, ExchangeError> {
        let mut r = Reader { buf: bytes };
        if r.take(MAGIC.len(), "magic")? != MAGIC {
            return Err(ExchangeError::BadMagic);
        }
        let url_len = r.length(2, "fallback URL length")?;
        let url = std::str::from_utf8(r.take(url_len, "fallback URL")?)
            .map_err(|e| ExchangeError::Headers(e.to_string()))?
            .to_string();
        let sig_len = r.length(3, "signature length")?;
        let headers_len = r.length(3, "headers length")?;
        let signature_value = std::str::from_utf8(r.take(sig_len, "signature header")?)
            .map_err(|e| ExchangeError::SignatureHeader(e.to_string()))?
            .to_string();
        let headers_cbor = r.take(headers_len, "response headers")?.to_vec();
        let payload = r.buf.to_vec();

        let signature = SignatureHeader::parse(&signature_value)?;
        let (status, headers) = parse_headers(&headers_cbor)?;
        let exchange = Exchange {
            request_url: url,
            status,
            headers,
            payload,
        };
        let canonical = exchange
            .headers_cbor()
            .map_err(|e| ExchangeError::Headers(e.to_string()))?;
        if canonical != headers_cbor {
            return Err(ExchangeError::Headers("headers are not canonical".to_string()));
        }
        exchange.decoded_payload()?;

        Ok(Self {
            exchange,
            signature,
            signature_value,
            headers_cbor,
        })
    }

    /// Checks the ECDSA signature against `key`.
    pub fn verify(&self, key: &VerifyingKey) -> Result<(), ExchangeError> {
        let message = signed_message(&self.signature, &self.exchange.request_url, &self.headers_cbor);
        let sig = Signature::from_der(&self.signature.sig).map_err(|_| ExchangeError::BadSignature)?;
        key.verify(&message, &sig)
            .map_err(|_| ExchangeError::BadSignature)
    }

    /// The decoded response body.
    pub fn payload(&self) -> Result<Vec<u8>, ExchangeError> {
        self.exchange.decoded_payload()
    }

    pub fn cert_url(&self) -> Option<String> {
        cert_url_from_signature(&self.signature_value)
    }
}

/// Parses an exchange and returns the URL its certificate chain is served at.
pub fn extract_cert_url(exchange: &[u8]) -> Result<Url, ExchangeError> {
    let parsed = SignedExchange::parse(exchange)?;
    let raw = parsed
        .cert_url()
        .ok_or_else(|| ExchangeError::SignatureHeader("no cert-url".to_string()))?;
    Url::parse(&raw).map_err(|e| ExchangeError::SignatureHeader(format!("cert-url: {}", e)))
}
