//! Just enough DER to build OCSP requests and walk OCSP responses.
//!
//! Only low-tag-number forms are handled; every structure OCSP uses fits.

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::OcspError;

pub(crate) const SEQUENCE: u8 = 0x30;
pub(crate) const INTEGER: u8 = 0x02;
#[cfg_attr(not(any(test, feature = "test-util")), allow(dead_code))]
pub(crate) const BIT_STRING: u8 = 0x03;
pub(crate) const OCTET_STRING: u8 = 0x04;
#[cfg_attr(not(test), allow(dead_code))]
pub(crate) const NULL: u8 = 0x05;
pub(crate) const OID: u8 = 0x06;
pub(crate) const ENUMERATED: u8 = 0x0a;
pub(crate) const GENERALIZED_TIME: u8 = 0x18;

/// Context-specific tag `[n]`, constructed.
pub(crate) const fn explicit(n: u8) -> u8 {
    0xa0 | n
}

/// Context-specific tag `[n]`, primitive.
pub(crate) const fn implicit(n: u8) -> u8 {
    0x80 | n
}

fn malformed(what: &str) -> OcspError {
    OcspError::Malformed(what.to_string())
}

// ===== Writer =====

/// Encodes one tag-length-value.
pub(crate) fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 6);
    out.push(tag);
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
    out.extend_from_slice(content);
    out
}

/// SEQUENCE over already-encoded parts.
pub(crate) fn sequence(parts: &[&[u8]]) -> Vec<u8> {
    tlv(SEQUENCE, &parts.concat())
}

#[cfg_attr(not(any(test, feature = "test-util")), allow(dead_code))]
pub(crate) fn generalized_time(at: DateTime<Utc>) -> Vec<u8> {
    tlv(
        GENERALIZED_TIME,
        at.format("%Y%m%d%H%M%SZ").to_string().as_bytes(),
    )
}

// ===== Reader =====

/// Cursor over a run of DER elements.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub(crate) fn peek_tag(&self) -> Option<u8> {
        self.buf.first().copied()
    }

    /// Reads the next element, returning its tag and content.
    pub(crate) fn read_any(&mut self) -> Result<(u8, &'a [u8]), OcspError> {
        let (&tag, rest) = self.buf.split_first().ok_or_else(|| malformed("truncated tag"))?;
        if tag & 0x1f == 0x1f {
            return Err(malformed("high tag numbers are not supported"));
        }
        let (&first, rest) = rest.split_first().ok_or_else(|| malformed("truncated length"))?;
        let (len, rest) = if first < 0x80 {
            (first as usize, rest)
        } else {
            let count = (first & 0x7f) as usize;
            if count == 0 || count > 4 || rest.len() < count {
                return Err(malformed("bad length"));
            }
            let len = rest[..count]
                .iter()
                .fold(0usize, |acc, b| (acc << 8) | *b as usize);
            (len, &rest[count..])
        };
        if rest.len() < len {
            return Err(malformed("content runs past the end"));
        }
        let (content, rest) = rest.split_at(len);
        self.buf = rest;
        Ok((tag, content))
    }

    /// Reads the next element, which must carry `tag`.
    pub(crate) fn read(&mut self, tag: u8) -> Result<&'a [u8], OcspError> {
        let (found, content) = self.read_any()?;
        if found != tag {
            return Err(OcspError::Malformed(format!(
                "expected tag {:#04x}, found {:#04x}",
                tag, found
            )));
        }
        Ok(content)
    }

    /// Reads the next element only if it carries `tag`.
    pub(crate) fn read_optional(&mut self, tag: u8) -> Result<Option<&'a [u8]>, OcspError> {
        if self.peek_tag() == Some(tag) {
            self.read(tag).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Reads the next element and returns its full encoding.
    #[cfg_attr(not(test), allow(dead_code))]
    pub(crate) fn read_raw(&mut self) -> Result<&'a [u8], OcspError> {
        let start = self.buf;
        self.read_any()?;
        Ok(&start[..start.len() - self.buf.len()])
    }
}

/// Parses GeneralizedTime content (`YYYYMMDDHHMMSS[.fff]Z`).
pub(crate) fn parse_generalized_time(content: &[u8]) -> Result<DateTime<Utc>, OcspError> {
    let text = std::str::from_utf8(content).map_err(|_| malformed("time is not ASCII"))?;
    let text = text
        .strip_suffix('Z')
        .ok_or_else(|| malformed("time is not UTC"))?;
    let whole = text.split('.').next().unwrap_or(text);
    NaiveDateTime::parse_from_str(whole, "%Y%m%d%H%M%S")
        .map(|t| t.and_utc())
        .map_err(|e| OcspError::Malformed(format!("time {:?}: {}", text, e)))
}
