//! Content negotiation: `Accept` and `AMP-Cache-Transform`.
//!
//! `AMP-Cache-Transform` is a parameterised list of identifiers, e.g.
//! `google;v="1..2", any`. Each identifier names a cache. The only parameter
//! understood is `v`, a quoted list of version ranges.

use tracing::debug;

/// An inclusive range of transform versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRange {
    pub min: i64,
    pub max: i64,
}

impl VersionRange {
    pub const fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }
}

/// Transform versions this packager can produce, highest first.
pub const SUPPORTED_VERSIONS: &[VersionRange] = &[VersionRange::new(1, 1)];

/// Cache identifiers we answer to.
const VALID_IDENTIFIERS: &[&str] = &["any", "google"];

/// Picks the highest supported version overlapping the requested ranges.
///
/// `requested` must be sorted highest first and must not overlap. An empty
/// request selects the latest supported version.
pub fn select_version(requested: &[VersionRange]) -> Option<i64> {
    let latest = SUPPORTED_VERSIONS.first().map(|v| v.max);
    if requested.is_empty() {
        return latest;
    }

    for (i, range) in requested.iter().enumerate() {
        if range.min < 1 || range.min > range.max {
            return None;
        }
        if i > 0 && requested[i - 1].min <= range.max {
            return None;
        }
    }

    for range in requested {
        for supported in SUPPORTED_VERSIONS {
            if range.max >= supported.min && range.min <= supported.max {
                return Some(range.max.min(supported.max));
            }
        }
    }
    None
}

/// Decides whether to send an exchange for this `AMP-Cache-Transform` value.
///
/// Returns the response header value (e.g. `any;v="1"`) and the selected
/// version, or `None` if nothing in the header can be satisfied.
pub fn should_send_sxg(header: &str) -> Option<(String, i64)> {
    let identifiers = match parse_parameterised_list(header) {
        Ok(ids) => ids,
        Err(e) => {
            debug!("Failed to parse AMP-Cache-Transform {:?}: {}", header, e);
            return None;
        }
    };

    'identifiers: for identifier in identifiers {
        if !VALID_IDENTIFIERS.contains(&identifier.id.as_str()) {
            continue;
        }
        let mut requested = Vec::new();
        for (name, value) in &identifier.params {
            if name != "v" {
                debug!("Unknown param {:?} in AMP-Cache-Transform {:?}", name, header);
                continue 'identifiers;
            }
            match parse_versions(value) {
                Some(v) => requested = v,
                None => continue 'identifiers,
            }
        }
        if let Some(version) = select_version(&requested) {
            return Some((format!("{};v=\"{}\"", identifier.id, version), version));
        }
    }
    None
}

/// True if the `Accept` value lists the b3 signed-exchange media type.
pub fn accepts_signed_exchange(accept: &str) -> bool {
    accept.split(',').any(|entry| {
        let mut parts = entry.split(';').map(str::trim);
        if !parts
            .next()
            .is_some_and(|t| t.eq_ignore_ascii_case("application/signed-exchange"))
        {
            return false;
        }
        let mut version_ok = false;
        let mut q_ok = true;
        for param in parts {
            match param.split_once('=') {
                Some((k, v)) if k.trim().eq_ignore_ascii_case("v") => {
                    version_ok = v.trim().trim_matches('"') == "b3";
                }
                Some((k, v)) if k.trim().eq_ignore_ascii_case("q") => {
                    q_ok = v.trim().parse::<f32>().map_or(false, |q| q > 0.0);
                }
                _ => {}
            }
        }
        version_ok && q_ok
    })
}

// ===== Parameterised List Parsing =====

#[derive(Debug)]
struct ParameterisedIdentifier {
    id: String,
    params: Vec<(String, String)>,
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(s: &'a str) -> Self {
        Self {
            bytes: s.as_bytes(),
            pos: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn skip_ows(&mut self) {
        while matches!(self.peek(), Some(b' ') | Some(b'\t')) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, want: u8) -> Result<(), String> {
        match self.next() {
            Some(b) if b == want => Ok(()),
            _ => Err(format!("expected '{}' at {}", want as char, self.pos)),
        }
    }
}

fn parse_parameterised_list(input: &str) -> Result<Vec<ParameterisedIdentifier>, String> {
    let mut cursor = Cursor::new(input);
    let mut items = Vec::new();
    loop {
        items.push(parse_parameterised_identifier(&mut cursor)?);
        if cursor.is_empty() {
            return Ok(items);
        }
        cursor.skip_ows();
        cursor.expect(b',')?;
        cursor.skip_ows();
        if cursor.is_empty() {
            return Err("expected another identifier after ','".to_string());
        }
    }
}

fn parse_parameterised_identifier(cursor: &mut Cursor<'_>) -> Result<ParameterisedIdentifier, String> {
    let id = parse_identifier(cursor)?;
    let mut params: Vec<(String, String)> = Vec::new();
    loop {
        let mark = cursor.pos;
        cursor.skip_ows();
        if cursor.peek() != Some(b';') {
            cursor.pos = mark;
            break;
        }
        cursor.pos += 1;
        cursor.skip_ows();
        let name = parse_identifier(cursor)?;
        if params.iter().any(|(n, _)| *n == name) {
            return Err(format!("param {:?} repeated", name));
        }
        cursor.expect(b'=')?;
        let value = parse_string(cursor)?;
        params.push((name, value));
    }
    Ok(ParameterisedIdentifier { id, params })
}

fn parse_identifier(cursor: &mut Cursor<'_>) -> Result<String, String> {
    let mut out = String::new();
    match cursor.next() {
        Some(b) if b.is_ascii_lowercase() => out.push(b as char),
        _ => return Err("expected lowercase alpha".to_string()),
    }
    while let Some(b) = cursor.peek() {
        if b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'_' | b'-' | b'*' | b'/') {
            out.push(b as char);
            cursor.pos += 1;
        } else {
            break;
        }
    }
    Ok(out)
}

fn parse_string(cursor: &mut Cursor<'_>) -> Result<String, String> {
    cursor.expect(b'"')?;
    let mut out = String::new();
    loop {
        match cursor.next() {
            None => return Err("unterminated string".to_string()),
            Some(b'\\') => match cursor.next() {
                Some(c @ (b'"' | b'\\')) => out.push(c as char),
                _ => return Err("bad escape in string".to_string()),
            },
            Some(b'"') => return Ok(out),
            Some(c) if c <= 0x1f || c == 0x7f => {
                return Err(format!("invalid char {} in string", c))
            }
            Some(c) => out.push(c as char),
        }
    }
}

/// Parses `"2, 1..3"` style version lists, sorted highest max first.
fn parse_versions(spec: &str) -> Option<Vec<VersionRange>> {
    let mut ranges = Vec::new();
    for part in spec.split(',') {
        let bounds: Vec<&str> = part.split("..").map(str::trim).collect();
        let range = match bounds.as_slice() {
            [single] => {
                let v = single.parse().ok()?;
                VersionRange::new(v, v)
            }
            [min, max] => VersionRange::new(min.parse().ok()?, max.parse().ok()?),
            _ => return None,
        };
        ranges.push(range);
    }
    ranges.sort_by(|a, b| b.max.cmp(&a.max));
    Some(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_for(value: &str) -> String {
        should_send_sxg(value).map(|(h, _)| h).unwrap_or_default()
    }

    #[test]
    fn any_selects_latest() {
        assert_eq!(header_for("any"), "any;v=\"1\"");
    }

    #[test]
    fn skips_unknown_identifiers() {
        assert_eq!(header_for("foobar, any"), "any;v=\"1\"");
    }

    #[test]
    fn unsupported_version_falls_through() {
        assert_eq!(header_for("google;v=\"2\""), "");
        assert_eq!(header_for("google;v=\"2\",any"), "any;v=\"1\"");
    }

    #[test]
    fn version_range_overlap() {
        assert_eq!(header_for("google;v=\"1..2\""), "google;v=\"1\"");
        assert_eq!(should_send_sxg("google;v=\"1..2\"").unwrap().1, 1);
    }

    #[test]
    fn malformed_headers_are_refused() {
        assert_eq!(header_for("google;v=1"), "");
        assert_eq!(header_for(" any"), "");
        assert_eq!(header_for("googleany"), "");
        assert_eq!(header_for("ABC,google"), "");
        assert_eq!(header_for("any,"), "");
        assert_eq!(header_for("any;x=\"1\""), "");
    }

    #[test]
    fn select_version_rules() {
        assert_eq!(select_version(&[]), Some(1));
        assert_eq!(select_version(&[VersionRange::new(1, 5)]), Some(1));
        assert_eq!(select_version(&[VersionRange::new(2, 5)]), None);
        assert_eq!(select_version(&[VersionRange::new(0, 1)]), None);
        // Overlapping ranges are invalid.
        assert_eq!(
            select_version(&[VersionRange::new(2, 4), VersionRange::new(1, 3)]),
            None
        );
    }

    #[test]
    fn accept_header_detection() {
        assert!(accepts_signed_exchange("application/signed-exchange;v=b3"));
        assert!(accepts_signed_exchange(
            "text/html, application/signed-exchange;v=b3;q=0.9"
        ));
        assert!(!accepts_signed_exchange("application/signed-exchange;v=b2"));
        assert!(!accepts_signed_exchange("application/signed-exchange;v=b3;q=0"));
        assert!(!accepts_signed_exchange("text/html"));
    }
}
