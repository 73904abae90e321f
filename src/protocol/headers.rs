//! Header block codec.
//!
//! # Responsibilities
//! - Parse a textual header block into an ordered mapping
//! - Recognize `SECURE ON`, request lines and response status lines
//! - Keep duplicate header names (suffixed keys, original names on the wire)
//! - Serialize a mapping back to wire text
//! - Split request URLs into path and query parameters
//!
//! # Design Decisions
//! - Order is preserved on output; some clients care
//! - Synthetic keys (`request_url`, `secure`, ...) live in the same mapping as
//!   real headers but are never written as `Name: Value` lines

use percent_encoding::percent_decode_str;

/// Response status line, e.g. `200 OK`.
pub const HTTP_RESPONSE: &str = "http_response";
/// Raw request line, e.g. `GET wtv-home:/home HTTP/1.0`.
pub const REQUEST_LINE: &str = "request";
/// URI-decoded request target.
pub const REQUEST_URL: &str = "request_url";
/// Set when the block started with `SECURE ON`.
pub const SECURE: &str = "secure";
/// Set when any layer of the frame was decrypted.
pub const ENCRYPTED: &str = "encrypted";
/// Set when the client flagged encryption but sent plaintext.
pub const PSEUDO_ENCRYPTION: &str = "psuedo-encryption";

const SYNTHETIC_KEYS: [&str; 6] = [
    HTTP_RESPONSE,
    REQUEST_LINE,
    REQUEST_URL,
    SECURE,
    ENCRYPTED,
    PSEUDO_ENCRYPTION,
];

const SECURE_ON_MARKER: &str = "SECURE ON";

/// Characters `decodeURI`-style decoding leaves escaped.
const URI_RESERVED: &[u8] = b";/?:@&=+$,#";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    key: String,
    name: String,
    value: String,
}

/// Ordered header mapping with duplicate-name support.
///
/// Every entry has a lookup key and a wire name. They are equal except for
/// repeated names, whose keys carry a `_<n>` suffix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMapping {
    entries: Vec<Entry>,
    duplicates: usize,
}

impl HeaderMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.position(key).map(|idx| self.entries[idx].value.as_str())
    }

    /// Value of the first entry whose key matches `key` ignoring ASCII case.
    pub fn get_ignore_case(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| entry.key.eq_ignore_ascii_case(key))
            .map(|entry| entry.value.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    pub fn contains_key_ignore_case(&self, key: &str) -> bool {
        self.get_ignore_case(key).is_some()
    }

    /// Set `key` to `value`, replacing in place or appending at the end.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.position(&key) {
            Some(idx) => self.entries[idx].value = value,
            None => self.entries.push(Entry {
                name: key.clone(),
                key,
                value,
            }),
        }
    }

    /// Append a header, keeping any earlier entry with the same name.
    ///
    /// Returns the lookup key the value was stored under.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) -> String {
        let name = name.into();
        let mut key = name.clone();
        while self.contains_key(&key) {
            key = format!("{}_{}", name, self.duplicates);
            self.duplicates += 1;
        }
        self.entries.push(Entry {
            key: key.clone(),
            name,
            value: value.into(),
        });
        key
    }

    /// Place `key` immediately after `anchor`, inserting or moving it.
    ///
    /// Without the anchor the entry goes first.
    pub fn insert_after(&mut self, key: impl Into<String>, value: impl Into<String>, anchor: &str) {
        let key = key.into();
        let value = value.into();
        let entry = match self.position(&key) {
            Some(idx) => {
                let mut entry = self.entries.remove(idx);
                entry.value = value;
                entry
            }
            None => Entry {
                name: key.clone(),
                key,
                value,
            },
        };

        let at = self.position(anchor).map(|idx| idx + 1).unwrap_or(0);
        self.entries.insert(at, entry);
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.position(key).map(|idx| self.entries.remove(idx).value)
    }

    /// Shallow merge: every key of `other` overwrites or extends `self`.
    pub fn merge(&mut self, other: HeaderMapping) {
        for entry in other.entries {
            match self.position(&entry.key) {
                Some(idx) => self.entries[idx].value = entry.value,
                None => self.entries.push(entry),
            }
        }
    }

    /// True when `key` holds the literal `true`.
    pub fn flag(&self, key: &str) -> bool {
        self.get(key) == Some("true")
    }

    pub fn set_flag(&mut self, key: &str, on: bool) {
        if on {
            self.insert(key, "true");
        } else {
            self.remove(key);
        }
    }

    /// `(key, value)` pairs in order, synthetic keys included.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|entry| (entry.key.as_str(), entry.value.as_str()))
    }

    /// `(wire name, value)` pairs of real headers in order.
    pub fn wire_headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .filter(|entry| !SYNTHETIC_KEYS.contains(&entry.key.as_str()))
            .map(|entry| (entry.name.as_str(), entry.value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.key == key)
    }
}

/// Parse a header block.
///
/// `is_response` selects status-line recognition instead of `SECURE ON` and
/// request-line recognition. Values lose exactly one leading space.
pub fn parse(raw: &str, is_response: bool) -> HeaderMapping {
    let mut mapping = HeaderMapping::new();

    for line in raw.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if !is_response && line.starts_with(SECURE_ON_MARKER) {
            mapping.set_flag(SECURE, true);
        } else if is_response && is_status_line(line) {
            mapping.insert(HTTP_RESPONSE, line);
        } else if !is_response && is_request_line(line) {
            mapping.insert(REQUEST_LINE, line);
            if let Some(target) = line.split(' ').nth(1) {
                mapping.insert(REQUEST_URL, decode_uri(target));
            }
        } else if let Some(colon) = line.find(':').filter(|&idx| idx > 0) {
            let value = &line[colon + 1..];
            let value = value.strip_prefix(' ').unwrap_or(value);
            mapping.append(&line[..colon], value);
        }
    }

    mapping
}

/// Serialize a mapping to wire text.
///
/// The start line (status line, or `SECURE ON` / request line for requests)
/// ends in CRLF; header lines end in LF. No blank line is appended.
pub fn serialize(mapping: &HeaderMapping) -> String {
    let mut out = String::new();

    if let Some(status) = mapping.get(HTTP_RESPONSE) {
        out.push_str(status);
        out.push_str("\r\n");
    } else {
        if mapping.flag(SECURE) {
            out.push_str(SECURE_ON_MARKER);
            out.push_str("\r\n");
        }
        if let Some(request) = mapping.get(REQUEST_LINE) {
            out.push_str(request);
            out.push_str("\r\n");
        }
    }

    for (name, value) in mapping.wire_headers() {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push('\n');
    }

    out
}

fn is_status_line(line: &str) -> bool {
    let bytes = line.as_bytes();
    let three_digit = bytes.len() >= 4 && bytes[..3].iter().all(u8::is_ascii_digit) && bytes[3] == b' ';
    three_digit || line.starts_with("HTTP/")
}

fn is_request_line(line: &str) -> bool {
    matches!(line.get(..4), Some("GET " | "PUT " | "POST"))
}

/// Percent-decode a request target, leaving escaped reserved characters
/// (`;/?:@&=+$,#`) untouched so query splitting still sees them as data.
pub fn decode_uri(target: &str) -> String {
    let bytes = target.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;

    while idx < bytes.len() {
        if bytes[idx] == b'%' && idx + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[idx + 1]), hex_value(bytes[idx + 2])) {
                let decoded = (hi << 4) | lo;
                if URI_RESERVED.contains(&decoded) {
                    out.extend_from_slice(&bytes[idx..idx + 3]);
                } else {
                    out.push(decoded);
                }
                idx += 3;
                continue;
            }
        }
        out.push(bytes[idx]);
        idx += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Ordered query parameters of a request URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    /// Raw (still escaped) value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Value for `key` with percent escapes resolved.
    pub fn get_decoded(&self, key: &str) -> Option<String> {
        self.get(key).map(unescape)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Resolve percent escapes in a query value.
pub fn unescape(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}

/// Split `url` into the part before `?` and its query parameters.
///
/// Pairs are separated by `&`; a pair without `=` or with an empty key is
/// skipped.
pub fn split_query(url: &str) -> (&str, QueryParams) {
    let mut query = QueryParams::default();

    let Some((short, rest)) = url.split_once('?') else {
        return (url, query);
    };

    let raw = rest.split('?').next().unwrap_or_default();
    for pair in raw.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            if !key.is_empty() {
                query.pairs.push((key.to_string(), value.to_string()));
            }
        }
    }

    (short, query)
}
