//! Decoded request handed to the dispatcher.

use bytes::Bytes;
use uuid::Uuid;

use crate::protocol::headers::{
    self, HeaderMapping, QueryParams, ENCRYPTED, PSEUDO_ENCRYPTION, REQUEST_LINE, REQUEST_URL, SECURE,
};

/// How one unwrap layer of a frame was interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    /// Plain header text.
    Plaintext,
    /// Plain header text opening with `SECURE ON`.
    SecureOn,
    /// Bytes that only made sense after decryption.
    Ciphertext,
    /// Flagged secure but sent in clear.
    PseudoEncrypted,
}

impl LayerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LayerKind::Plaintext => "plaintext",
            LayerKind::SecureOn => "secure_on",
            LayerKind::Ciphertext => "ciphertext",
            LayerKind::PseudoEncrypted => "pseudo",
        }
    }
}

/// A fully unwrapped request.
#[derive(Debug, Clone)]
pub struct DecodedRequest {
    pub request_id: Uuid,
    /// Merged headers of every layer, synthetic keys included.
    pub headers: HeaderMapping,
    pub query: QueryParams,
    /// Body bytes of a POST, already decrypted when they were encrypted.
    pub post_data: Option<Bytes>,
    /// Serial number bound to the connection when the request was decoded.
    pub ssid: Option<String>,
    pub layers: Vec<LayerKind>,
}

impl DecodedRequest {
    /// Build from merged headers; `None` when no request URL was decoded.
    pub fn new(headers: HeaderMapping, post_data: Option<Bytes>, ssid: Option<String>, layers: Vec<LayerKind>) -> Option<Self> {
        let url = headers.get(REQUEST_URL)?;
        let (_, query) = headers::split_query(url);
        Some(Self {
            request_id: Uuid::new_v4(),
            query,
            headers,
            post_data,
            ssid,
            layers,
        })
    }

    /// The decoded request target.
    pub fn request_url(&self) -> &str {
        self.headers.get(REQUEST_URL).unwrap_or_default()
    }

    /// Request target without its query string.
    pub fn short_url(&self) -> &str {
        let url = self.request_url();
        url.split_once('?').map(|(short, _)| short).unwrap_or(url)
    }

    /// `GET`, `PUT` or `POST`.
    pub fn method(&self) -> &str {
        self.headers
            .get(REQUEST_LINE)
            .and_then(|line| line.split(' ').next())
            .unwrap_or_default()
    }

    pub fn is_post(&self) -> bool {
        self.method() == "POST"
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn is_secure(&self) -> bool {
        self.headers.flag(SECURE)
    }

    pub fn is_encrypted(&self) -> bool {
        self.headers.flag(ENCRYPTED)
    }

    pub fn is_pseudo_encrypted(&self) -> bool {
        self.headers.flag(PSEUDO_ENCRYPTION)
    }

    /// Label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        if self.is_pseudo_encrypted() {
            "pseudo"
        } else if self.is_encrypted() || self.is_secure() {
            "encrypted"
        } else {
            "plaintext"
        }
    }
}
