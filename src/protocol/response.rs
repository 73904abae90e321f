//! Response framing and encryption.
//!
//! # Responsibilities
//! - Default `Connection: Keep-Alive` right after the status line
//! - Mark and encrypt bodies on secure connections
//! - Add `Content-Length` after encryption
//! - Optionally encrypt the header block
//! - Decide how the socket is torn down after sending

use bytes::{BufMut, Bytes, BytesMut};

use crate::crypto::{CipherError, StreamDirection};
use crate::protocol::headers::{self, HeaderMapping, HTTP_RESPONSE};
use crate::session::ConnectionContext;

/// A response ready for encoding.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub headers: HeaderMapping,
    pub body: Bytes,
}

impl Response {
    /// Response with the given status line and no headers.
    pub fn new(status: impl Into<String>) -> Self {
        let mut headers = HeaderMapping::new();
        headers.insert(HTTP_RESPONSE, status);
        Self {
            headers,
            body: Bytes::new(),
        }
    }

    /// Build from raw header text (`200 OK\nContent-Type: ...`).
    pub fn from_raw(header_text: &str, body: impl Into<Bytes>) -> Self {
        Self {
            headers: headers::parse(header_text, true),
            body: body.into(),
        }
    }

    /// Append a header, keeping earlier ones with the same name.
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn status(&self) -> Option<&str> {
        self.headers.get(HTTP_RESPONSE)
    }

    /// Numeric status code, when the status line has one.
    pub fn status_code(&self) -> Option<u16> {
        let status = self.status()?;
        let code = match status.strip_prefix("HTTP/") {
            Some(rest) => rest.split(' ').nth(1)?,
            None => status.split(' ').next()?,
        };
        code.parse().ok()
    }
}

/// How to treat the socket after writing a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    KeepOpen,
    /// Flush and close.
    Graceful,
    /// Reset without lingering (`Connection: close`).
    Abort,
}

/// Bytes to write plus the teardown to apply afterwards.
#[derive(Debug)]
pub struct EncodedResponse {
    pub bytes: Bytes,
    pub teardown: Teardown,
}

/// Encodes responses for one connection.
pub struct ResponseEncoder;

impl ResponseEncoder {
    /// Apply defaults, encrypt as the connection requires, and frame.
    pub fn encode(ctx: &mut ConnectionContext, response: Response) -> Result<EncodedResponse, CipherError> {
        let Response { mut headers, body } = response;

        if !headers.contains_key("Connection") {
            headers.insert_after("Connection", "Keep-Alive", HTTP_RESPONSE);
        }

        if ctx.secure {
            headers.insert_after("wtv-encrypted", "true", "Connection");
        }

        // The keystream preserves length, so the plaintext length is the
        // length on the wire.
        if !headers.contains_key_ignore_case("Content-Length") {
            headers.insert("Content-Length", body.len().to_string());
        }

        let mut head = headers::serialize(&headers);
        head.push('\n');
        let head = head.into_bytes();

        // Header block first: the response stream is consumed in wire order.
        let mut out = BytesMut::with_capacity(head.len() + body.len());
        if ctx.secure && ctx.secure_headers {
            let cipher = ctx.cipher_mut().ok_or(CipherError::NotSecure)?;
            out.put_slice(&cipher.encrypt(StreamDirection::Response, &head)?);
        } else {
            out.put_slice(&head);
        }

        if ctx.secure && !body.is_empty() {
            let cipher = ctx.cipher_mut().ok_or(CipherError::NotSecure)?;
            out.put_slice(&cipher.encrypt(StreamDirection::Response, &body)?);
        } else {
            out.put_slice(&body);
        }

        let teardown = if headers
            .get("Connection")
            .is_some_and(|value| value.eq_ignore_ascii_case("close"))
        {
            Teardown::Abort
        } else if ctx.close_after_response {
            Teardown::Graceful
        } else {
            Teardown::KeepOpen
        };

        Ok(EncodedResponse {
            bytes: out.freeze(),
            teardown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::StreamCipherSession;

    const TICKET: &str = "VGVzdFRpY2tldA==";
    const CHALLENGE: &str = "AAECAwQFBgcICQoLDA0ODw==";

    fn context() -> ConnectionContext {
        ConnectionContext::new("10.1.1.1:5555".parse().unwrap())
    }

    fn secure_context() -> (ConnectionContext, StreamCipherSession) {
        let mut ctx = context();
        let cipher = ctx.install_cipher(None);
        cipher.decode_ticket(TICKET).unwrap();
        cipher.set_challenge(CHALLENGE).unwrap();
        cipher.secure_on().unwrap();
        ctx.secure = true;

        let mut client = StreamCipherSession::new();
        client.decode_ticket(TICKET).unwrap();
        client.set_challenge(CHALLENGE).unwrap();
        client.secure_on().unwrap();
        (ctx, client)
    }

    #[test]
    fn plain_response_gets_defaults() {
        let mut ctx = context();
        let response = Response::from_raw("200 OK\nContent-Type: text/html", "hello");
        let encoded = ResponseEncoder::encode(&mut ctx, response).unwrap();

        assert_eq!(
            &encoded.bytes[..],
            b"200 OK\r\nConnection: Keep-Alive\nContent-Type: text/html\nContent-Length: 5\n\nhello"
        );
        assert_eq!(encoded.teardown, Teardown::KeepOpen);
    }

    #[test]
    fn existing_length_is_kept() {
        let mut ctx = context();
        let response = Response::from_raw("200 OK\nConnection: Keep-Alive\nContent-length: 0", "");
        let encoded = ResponseEncoder::encode(&mut ctx, response).unwrap();
        assert_eq!(&encoded.bytes[..], b"200 OK\r\nConnection: Keep-Alive\nContent-length: 0\n\n");
    }

    #[test]
    fn secure_response_is_marked_and_encrypted() {
        let (mut ctx, mut client) = secure_context();
        let response = Response::new("200 OK").header("Content-Type", "text/html").body("secret body");
        let encoded = ResponseEncoder::encode(&mut ctx, response).unwrap();

        let text = String::from_utf8_lossy(&encoded.bytes).into_owned();
        assert!(text.starts_with("200 OK\r\nConnection: Keep-Alive\nwtv-encrypted: true\n"));
        assert!(text.contains("Content-Length: 11\n"));

        let body = &encoded.bytes[encoded.bytes.len() - 11..];
        assert_ne!(body, b"secret body");
        assert_eq!(client.decrypt(StreamDirection::Response, body).unwrap(), b"secret body");
    }

    #[test]
    fn identical_bodies_encrypt_differently() {
        let (mut ctx, _) = secure_context();
        let a = ResponseEncoder::encode(&mut ctx, Response::new("200 OK").body("same")).unwrap();
        let b = ResponseEncoder::encode(&mut ctx, Response::new("200 OK").body("same")).unwrap();
        assert_ne!(&a.bytes[a.bytes.len() - 4..], &b.bytes[b.bytes.len() - 4..]);
    }

    #[test]
    fn empty_secure_body_still_marked() {
        let (mut ctx, _) = secure_context();
        let encoded = ResponseEncoder::encode(&mut ctx, Response::new("200 OK")).unwrap();
        assert!(String::from_utf8_lossy(&encoded.bytes).contains("wtv-encrypted: true"));
        assert_eq!(ctx.cipher().unwrap().keystream_offset(StreamDirection::Response), Some(0));
    }

    #[test]
    fn header_block_encryption() {
        let (mut ctx, mut client) = secure_context();
        ctx.secure_headers = true;
        let encoded = ResponseEncoder::encode(&mut ctx, Response::new("200 OK").body("abc")).unwrap();

        let plain = client.decrypt(StreamDirection::Response, &encoded.bytes).unwrap();
        let text = String::from_utf8_lossy(&plain).into_owned();
        assert!(text.starts_with("200 OK\r\nConnection: Keep-Alive\nwtv-encrypted: true\n"));
        assert!(text.ends_with("Content-Length: 3\n\nabc"));
    }

    #[test]
    fn teardown_paths() {
        let mut ctx = context();
        let close = Response::new("400 HackTV ran into a technical problem.").header("Connection", "CLOSE");
        assert_eq!(ResponseEncoder::encode(&mut ctx, close).unwrap().teardown, Teardown::Abort);

        ctx.close_after_response = true;
        let graceful = Response::new("200 OK");
        assert_eq!(ResponseEncoder::encode(&mut ctx, graceful).unwrap().teardown, Teardown::Graceful);
    }

    #[test]
    fn status_codes() {
        assert_eq!(Response::new("404 Not here").status_code(), Some(404));
        assert_eq!(Response::new("HTTP/1.1 200 OK").status_code(), Some(200));
        assert_eq!(Response::new("garbage").status_code(), None);
    }
}
