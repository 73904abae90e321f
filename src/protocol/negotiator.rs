//! Security negotiation: turning a raw frame into a decoded request.
//!
//! # Responsibilities
//! - Classify each layer of a frame as plaintext, `SECURE ON`, ciphertext or
//!   pseudo-encrypted
//! - Create and key the connection's cipher session on the first encryption signal
//! - Unwrap encrypted header blocks in a bounded loop, merging every layer
//! - Record identity fields (serial number, ROM type, incarnation, ticket)
//! - Extract POST bodies, decrypting them when the connection is secure
//! - Detect lost encryption streams and ask for a relogin
//!
//! # Layer Loop
//! ```text
//! wire bytes ─▶ plausible header text? ──no──▶ first layer? ─▶ decrypt whole frame ─▶ next layer
//!                      │yes
//!                      ▼
//!               parse + merge + identity
//!                      │
//!           SECURE ON without a URL? ──yes──▶ trial decrypt remainder
//!                      │no                      ├─ plausible  ─▶ next layer (ciphertext)
//!                      ▼                        ├─ raw plausible ─▶ next layer (pseudo)
//!                    done                       └─ neither ─▶ done (lost stream)
//! ```
//!
//! # Design Decisions
//! - Classification always happens before any decryption attempt
//! - Trial decryption runs on a cloned keystream, so a pseudo-encrypted frame
//!   never advances the request stream
//! - Inner layers are bounded by `max_unwrap_depth`

use bytes::Bytes;

use crate::crypto::{CipherError, StreamCipherSession, StreamDirection};
use crate::protocol::classify::{is_plausible_header_text, latin1_to_string, split_header_block};
use crate::protocol::headers::{self, HeaderMapping, ENCRYPTED, PSEUDO_ENCRYPTION, REQUEST_LINE, REQUEST_URL, SECURE};
use crate::protocol::request::{DecodedRequest, LayerKind};
use crate::observability::metrics::record_frame;
use crate::session::{ConnectionContext, SessionRegistry, DEVICE_HEADERS};

const SERIAL_HEADER: &str = "wtv-client-serial-number";
const ROM_TYPE_HEADER: &str = "wtv-client-rom-type";
const INCARNATION_HEADER: &str = "wtv-incarnation";
const TICKET_HEADER: &str = "wtv-ticket";

/// Tickets this short are placeholders, not credentials.
const MIN_STORED_TICKET_LEN: usize = 8;

/// Errors raised while decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Nothing worth answering; the socket is dropped.
    #[error("empty frame")]
    EmptyFrame,
    /// The frame could not be interpreted by any path.
    #[error("unparseable frame: {0}")]
    FrameParse(String),
    /// Decoding finished without a request URL.
    #[error("no request url could be decoded")]
    UnroutableRequest,
    #[error(transparent)]
    Cipher(#[from] CipherError),
}

/// What to do with a frame.
#[derive(Debug)]
pub enum Negotiation {
    /// Hand the request to the dispatcher.
    Dispatch(DecodedRequest),
    /// The encryption stream is lost; tell the client to log in again.
    Relogin,
    /// No URL and no secure history; answer with an error page and close.
    BadRequest,
}

/// Knobs for the negotiator.
#[derive(Debug, Clone, Copy)]
pub struct NegotiatorConfig {
    /// Maximum number of layers per frame, the outer one included.
    pub max_unwrap_depth: usize,
    /// Skip trial decryption for identities known to send plaintext.
    pub trust_learned_quirk: bool,
    /// Encrypt response header blocks once a connection is secure.
    pub encrypt_headers: bool,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            max_unwrap_depth: 2,
            trust_learned_quirk: false,
            encrypt_headers: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Wire,
    Decrypted,
    Pseudo,
}

struct Layer {
    bytes: Vec<u8>,
    origin: Origin,
}

/// Decodes frames for one server; stateless apart from its configuration.
#[derive(Debug, Clone, Default)]
pub struct SecurityNegotiator {
    config: NegotiatorConfig,
}

impl SecurityNegotiator {
    pub fn new(config: NegotiatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NegotiatorConfig {
        &self.config
    }

    /// Decode one frame received on `ctx`.
    ///
    /// Key derivation failures and unroutable frames are answered here; every
    /// other error is left to the caller.
    pub fn negotiate(
        &self,
        ctx: &mut ConnectionContext,
        registry: &SessionRegistry,
        frame: &[u8],
    ) -> Result<Negotiation, ProtocolError> {
        if frame.len() <= 1 {
            return Err(ProtocolError::EmptyFrame);
        }
        metrics::histogram!("wtvp_frame_bytes").record(frame.len() as f64);

        match self.unwrap_frame(ctx, registry, frame) {
            Ok(request) => {
                record_frame(request.kind());
                Ok(Negotiation::Dispatch(request))
            }
            Err(ProtocolError::UnroutableRequest) | Err(ProtocolError::Cipher(CipherError::KeyDerivation)) => {
                Ok(self.lost_stream(ctx))
            }
            Err(e) => {
                record_frame("rejected");
                Err(e)
            }
        }
    }

    fn lost_stream(&self, ctx: &mut ConnectionContext) -> Negotiation {
        if ctx.secure || ctx.has_cipher() {
            tracing::info!(connection_id = %ctx.id, ssid = ?ctx.ssid, "Encryption stream lost, requesting relogin");
            ctx.reset_security();
            record_frame("relogin");
            Negotiation::Relogin
        } else {
            tracing::info!(connection_id = %ctx.id, "Frame carried no request url");
            record_frame("rejected");
            Negotiation::BadRequest
        }
    }

    fn unwrap_frame(
        &self,
        ctx: &mut ConnectionContext,
        registry: &SessionRegistry,
        frame: &[u8],
    ) -> Result<DecodedRequest, ProtocolError> {
        let mut merged = HeaderMapping::new();
        let mut kinds: Vec<LayerKind> = Vec::new();
        let mut post_data: Option<Bytes> = None;
        let mut layer = Layer {
            bytes: frame.to_vec(),
            origin: Origin::Wire,
        };

        loop {
            let can_unwrap = kinds.len() + 1 < self.config.max_unwrap_depth;
            let block = split_header_block(&layer.bytes);

            if !is_plausible_header_text(block.head) {
                if layer.origin != Origin::Wire || !kinds.is_empty() {
                    tracing::debug!(connection_id = %ctx.id, origin = ?layer.origin, "Inner layer is not header text");
                    break;
                }
                if !can_unwrap {
                    return Err(ProtocolError::FrameParse(
                        "binary frame and no unwrap depth left".to_string(),
                    ));
                }

                let plain = self.decrypt_binary_frame(ctx, registry, &layer.bytes)?;
                merged.set_flag(ENCRYPTED, true);
                kinds.push(LayerKind::Ciphertext);
                layer = Layer {
                    bytes: plain,
                    origin: Origin::Decrypted,
                };
                continue;
            }

            let parsed = headers::parse(&latin1_to_string(block.head), false);
            let secure_on = parsed.flag(SECURE);
            let has_url = parsed.contains_key(REQUEST_URL);
            let is_post = parsed
                .get(REQUEST_LINE)
                .is_some_and(|line| line.starts_with("POST"));

            kinds.push(match (layer.origin, secure_on) {
                (Origin::Decrypted, _) => LayerKind::Ciphertext,
                (Origin::Pseudo, _) => LayerKind::PseudoEncrypted,
                (Origin::Wire, true) => LayerKind::SecureOn,
                (Origin::Wire, false) => LayerKind::Plaintext,
            });

            self.absorb_identity(ctx, registry, &parsed);
            merged.merge(parsed);

            if secure_on {
                self.enter_secure(ctx, registry, &merged)?;
            }

            if is_post {
                let body = self.post_body(ctx, registry, &mut merged, block.body, layer.origin)?;
                tracing::debug!(connection_id = %ctx.id, len = body.len(), "POST body extracted");
                post_data = Some(body);
            }

            if !secure_on || has_url || block.body.is_empty() || !can_unwrap {
                break;
            }

            let remainder = block.body.to_vec();
            layer = match self.unwrap_secure_remainder(ctx, registry, &remainder)? {
                Some(plain) => {
                    merged.set_flag(ENCRYPTED, true);
                    Layer {
                        bytes: plain,
                        origin: Origin::Decrypted,
                    }
                }
                None if is_plausible_header_text(split_header_block(&remainder).head) => {
                    self.mark_pseudo(ctx, registry, &mut merged);
                    Layer {
                        bytes: remainder,
                        origin: Origin::Pseudo,
                    }
                }
                None => {
                    tracing::debug!(connection_id = %ctx.id, "SECURE ON remainder is neither ciphertext nor plaintext");
                    break;
                }
            };
        }

        let layer_names: Vec<&str> = kinds.iter().map(|kind| kind.as_str()).collect();
        tracing::debug!(connection_id = %ctx.id, layers = ?layer_names, "Frame unwrapped");

        DecodedRequest::new(merged, post_data, ctx.ssid.clone(), kinds).ok_or(ProtocolError::UnroutableRequest)
    }

    /// First sign of encryption on a frame with no readable header block.
    fn decrypt_binary_frame(
        &self,
        ctx: &mut ConnectionContext,
        registry: &SessionRegistry,
        data: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        if !ctx.secure || !ctx.has_cipher() {
            tracing::debug!(connection_id = %ctx.id, "First sign of encryption, keying a new cipher session");
            let identity = ctx.ssid.as_deref().and_then(|ssid| registry.get(ssid));
            let cipher = ctx.install_cipher(identity.as_ref());
            cipher.issue_challenge();
            cipher.secure_on()?;
            ctx.secure = true;
            ctx.secure_headers = self.config.encrypt_headers;
        }

        let cipher = ctx.cipher_mut().ok_or(CipherError::NotSecure)?;
        Ok(cipher.decrypt(StreamDirection::Request, data)?)
    }

    /// `SECURE ON` seen: make sure a keyed cipher session exists.
    fn enter_secure(
        &self,
        ctx: &mut ConnectionContext,
        registry: &SessionRegistry,
        merged: &HeaderMapping,
    ) -> Result<(), ProtocolError> {
        if !ctx.has_cipher() {
            tracing::debug!(connection_id = %ctx.id, ssid = ?ctx.ssid, "Starting cipher session for SECURE ON");
            let identity = ctx.ssid.as_deref().and_then(|ssid| registry.get(ssid));
            let cipher = ctx.install_cipher(identity.as_ref());
            prime_from_headers(cipher, merged);
            cipher.secure_on()?;
        } else if let Some(cipher) = ctx.cipher_mut() {
            if !cipher.is_secure() {
                prime_from_headers(cipher, merged);
                cipher.secure_on()?;
            }
        }

        ctx.secure = true;
        ctx.secure_headers = self.config.encrypt_headers;
        Ok(())
    }

    /// Try to decrypt what follows a `SECURE ON` header block.
    ///
    /// `None` means the bytes did not decrypt to header text; the request
    /// stream is left where it was.
    fn unwrap_secure_remainder(
        &self,
        ctx: &mut ConnectionContext,
        registry: &SessionRegistry,
        remainder: &[u8],
    ) -> Result<Option<Vec<u8>>, ProtocolError> {
        if self.config.trust_learned_quirk && self.learned_pseudo(ctx, registry) {
            tracing::debug!(connection_id = %ctx.id, ssid = ?ctx.ssid, "Known pseudo-encrypting client, skipping trial decrypt");
            return Ok(None);
        }

        let cipher = ctx.cipher_mut().ok_or(CipherError::NotSecure)?;
        let decrypted = cipher.decrypt_if(StreamDirection::Request, remainder, |plain| {
            is_plausible_header_text(split_header_block(plain).head)
        })?;

        if decrypted.is_some() {
            if let Some(ssid) = &ctx.ssid {
                registry.set_pseudo_encryption(ssid, false);
            }
            tracing::debug!(connection_id = %ctx.id, "Encrypted request (SECURE ON)");
        }
        Ok(decrypted)
    }

    fn learned_pseudo(&self, ctx: &ConnectionContext, registry: &SessionRegistry) -> bool {
        ctx.ssid
            .as_deref()
            .and_then(|ssid| registry.get(ssid))
            .is_some_and(|identity| identity.does_pseudo_encryption())
    }

    /// The client flagged encryption but sent plaintext.
    fn mark_pseudo(&self, ctx: &mut ConnectionContext, registry: &SessionRegistry, merged: &mut HeaderMapping) {
        tracing::debug!(connection_id = %ctx.id, ssid = ?ctx.ssid, "Pseudo-encrypted request (SECURE ON)");
        merged.set_flag(PSEUDO_ENCRYPTION, true);
        if let Some(ssid) = &ctx.ssid {
            registry.set_pseudo_encryption(ssid, true);
        }
        ctx.secure = false;
        ctx.secure_headers = false;
    }

    /// Body of a POST found in a layer.
    ///
    /// Decrypted layers already hold plaintext. Wire and pseudo layers are
    /// decrypted only on a secure connection, and only when the body does not
    /// already read as text.
    fn post_body(
        &self,
        ctx: &mut ConnectionContext,
        registry: &SessionRegistry,
        merged: &mut HeaderMapping,
        body: &[u8],
        origin: Origin,
    ) -> Result<Bytes, ProtocolError> {
        if origin == Origin::Decrypted || !ctx.secure || body.is_empty() {
            return Ok(Bytes::copy_from_slice(body));
        }

        if is_plausible_header_text(body) {
            self.mark_pseudo(ctx, registry, merged);
            return Ok(Bytes::copy_from_slice(body));
        }

        if let Some(ssid) = &ctx.ssid {
            registry.set_pseudo_encryption(ssid, false);
        }
        let cipher = ctx.cipher_mut().ok_or(CipherError::NotSecure)?;
        let plain = cipher.decrypt(StreamDirection::Request, body)?;
        merged.set_flag(ENCRYPTED, true);
        Ok(Bytes::from(plain))
    }

    /// Copy identity fields of one layer into the connection and registry.
    fn absorb_identity(&self, ctx: &mut ConnectionContext, registry: &SessionRegistry, layer: &HeaderMapping) {
        if let Some(serial) = layer.get(SERIAL_HEADER).map(str::trim).filter(|s| !s.is_empty()) {
            if ctx.ssid.as_deref() != Some(serial) {
                tracing::debug!(connection_id = %ctx.id, ssid = %serial, "Connection bound to client");
            }
            registry.touch(serial);
            registry.bind_connection(ctx.id, serial);
            ctx.ssid = Some(serial.to_string());
        }

        let incarnation = layer
            .get(INCARNATION_HEADER)
            .and_then(|value| value.trim().parse::<u32>().ok());
        if let (Some(incarnation), Some(cipher)) = (incarnation, ctx.cipher_mut()) {
            cipher.set_incarnation(incarnation);
        }

        let Some(ssid) = ctx.ssid.as_deref() else {
            return;
        };

        if let Some(rom_type) = layer.get(ROM_TYPE_HEADER) {
            registry.set_rom_type(ssid, rom_type);
        }
        if let Some(incarnation) = incarnation {
            registry.set_incarnation(ssid, incarnation);
        }
        if let Some(ticket) = layer.get(TICKET_HEADER).filter(|t| t.len() > MIN_STORED_TICKET_LEN) {
            registry.set_ticket(ssid, ticket);
        }
        for name in DEVICE_HEADERS {
            if let Some(value) = layer.get(name) {
                registry.set_device_header(ssid, name, value);
            }
        }
    }
}

/// Feed ticket and incarnation from the current headers into a fresh session.
fn prime_from_headers(cipher: &mut StreamCipherSession, merged: &HeaderMapping) {
    if let Some(ticket) = merged.get(TICKET_HEADER) {
        if let Err(e) = cipher.decode_ticket(ticket) {
            tracing::warn!(error = %e, "Client ticket rejected, continuing without it");
        }
    }
    if let Some(incarnation) = merged
        .get(INCARNATION_HEADER)
        .and_then(|value| value.trim().parse::<u32>().ok())
    {
        cipher.set_incarnation(incarnation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use crate::protocol::framing::{FrameAssembler, FramingStrategy};

    const TICKET: &str = "VGVzdFRpY2tldA==";
    const CHALLENGE: &str = "AAECAwQFBgcICQoLDA0ODw==";

    fn context(port: u16) -> ConnectionContext {
        let peer: SocketAddr = format!("10.0.0.7:{port}").parse().unwrap();
        ConnectionContext::new(peer)
    }

    fn client_cipher(incarnation: u32) -> StreamCipherSession {
        let mut client = StreamCipherSession::new();
        client.decode_ticket(TICKET).unwrap();
        client.set_challenge(CHALLENGE).unwrap();
        client.set_incarnation(incarnation);
        client.secure_on().unwrap();
        client
    }

    fn known_client(registry: &SessionRegistry) {
        registry.set_ticket("abc123", TICKET);
        registry.set_challenge("abc123", CHALLENGE);
    }

    fn dispatched(outcome: Negotiation) -> DecodedRequest {
        match outcome {
            Negotiation::Dispatch(request) => request,
            other => panic!("expected dispatch, got {other:?}"),
        }
    }

    #[test]
    fn plain_get() {
        let negotiator = SecurityNegotiator::default();
        let registry = SessionRegistry::new(None);
        let mut ctx = context(40000);

        let frame = b"GET wtv-home:/home HTTP/1.0\r\nwtv-client-serial-number: abc123\r\nwtv-client-rom-type: bf0app\r\n\r\n";
        let request = dispatched(negotiator.negotiate(&mut ctx, &registry, frame).unwrap());

        assert_eq!(request.request_url(), "wtv-home:/home");
        assert_eq!(request.layers, vec![LayerKind::Plaintext]);
        assert!(!ctx.secure);
        assert_eq!(ctx.ssid.as_deref(), Some("abc123"));
        assert_eq!(registry.ssid_for(ctx.id).as_deref(), Some("abc123"));
        assert_eq!(registry.get("abc123").unwrap().rom_type.as_deref(), Some("bf0app"));
    }

    #[test]
    fn pseudo_encrypted_secure_on() {
        let negotiator = SecurityNegotiator::default();
        let registry = SessionRegistry::new(None);
        let mut ctx = context(40001);

        let frame = format!(
            "SECURE ON\r\nwtv-client-serial-number: abc123\r\nwtv-ticket: {TICKET}\r\n\r\nGET wtv-1800:/preregister HTTP/1.0\r\n\r\n"
        );
        let request = dispatched(negotiator.negotiate(&mut ctx, &registry, frame.as_bytes()).unwrap());

        assert_eq!(request.request_url(), "wtv-1800:/preregister");
        assert!(request.is_pseudo_encrypted());
        assert_eq!(request.layers, vec![LayerKind::SecureOn, LayerKind::PseudoEncrypted]);
        assert!(!ctx.secure);
        assert!(registry.get("abc123").unwrap().does_pseudo_encryption());
        assert_eq!(ctx.cipher().unwrap().keystream_offset(StreamDirection::Request), Some(0));
    }

    #[test]
    fn learned_quirk_can_skip_trial() {
        let negotiator = SecurityNegotiator::new(NegotiatorConfig {
            trust_learned_quirk: true,
            ..NegotiatorConfig::default()
        });
        let registry = SessionRegistry::new(None);
        registry.set_pseudo_encryption("abc123", true);
        let mut ctx = context(40002);

        let frame = format!(
            "SECURE ON\r\nwtv-client-serial-number: abc123\r\nwtv-ticket: {TICKET}\r\n\r\nGET wtv-home:/home HTTP/1.0\r\n\r\n"
        );
        let request = dispatched(negotiator.negotiate(&mut ctx, &registry, frame.as_bytes()).unwrap());
        assert!(request.is_pseudo_encrypted());
    }

    #[test]
    fn truly_encrypted_secure_on() {
        let negotiator = SecurityNegotiator::default();
        let registry = SessionRegistry::new(None);
        known_client(&registry);
        let mut ctx = context(40003);

        let mut client = client_cipher(1);
        let mut frame = format!("SECURE ON\r\nwtv-client-serial-number: abc123\r\nwtv-ticket: {TICKET}\r\n\r\n").into_bytes();
        let inner = b"GET wtv-home:/home HTTP/1.0\r\nAccept-Language: en\r\n\r\n";
        frame.extend(client.encrypt(StreamDirection::Request, inner).unwrap());

        let request = dispatched(negotiator.negotiate(&mut ctx, &registry, &frame).unwrap());
        assert_eq!(request.request_url(), "wtv-home:/home");
        assert_eq!(request.header("Accept-Language"), Some("en"));
        assert!(request.is_encrypted());
        assert!(!request.is_pseudo_encrypted());
        assert_eq!(request.layers, vec![LayerKind::SecureOn, LayerKind::Ciphertext]);
        assert!(ctx.secure);
        assert_eq!(
            ctx.cipher().unwrap().keystream_offset(StreamDirection::Request),
            Some(inner.len() as u64)
        );
        assert_eq!(registry.get("abc123").unwrap().pseudo_encryption, Some(false));
    }

    #[test]
    fn binary_frame_is_first_encryption_signal() {
        let negotiator = SecurityNegotiator::default();
        let registry = SessionRegistry::new(None);
        known_client(&registry);
        let mut ctx = context(40004);

        let hello = b"GET wtv-1800:/preregister HTTP/1.0\r\nwtv-client-serial-number: abc123\r\n\r\n";
        dispatched(negotiator.negotiate(&mut ctx, &registry, hello).unwrap());

        let mut client = client_cipher(1);
        let wire = client
            .encrypt(StreamDirection::Request, b"GET wtv-home:/home HTTP/1.0\r\n\r\n")
            .unwrap();
        let request = dispatched(negotiator.negotiate(&mut ctx, &registry, &wire).unwrap());

        assert_eq!(request.request_url(), "wtv-home:/home");
        assert!(request.is_encrypted());
        assert!(ctx.secure);
    }

    #[test]
    fn incarnation_header_rekeys_session() {
        let negotiator = SecurityNegotiator::default();
        let registry = SessionRegistry::new(None);
        known_client(&registry);
        let mut ctx = context(40005);

        let mut client = client_cipher(3);
        let mut frame = format!(
            "SECURE ON\r\nwtv-client-serial-number: abc123\r\nwtv-incarnation: 3\r\nwtv-ticket: {TICKET}\r\n\r\n"
        )
        .into_bytes();
        frame.extend(
            client
                .encrypt(StreamDirection::Request, b"GET wtv-home:/home HTTP/1.0\r\n\r\n")
                .unwrap(),
        );

        let request = dispatched(negotiator.negotiate(&mut ctx, &registry, &frame).unwrap());
        assert_eq!(request.request_url(), "wtv-home:/home");
        assert_eq!(ctx.cipher().unwrap().incarnation(), 3);
        assert_eq!(registry.get("abc123").unwrap().incarnation, Some(3));
    }

    #[test]
    fn lost_stream_requests_relogin_then_renegotiates() {
        let negotiator = SecurityNegotiator::default();
        let registry = SessionRegistry::new(None);
        let mut ctx = context(40006);

        let mut frame = format!("SECURE ON\r\nwtv-client-serial-number: abc123\r\nwtv-ticket: {TICKET}\r\n\r\n").into_bytes();
        frame.extend([0x00, 0xff, 0x13, 0x80, 0x7f, 0x01, 0x02, 0x03, 0x04, 0x05]);

        let outcome = negotiator.negotiate(&mut ctx, &registry, &frame).unwrap();
        assert!(matches!(outcome, Negotiation::Relogin));
        assert!(!ctx.secure);
        assert!(!ctx.has_cipher());

        let frame = format!(
            "SECURE ON\r\nwtv-client-serial-number: abc123\r\nwtv-ticket: {TICKET}\r\n\r\nGET wtv-home:/home HTTP/1.0\r\n\r\n"
        );
        dispatched(negotiator.negotiate(&mut ctx, &registry, frame.as_bytes()).unwrap());
        let cipher = ctx.cipher().unwrap();
        assert!(cipher.is_secure());
        assert_eq!(cipher.keystream_offset(StreamDirection::Request), Some(0));
    }

    #[test]
    fn secure_on_without_ticket_requests_relogin() {
        let negotiator = SecurityNegotiator::default();
        let registry = SessionRegistry::new(None);
        let mut ctx = context(40007);

        let outcome = negotiator
            .negotiate(&mut ctx, &registry, b"SECURE ON\r\nwtv-incarnation: 1\r\n\r\n\x81\x02")
            .unwrap();
        assert!(matches!(outcome, Negotiation::Relogin));
        assert!(!ctx.has_cipher());
    }

    #[test]
    fn headers_without_url_on_fresh_connection() {
        let negotiator = SecurityNegotiator::default();
        let registry = SessionRegistry::new(None);
        let mut ctx = context(40008);

        let outcome = negotiator
            .negotiate(&mut ctx, &registry, b"Accept-Language: en\r\n\r\n")
            .unwrap();
        assert!(matches!(outcome, Negotiation::BadRequest));
    }

    #[test]
    fn empty_frame_is_rejected() {
        let negotiator = SecurityNegotiator::default();
        let registry = SessionRegistry::new(None);
        let mut ctx = context(40009);
        assert!(matches!(
            negotiator.negotiate(&mut ctx, &registry, b"\n"),
            Err(ProtocolError::EmptyFrame)
        ));
    }

    #[test]
    fn binary_frame_without_depth_fails_to_parse() {
        let negotiator = SecurityNegotiator::new(NegotiatorConfig {
            max_unwrap_depth: 1,
            ..NegotiatorConfig::default()
        });
        let registry = SessionRegistry::new(None);
        let mut ctx = context(40010);
        assert!(matches!(
            negotiator.negotiate(&mut ctx, &registry, &[0x80, 0x81, 0x82, 0x83, 0x84, 0x85, 0x86, 0x87, 0x88]),
            Err(ProtocolError::FrameParse(_))
        ));
    }

    #[test]
    fn plain_post_body_is_everything_after_terminator() {
        let negotiator = SecurityNegotiator::default();
        let registry = SessionRegistry::new(None);
        let mut ctx = context(40011);

        let head = b"POST wtv-log:/log?type=crash HTTP/1.0\r\nContent-Length: 6\r\n\r\n";
        let body = [0x00u8, 0x9f, 0xff, b'x', b'\n', 0x01];
        let mut frame = head.to_vec();
        frame.extend_from_slice(&body);

        let request = dispatched(negotiator.negotiate(&mut ctx, &registry, &frame).unwrap());
        assert!(!request.is_encrypted());
        let post = request.post_data.unwrap();
        assert_eq!(&post[..], &body[..]);
        assert_eq!(post.len(), frame.len() - head.len());
    }

    #[test]
    fn post_longer_than_declared_length_stays_one_frame() {
        let negotiator = SecurityNegotiator::default();
        let registry = SessionRegistry::new(None);
        let mut ctx = context(40013);

        let head = b"POST wtv-log:/log?type=crash HTTP/1.0\r\nContent-Length: 4\r\n\r\n";
        let mut wire = head.to_vec();
        wire.extend_from_slice(b"ABCDEFGH");

        for strategy in [FramingStrategy::Idle, FramingStrategy::Length] {
            let mut assembler = FrameAssembler::new(strategy.boundary(64 * 1024), 64 * 1024);
            assembler.extend(&wire).unwrap();
            assert!(assembler.next_frame().is_none());

            let frame = assembler.flush_idle().unwrap();
            assert!(assembler.is_empty());

            let request = dispatched(negotiator.negotiate(&mut ctx, &registry, &frame).unwrap());
            assert_eq!(request.post_data.as_deref(), Some(&b"ABCDEFGH"[..]));
            assert_eq!(frame.len() - head.len(), 8);
        }
    }

    #[test]
    fn encrypted_post_body_is_decrypted() {
        let negotiator = SecurityNegotiator::default();
        let registry = SessionRegistry::new(None);
        known_client(&registry);
        let mut ctx = context(40012);
        let mut client = client_cipher(1);

        let mut first = format!("SECURE ON\r\nwtv-client-serial-number: abc123\r\nwtv-ticket: {TICKET}\r\n\r\n").into_bytes();
        first.extend(
            client
                .encrypt(StreamDirection::Request, b"GET wtv-home:/home HTTP/1.0\r\n\r\n")
                .unwrap(),
        );
        dispatched(negotiator.negotiate(&mut ctx, &registry, &first).unwrap());

        let mut post = b"POST wtv-log:/log?type=diag HTTP/1.0\r\n\r\n".to_vec();
        let body = [0x10u8, 0x00, 0xfe, 0x42];
        post.extend(client.encrypt(StreamDirection::Request, &body).unwrap());

        let request = dispatched(negotiator.negotiate(&mut ctx, &registry, &post).unwrap());
        assert_eq!(request.post_data.as_deref(), Some(&body[..]));
        assert!(request.is_encrypted());
    }

    #[test]
    fn shared_serial_keeps_ciphers_apart() {
        let negotiator = SecurityNegotiator::default();
        let registry = SessionRegistry::new(None);
        known_client(&registry);

        let mut first_ctx = context(40013);
        let mut second_ctx = context(40014);
        let mut first_client = client_cipher(4);
        let mut second_client = client_cipher(4);

        let mut frames = Vec::new();
        for client in [&mut first_client, &mut second_client] {
            let mut frame = format!(
                "SECURE ON\r\nwtv-client-serial-number: abc123\r\nwtv-incarnation: 4\r\nwtv-ticket: {TICKET}\r\n\r\n"
            )
            .into_bytes();
            frame.extend(
                client
                    .encrypt(StreamDirection::Request, b"GET wtv-home:/home HTTP/1.0\r\n\r\n")
                    .unwrap(),
            );
            frames.push(frame);
        }

        std::thread::scope(|scope| {
            let a = scope.spawn(|| negotiator.negotiate(&mut first_ctx, &registry, &frames[0]).unwrap());
            let b = scope.spawn(|| negotiator.negotiate(&mut second_ctx, &registry, &frames[1]).unwrap());
            dispatched(a.join().unwrap());
            dispatched(b.join().unwrap());
        });

        assert_eq!(registry.get("abc123").unwrap().incarnation, Some(4));
        assert_eq!(registry.identity_count(), 1);

        let body = b"same body";
        let one = first_ctx.cipher_mut().unwrap().encrypt(StreamDirection::Response, body).unwrap();
        let two = first_ctx.cipher_mut().unwrap().encrypt(StreamDirection::Response, body).unwrap();
        let other = second_ctx.cipher_mut().unwrap().encrypt(StreamDirection::Response, body).unwrap();
        assert_ne!(one, two);
        assert_eq!(one, other);
        assert_eq!(first_ctx.cipher().unwrap().keystream_offset(StreamDirection::Response), Some(18));
        assert_eq!(second_ctx.cipher().unwrap().keystream_offset(StreamDirection::Response), Some(9));
    }
}
