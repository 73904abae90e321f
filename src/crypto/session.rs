//! Per-connection stream cipher session.
//!
//! # Responsibilities
//! - Issue and remember the challenge handed to the client
//! - Decode the client's ticket once per session
//! - Track the incarnation (rekey) counter
//! - Derive per-direction keystreams on `secure_on`
//! - Encrypt/decrypt byte streams with strictly advancing offsets
//!
//! # Design Decisions
//! - Request (client → server) and response (server → client) keystreams are
//!   independent; each keeps its own offset
//! - Trial decryption runs on a cloned keystream and only commits on success,
//!   so a rejected guess never burns keystream bytes
//! - Callers serialize access: one connection task owns one session

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::crypto::rc4::Rc4;

/// Shortest ticket the server accepts after base64 decoding.
const MIN_TICKET_LEN: usize = 8;

/// Challenge size in bytes.
const CHALLENGE_LEN: usize = 16;

/// Errors raised by the stream cipher session.
#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    /// The client-presented ticket could not be decoded or is too short.
    #[error("malformed credential: {0}")]
    MalformedCredential(String),
    /// `secure_on` was attempted without a decoded ticket.
    #[error("key derivation failed: no ticket decoded for this session")]
    KeyDerivation,
    /// A stored or presented challenge is not valid base64.
    #[error("malformed challenge: {0}")]
    MalformedChallenge(String),
    /// Encrypt/decrypt called before `secure_on`.
    #[error("stream cipher is not enabled")]
    NotSecure,
}

/// Logical keystream selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamDirection {
    /// Client → server (stream id 0).
    Request = 0,
    /// Server → client (stream id 1).
    Response = 1,
}

impl StreamDirection {
    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Debug)]
struct KeyStream {
    rc4: Rc4,
    offset: u64,
}

impl KeyStream {
    fn new(key: &[u8]) -> Self {
        Self {
            rc4: Rc4::new(key),
            offset: 0,
        }
    }

    fn apply(&mut self, data: &mut [u8]) {
        self.rc4.apply_keystream(data);
        self.offset += data.len() as u64;
    }
}

struct SessionKeys {
    request: Zeroizing<[u8; 16]>,
    response: Zeroizing<[u8; 16]>,
}

/// Keystream cipher state owned by exactly one connection.
pub struct StreamCipherSession {
    ticket: Option<Zeroizing<Vec<u8>>>,
    ticket_b64: Option<String>,
    challenge: Option<Zeroizing<Vec<u8>>>,
    challenge_consumed: bool,
    incarnation: u32,
    keys: Option<SessionKeys>,
    streams: Option<[KeyStream; 2]>,
}

impl StreamCipherSession {
    /// Create an empty session (no ticket, no challenge, not secure).
    pub fn new() -> Self {
        Self {
            ticket: None,
            ticket_b64: None,
            challenge: None,
            challenge_consumed: false,
            incarnation: 1,
            keys: None,
            streams: None,
        }
    }

    /// Return the pending challenge, generating one if none is outstanding.
    ///
    /// Repeated calls return the same value until `secure_on` consumes it.
    pub fn issue_challenge(&mut self) -> String {
        if let (Some(challenge), false) = (&self.challenge, self.challenge_consumed) {
            return BASE64_STANDARD.encode(challenge.as_slice());
        }

        let challenge = generate_challenge();
        let encoded = BASE64_STANDARD.encode(&challenge);
        self.challenge = Some(Zeroizing::new(challenge));
        self.challenge_consumed = false;
        encoded
    }

    /// Adopt a challenge issued elsewhere (e.g. by the login handler on an
    /// earlier connection).
    pub fn set_challenge(&mut self, challenge_b64: &str) -> Result<(), CipherError> {
        let challenge = BASE64_STANDARD
            .decode(challenge_b64.trim())
            .map_err(|e| CipherError::MalformedChallenge(e.to_string()))?;
        self.challenge = Some(Zeroizing::new(challenge));
        self.challenge_consumed = false;
        Ok(())
    }

    /// The most recent challenge, base64 encoded.
    pub fn challenge_b64(&self) -> Option<String> {
        self.challenge
            .as_ref()
            .map(|challenge| BASE64_STANDARD.encode(challenge.as_slice()))
    }

    /// Decode the client's ticket.
    ///
    /// Only the first successful decode is kept; later calls are no-ops.
    pub fn decode_ticket(&mut self, ticket_b64: &str) -> Result<(), CipherError> {
        if self.ticket.is_some() {
            return Ok(());
        }

        let ticket = BASE64_STANDARD
            .decode(ticket_b64.trim())
            .map_err(|e| CipherError::MalformedCredential(e.to_string()))?;

        if ticket.len() < MIN_TICKET_LEN {
            return Err(CipherError::MalformedCredential(format!(
                "ticket is {} bytes, expected at least {}",
                ticket.len(),
                MIN_TICKET_LEN
            )));
        }

        self.ticket = Some(Zeroizing::new(ticket));
        self.ticket_b64 = Some(ticket_b64.trim().to_string());
        Ok(())
    }

    /// The ticket as presented by the client, if one was decoded.
    pub fn ticket_b64(&self) -> Option<&str> {
        self.ticket_b64.as_deref()
    }

    pub fn has_ticket(&self) -> bool {
        self.ticket.is_some()
    }

    /// Set the rekey counter. A change on a secure session rekeys both streams.
    pub fn set_incarnation(&mut self, incarnation: u32) {
        if incarnation == self.incarnation {
            return;
        }
        self.incarnation = incarnation;

        if let Some(keys) = &self.keys {
            self.streams = Some(derive_streams(keys, incarnation));
            tracing::debug!(incarnation, "Stream cipher rekeyed for new incarnation");
        }
    }

    pub fn incarnation(&self) -> u32 {
        self.incarnation
    }

    /// Derive keystreams from ticket + challenge and start encrypting.
    pub fn secure_on(&mut self) -> Result<(), CipherError> {
        if self.ticket.is_none() {
            return Err(CipherError::KeyDerivation);
        }
        if self.challenge.is_none() || self.challenge_consumed {
            self.issue_challenge();
        }

        let ticket = self.ticket.as_ref().ok_or(CipherError::KeyDerivation)?;
        let challenge = self.challenge.as_ref().ok_or(CipherError::KeyDerivation)?;

        let mut hasher = Sha256::new();
        hasher.update(ticket.as_slice());
        hasher.update(challenge.as_slice());
        let mut digest = Zeroizing::new([0u8; 32]);
        digest.copy_from_slice(&hasher.finalize());

        let mut request = Zeroizing::new([0u8; 16]);
        let mut response = Zeroizing::new([0u8; 16]);
        request.copy_from_slice(&digest[..16]);
        response.copy_from_slice(&digest[16..32]);

        let keys = SessionKeys { request, response };
        self.streams = Some(derive_streams(&keys, self.incarnation));
        self.keys = Some(keys);
        self.challenge_consumed = true;
        Ok(())
    }

    /// Whether `secure_on` has run.
    pub fn is_secure(&self) -> bool {
        self.streams.is_some()
    }

    /// Encrypt `data` on the given stream, advancing its offset.
    pub fn encrypt(&mut self, direction: StreamDirection, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        self.apply(direction, data)
    }

    /// Decrypt `data` on the given stream, advancing its offset.
    pub fn decrypt(&mut self, direction: StreamDirection, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        self.apply(direction, data)
    }

    /// Decrypt on a copy of the keystream and keep the result only if
    /// `accept` approves the plaintext. On rejection the stream is untouched.
    pub fn decrypt_if<F>(
        &mut self,
        direction: StreamDirection,
        data: &[u8],
        accept: F,
    ) -> Result<Option<Vec<u8>>, CipherError>
    where
        F: FnOnce(&[u8]) -> bool,
    {
        let streams = self.streams.as_mut().ok_or(CipherError::NotSecure)?;
        let slot = &mut streams[direction.index()];

        let mut trial = slot.clone();
        let mut out = data.to_vec();
        trial.apply(&mut out);

        if accept(&out) {
            *slot = trial;
            Ok(Some(out))
        } else {
            Ok(None)
        }
    }

    /// Bytes consumed so far on the given stream.
    pub fn keystream_offset(&self, direction: StreamDirection) -> Option<u64> {
        self.streams
            .as_ref()
            .map(|streams| streams[direction.index()].offset)
    }

    fn apply(&mut self, direction: StreamDirection, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        let streams = self.streams.as_mut().ok_or(CipherError::NotSecure)?;
        let mut out = data.to_vec();
        streams[direction.index()].apply(&mut out);
        Ok(out)
    }
}

impl Default for StreamCipherSession {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StreamCipherSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCipherSession")
            .field("has_ticket", &self.has_ticket())
            .field("incarnation", &self.incarnation)
            .field("secure", &self.is_secure())
            .field("request_offset", &self.keystream_offset(StreamDirection::Request))
            .field("response_offset", &self.keystream_offset(StreamDirection::Response))
            .finish()
    }
}

fn derive_streams(keys: &SessionKeys, incarnation: u32) -> [KeyStream; 2] {
    let request = derive_stream_key(&keys.request, incarnation);
    let response = derive_stream_key(&keys.response, incarnation);
    [KeyStream::new(request.as_slice()), KeyStream::new(response.as_slice())]
}

fn derive_stream_key(session_key: &[u8; 16], incarnation: u32) -> Zeroizing<[u8; 16]> {
    let mut hasher = Sha256::new();
    hasher.update(session_key);
    hasher.update(incarnation.to_be_bytes());
    hasher.update(session_key);
    let digest = hasher.finalize();

    let mut key = Zeroizing::new([0u8; 16]);
    key.copy_from_slice(&digest[..16]);
    key
}

/// Fresh random challenge bytes.
pub fn generate_challenge() -> Vec<u8> {
    let mut challenge = vec![0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut challenge);
    challenge
}

/// The response a client holding `ticket_b64` must send back for `challenge_b64`.
pub fn expected_challenge_response(ticket_b64: &str, challenge_b64: &str) -> Result<String, CipherError> {
    let ticket = Zeroizing::new(
        BASE64_STANDARD
            .decode(ticket_b64.trim())
            .map_err(|e| CipherError::MalformedCredential(e.to_string()))?,
    );
    let challenge = BASE64_STANDARD
        .decode(challenge_b64.trim())
        .map_err(|e| CipherError::MalformedChallenge(e.to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(b"wtv-challenge-response");
    hasher.update(ticket.as_slice());
    hasher.update(&challenge);
    Ok(BASE64_STANDARD.encode(hasher.finalize()))
}
