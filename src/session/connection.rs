//! Connection-scoped protocol state.
//!
//! Owned by the connection task; never shared. Dropping the context drops the
//! cipher session, which wipes its key material.

use std::net::SocketAddr;

use crate::crypto::StreamCipherSession;
use crate::net::ConnectionId;
use crate::session::registry::ClientIdentity;

/// Per-socket state carried between frames.
#[derive(Debug)]
pub struct ConnectionContext {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    /// Subsequent frames are expected encrypted and responses get encrypted.
    pub secure: bool,
    /// Also encrypt response header blocks.
    pub secure_headers: bool,
    /// Close gracefully after the next response.
    pub close_after_response: bool,
    /// Serial number last presented on this connection.
    pub ssid: Option<String>,
    cipher: Option<StreamCipherSession>,
}

impl ConnectionContext {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            id: ConnectionId::from_peer(&peer),
            peer,
            secure: false,
            secure_headers: false,
            close_after_response: false,
            ssid: None,
            cipher: None,
        }
    }

    pub fn cipher(&self) -> Option<&StreamCipherSession> {
        self.cipher.as_ref()
    }

    pub fn cipher_mut(&mut self) -> Option<&mut StreamCipherSession> {
        self.cipher.as_mut()
    }

    pub fn has_cipher(&self) -> bool {
        self.cipher.is_some()
    }

    /// Create a cipher session primed with what the identity remembers.
    ///
    /// A bad stored ticket or challenge is logged and skipped; the session
    /// then simply lacks that material.
    pub fn install_cipher(&mut self, identity: Option<&ClientIdentity>) -> &mut StreamCipherSession {
        let mut cipher = StreamCipherSession::new();

        if let Some(identity) = identity {
            if let Some(ticket) = &identity.ticket_b64 {
                if let Err(e) = cipher.decode_ticket(ticket) {
                    tracing::warn!(connection_id = %self.id, error = %e, "Stored ticket rejected");
                }
            }
            if let Some(challenge) = &identity.challenge_b64 {
                if let Err(e) = cipher.set_challenge(challenge) {
                    tracing::warn!(connection_id = %self.id, error = %e, "Stored challenge rejected");
                }
            }
            if let Some(incarnation) = identity.incarnation {
                cipher.set_incarnation(incarnation);
            }
        }

        self.cipher.insert(cipher)
    }

    pub fn drop_cipher(&mut self) {
        self.cipher = None;
    }

    /// Forget all encryption state, as after a lost stream.
    pub fn reset_security(&mut self) {
        self.secure = false;
        self.secure_headers = false;
        self.drop_cipher();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "192.168.1.20:1615".parse().unwrap()
    }

    #[test]
    fn id_follows_peer() {
        let ctx = ConnectionContext::new(peer());
        assert_eq!(ctx.id, ConnectionId::from_peer(&peer()));
        assert!(!ctx.secure);
        assert!(!ctx.has_cipher());
    }

    #[test]
    fn install_primes_from_identity() {
        let identity = ClientIdentity {
            ssid: "abc123".into(),
            ticket_b64: Some("VGVzdFRpY2tldA==".into()),
            incarnation: Some(5),
            ..ClientIdentity::default()
        };

        let mut ctx = ConnectionContext::new(peer());
        let cipher = ctx.install_cipher(Some(&identity));
        assert!(cipher.has_ticket());
        assert_eq!(cipher.incarnation(), 5);
    }

    #[test]
    fn install_tolerates_bad_ticket() {
        let identity = ClientIdentity {
            ssid: "abc123".into(),
            ticket_b64: Some("***".into()),
            ..ClientIdentity::default()
        };

        let mut ctx = ConnectionContext::new(peer());
        assert!(!ctx.install_cipher(Some(&identity)).has_ticket());
    }

    #[test]
    fn reset_clears_everything() {
        let mut ctx = ConnectionContext::new(peer());
        ctx.install_cipher(None);
        ctx.secure = true;
        ctx.secure_headers = true;

        ctx.reset_security();
        assert!(!ctx.secure);
        assert!(!ctx.secure_headers);
        assert!(!ctx.has_cipher());
    }
}
