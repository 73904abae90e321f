//! Session cryptography subsystem.
//!
//! # Data Flow
//! ```text
//! wtv-ticket (base64)  ──▶ DecodeTicket ─┐
//! challenge (random)   ──▶ IssueChallenge ┼─▶ SecureOn ─▶ session keys
//! wtv-incarnation      ──▶ SetIncarnation ┘                │
//!                                                           ▼
//!                                   stream 0 (client → server): Decrypt
//!                                   stream 1 (server → client): Encrypt
//! ```
//!
//! # Design Decisions
//! - One keystream per direction, each with its own running offset
//! - Keystream state is never shared between connections
//! - Key material is wiped on drop

pub mod rc4;
pub mod session;

pub use session::{
    expected_challenge_response, generate_challenge, CipherError, StreamCipherSession,
    StreamDirection,
};
