//! Inbound frame assembly.
//!
//! # Responsibilities
//! - Buffer raw socket bytes per connection
//! - Ask a `FrameBoundary` strategy whether the buffer holds a complete frame
//! - Hand out complete frames, keeping any trailing bytes for the next one
//! - Flush the whole buffer as one frame when the idle timer fires
//!
//! # State Machine
//! ```text
//! AwaitingData ──(blank line seen)──▶ HeaderComplete ──(idle timer)──▶ dispatch
//!                        │
//!                        ├──(declared body short)──▶ AwaitingMoreBody
//!                        └──(declared body present)─▶ BodyComplete ──▶ dispatch
//! ```
//!
//! # Design Decisions
//! - The socket level has no length framing; legacy clients rely on the
//!   server dispatching after a quiet period. `IdleFraming` keeps that exactly
//!   and is the default.
//! - `LengthFraming` is opt-in. It completes frames early when the bytes make
//!   the boundary obvious and falls back to the idle timer otherwise.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::protocol::classify::{is_plausible_header_text, latin1_to_string, split_header_block};
use crate::protocol::headers::{self, REQUEST_LINE, SECURE};

/// Errors raised while buffering inbound bytes.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame exceeds {limit} bytes (would be {attempted})")]
    TooLarge { limit: usize, attempted: usize },
}

/// Where the assembler is within the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// No header terminator buffered yet.
    AwaitingData,
    /// Header block complete; only the idle timer can end the frame.
    HeaderComplete,
    /// Header block complete, declared body not fully buffered.
    AwaitingMoreBody,
    /// A complete frame was just handed out.
    BodyComplete,
}

/// A boundary strategy's verdict on the buffered bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDecision {
    /// The first `n` bytes form a complete frame.
    Complete(usize),
    /// More bytes are needed before a boundary can be decided.
    NeedMore,
    /// The bytes carry no usable length; wait for the idle timer.
    Undelimited,
}

/// Replaceable frame boundary policy.
pub trait FrameBoundary: Send + Sync + std::fmt::Debug {
    fn decide(&self, buffered: &[u8]) -> FrameDecision;
}

/// Legacy policy: every frame ends on the idle timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdleFraming;

impl FrameBoundary for IdleFraming {
    fn decide(&self, buffered: &[u8]) -> FrameDecision {
        if split_header_block(buffered).terminated {
            FrameDecision::Undelimited
        } else {
            FrameDecision::NeedMore
        }
    }
}

/// Length-aware policy.
///
/// Plaintext header blocks end the frame at the blank line, or after
/// `Content-Length` body bytes when declared. POSTs, `SECURE ON` blocks and
/// binary blocks fall back to the idle timer, so a POST body is always every
/// byte after the terminator.
#[derive(Debug, Clone, Copy)]
pub struct LengthFraming {
    max_frame_bytes: usize,
}

impl LengthFraming {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl FrameBoundary for LengthFraming {
    fn decide(&self, buffered: &[u8]) -> FrameDecision {
        let block = split_header_block(buffered);
        if !block.terminated {
            return FrameDecision::NeedMore;
        }
        if !is_plausible_header_text(block.head) {
            return FrameDecision::Undelimited;
        }

        let headers = headers::parse(&latin1_to_string(block.head), false);

        let is_post = headers
            .get(REQUEST_LINE)
            .is_some_and(|line| line.starts_with("POST"));
        if headers.flag(SECURE) || is_post {
            return FrameDecision::Undelimited;
        }

        let declared = headers
            .get_ignore_case("Content-Length")
            .and_then(|value| value.trim().parse::<usize>().ok());
        if let Some(length) = declared {
            return match block.body_offset.checked_add(length) {
                Some(total) if total <= self.max_frame_bytes => {
                    if buffered.len() >= total {
                        FrameDecision::Complete(total)
                    } else {
                        FrameDecision::NeedMore
                    }
                }
                _ => FrameDecision::Undelimited,
            };
        }

        FrameDecision::Complete(block.body_offset)
    }
}

/// Configured framing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FramingStrategy {
    /// Dispatch only on the idle timer.
    #[default]
    Idle,
    /// Dispatch as soon as the boundary is known, idle timer otherwise.
    Length,
}

impl FramingStrategy {
    pub fn boundary(self, max_frame_bytes: usize) -> Arc<dyn FrameBoundary> {
        match self {
            FramingStrategy::Idle => Arc::new(IdleFraming),
            FramingStrategy::Length => Arc::new(LengthFraming::new(max_frame_bytes)),
        }
    }
}

/// Per-connection inbound buffer.
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: BytesMut,
    boundary: Arc<dyn FrameBoundary>,
    max_frame_bytes: usize,
    state: FrameState,
}

impl FrameAssembler {
    pub fn new(boundary: Arc<dyn FrameBoundary>, max_frame_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            boundary,
            max_frame_bytes,
            state: FrameState::AwaitingData,
        }
    }

    /// Append a chunk read from the socket.
    pub fn extend(&mut self, chunk: &[u8]) -> Result<(), FrameError> {
        let attempted = self.buffer.len() + chunk.len();
        if attempted > self.max_frame_bytes {
            return Err(FrameError::TooLarge {
                limit: self.max_frame_bytes,
                attempted,
            });
        }
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    /// Take the next complete frame, if the strategy can delimit one.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            self.state = FrameState::AwaitingData;
            return None;
        }

        let terminated = split_header_block(&self.buffer).terminated;
        match self.boundary.decide(&self.buffer) {
            FrameDecision::Complete(len) if len > 0 && len <= self.buffer.len() => {
                self.state = FrameState::BodyComplete;
                Some(self.buffer.split_to(len).freeze())
            }
            FrameDecision::Complete(_) | FrameDecision::NeedMore => {
                self.state = if terminated {
                    FrameState::AwaitingMoreBody
                } else {
                    FrameState::AwaitingData
                };
                None
            }
            FrameDecision::Undelimited => {
                self.state = if terminated {
                    FrameState::HeaderComplete
                } else {
                    FrameState::AwaitingData
                };
                None
            }
        }
    }

    /// Idle timer fired: everything buffered is one frame.
    pub fn flush_idle(&mut self) -> Option<Bytes> {
        self.state = FrameState::AwaitingData;
        if self.buffer.is_empty() {
            return None;
        }
        Some(self.buffer.split().freeze())
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = FrameState::AwaitingData;
    }
}
