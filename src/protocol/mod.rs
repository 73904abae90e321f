//! Protocol session engine.
//!
//! # Data Flow
//! ```text
//! socket bytes
//!     → framing.rs (FrameAssembler, boundary strategy, idle flush)
//!     → negotiator.rs (classify.rs + headers.rs + crypto, layer by layer)
//!     → request.rs (DecodedRequest)
//!     → dispatcher
//!     → response.rs (defaults, encryption, teardown)
//!     → socket bytes
//! ```
//!
//! # Design Decisions
//! - Frames are processed strictly in arrival order per connection
//! - Header mappings keep insertion order and duplicate names
//! - Heuristic classification is isolated in classify.rs

pub mod classify;
pub mod framing;
pub mod headers;
pub mod negotiator;
pub mod request;
pub mod response;

pub use framing::{FrameAssembler, FrameBoundary, FrameDecision, FrameError, FrameState, FramingStrategy};
pub use headers::{HeaderMapping, QueryParams};
pub use negotiator::{Negotiation, NegotiatorConfig, ProtocolError, SecurityNegotiator};
pub use request::{DecodedRequest, LayerKind};
pub use response::{EncodedResponse, Response, ResponseEncoder, Teardown};
