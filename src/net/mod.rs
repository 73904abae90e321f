//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Service ports (de-duplicated)
//!     → listener.rs (accept loop, shared connection limit)
//!     → connection.rs (peer-derived ID, lifecycle tracking)
//!     → Hand off to the per-connection session task
//! ```
//!
//! # Design Decisions
//! - One semaphore bounds connections across every bound port
//! - Each connection tracked for graceful shutdown
//! - No TLS: the protocol carries its own stream encryption

pub mod connection;
pub mod listener;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use listener::{dedup_ports, ConnectionPermit, Listener, ListenerError};
