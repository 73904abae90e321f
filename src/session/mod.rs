//! Session state subsystem.
//!
//! # Data Flow
//! ```text
//! accepted socket → ConnectionContext (owned by the connection task)
//!                         │ ssid
//!                         ▼
//!                  SessionRegistry (shared, keyed by serial number)
//! ```
//!
//! # Design Decisions
//! - Connection state is a plain owned struct, not a global table
//! - Identities outlive connections and are shared through DashMap
//! - The registry snapshot is optional; without it identities die with the process

pub mod connection;
pub mod registry;

pub use connection::ConnectionContext;
pub use registry::{ClientIdentity, RegistryError, SessionRegistry, DEVICE_HEADERS};
