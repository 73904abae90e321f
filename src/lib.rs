//! WTVP session server library.

pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod protocol;
pub mod server;
pub mod session;

pub use config::schema::ServerConfig;
pub use lifecycle::Shutdown;
pub use server::WtvpServer;
pub use session::SessionRegistry;
