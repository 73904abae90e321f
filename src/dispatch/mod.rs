//! Request dispatch.
//!
//! # Responsibilities
//! - Route decoded requests by `service:/path` to built-in handlers
//! - Serve static content and raw responses from the service vault
//! - Produce the canned error, stranger and relogin pages
//! - Render the advertised `wtv-service` table
//!
//! # Data Flow
//! ```text
//! DecodedRequest ─▶ Dispatcher ─┬─▶ Handler (longest prefix)
//!                               ├─▶ ServiceVault
//!                               └─▶ pages::not_found
//! ```

pub mod handlers;
pub mod pages;
pub mod router;
pub mod services;
pub mod vault;

pub use handlers::register_builtin;
pub use router::{DispatchError, Dispatched, Dispatcher, Handler, HandlerContext};
pub use services::{Service, ServiceTable};
pub use vault::ServiceVault;
