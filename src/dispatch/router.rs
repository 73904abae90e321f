//! Request routing.
//!
//! # Responsibilities
//! - Match `service:/path` URLs against registered handler prefixes
//! - Fall back to the service vault, then to a 404 page
//! - Turn handler failures into the internal-error page
//!
//! # Design Decisions
//! - Handlers are registered up front; nothing is evaluated at request time
//! - Longest matching prefix wins
//! - Handlers are synchronous; the server runs them on the blocking pool

use std::path::PathBuf;
use std::sync::Arc;

use crate::dispatch::pages;
use crate::dispatch::services::ServiceTable;
use crate::dispatch::vault::ServiceVault;
use crate::net::ConnectionId;
use crate::protocol::{DecodedRequest, Response};
use crate::session::SessionRegistry;

/// Errors raised while producing a response.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("service {0} is not configured")]
    UnknownService(String),
}

/// Shared state a handler may consult.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub connection_id: ConnectionId,
    pub services: Arc<ServiceTable>,
    pub registry: SessionRegistry,
    pub log_dir: PathBuf,
}

/// Produces a response for a decoded request.
pub trait Handler: Send + Sync {
    fn handle(&self, request: &DecodedRequest, ctx: &HandlerContext) -> Result<Response, DispatchError>;
}

/// A response plus whether the connection should close after it.
#[derive(Debug)]
pub struct Dispatched {
    pub response: Response,
    pub close: bool,
}

impl Dispatched {
    fn keep(response: Response) -> Self {
        Self { response, close: false }
    }

    fn close(response: Response) -> Self {
        Self { response, close: true }
    }
}

/// Routes decoded requests to handlers and vault content.
pub struct Dispatcher {
    handlers: Vec<(String, Arc<dyn Handler>)>,
    vault: ServiceVault,
    show_error_details: bool,
}

impl Dispatcher {
    pub fn new(vault: ServiceVault, show_error_details: bool) -> Self {
        Self {
            handlers: Vec::new(),
            vault,
            show_error_details,
        }
    }

    /// Register `handler` for URLs starting with `prefix` (`service:/path`).
    pub fn register(&mut self, prefix: impl Into<String>, handler: Arc<dyn Handler>) {
        let prefix = prefix.into();
        tracing::debug!(prefix = %prefix, "Handler registered");
        self.handlers.push((prefix, handler));
        self.handlers.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    }

    pub fn vault(&self) -> &ServiceVault {
        &self.vault
    }

    /// Internal-error page, with `detail` only when disclosure is enabled.
    pub fn error_page(&self, detail: &str) -> Response {
        pages::internal_error(self.show_error_details.then_some(detail))
    }

    /// Produce the response for `request`.
    pub fn dispatch(&self, request: &DecodedRequest, ctx: &HandlerContext) -> Dispatched {
        let short_url = request.short_url();

        if let Some((service, path)) = short_url.split_once(":/").filter(|_| !short_url.contains("://")) {
            tracing::info!(
                connection_id = %ctx.connection_id,
                request_id = %request.request_id,
                ssid = ?request.ssid,
                kind = request.kind(),
                url = %request.request_url(),
                "Request"
            );

            let routed = match self.handler_for(short_url) {
                Some(handler) => handler.handle(request, ctx).map(Some),
                None => self.vault.lookup(service, path),
            };

            return match routed {
                Ok(Some(response)) => Dispatched::keep(response),
                Ok(None) => {
                    tracing::debug!(url = %short_url, "Nothing to serve");
                    Dispatched::keep(pages::not_found())
                }
                Err(e) => {
                    tracing::warn!(url = %short_url, error = %e, "Request handling failed");
                    Dispatched::keep(self.error_page(&e.to_string()))
                }
            };
        }

        if short_url.contains("http://") {
            tracing::info!(connection_id = %ctx.connection_id, url = %short_url, "Proxy request refused");
            return Dispatched::close(self.error_page("proxy requests are not supported"));
        }

        if short_url.starts_with('/') {
            tracing::info!(connection_id = %ctx.connection_id, url = %short_url, "Request from a non-WTV client");
            return Dispatched::close(pages::stranger());
        }

        tracing::info!(connection_id = %ctx.connection_id, url = %short_url, "Unroutable request url");
        Dispatched::close(self.error_page(&format!("cannot route '{}'", short_url)))
    }

    fn handler_for(&self, short_url: &str) -> Option<&Arc<dyn Handler>> {
        self.handlers
            .iter()
            .find(|(prefix, _)| short_url.starts_with(prefix.as_str()))
            .map(|(_, handler)| handler)
    }
}
