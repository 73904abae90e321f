//! WTVP server: listeners, accept loops and shared state.
//!
//! # Responsibilities
//! - Bind one listener per distinct service port
//! - Spawn one task per accepted connection
//! - Own the state every connection shares: service table, dispatcher,
//!   identity registry and negotiator
//! - Swap the service table when the configuration file changes
//!
//! # Data Flow
//! ```text
//! Listener (per port) ─▶ accept ─▶ connection task
//!                                      │
//!                      FrameAssembler ─▶ SecurityNegotiator ─▶ Dispatcher (blocking pool)
//!                                                                   │
//!                                           socket ◀─ ResponseEncoder
//! ```
//!
//! # Design Decisions
//! - Frames within one connection are processed strictly in order
//! - The registry is the only mutable state shared between connections
//! - Port changes on reload are logged; they take effect after a restart

mod connection;

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures_util::future::join_all;
use tokio::sync::{broadcast, mpsc, Semaphore};

use crate::config::ServerConfig;
use crate::dispatch::{register_builtin, Dispatched, Dispatcher, HandlerContext, ServiceTable, ServiceVault};
use crate::lifecycle::Shutdown;
use crate::net::{ConnectionId, ConnectionTracker, Listener, ListenerError};
use crate::protocol::framing::FrameBoundary;
use crate::protocol::{DecodedRequest, NegotiatorConfig, SecurityNegotiator};
use crate::session::SessionRegistry;

/// State shared by every connection task.
pub(crate) struct Shared {
    pub(crate) config: ServerConfig,
    pub(crate) services: ArcSwap<ServiceTable>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) registry: SessionRegistry,
    pub(crate) negotiator: SecurityNegotiator,
    pub(crate) tracker: ConnectionTracker,
    pub(crate) boundary: Arc<dyn FrameBoundary>,
    connection_limit: Arc<Semaphore>,
}

impl Shared {
    /// Run the dispatcher on the blocking pool; a panicking handler becomes
    /// the internal-error page.
    pub(crate) async fn dispatch(&self, request: DecodedRequest, connection_id: ConnectionId) -> Dispatched {
        let dispatcher = Arc::clone(&self.dispatcher);
        let ctx = HandlerContext {
            connection_id,
            services: self.services.load_full(),
            registry: self.registry.clone(),
            log_dir: self.config.vault.log_dir.clone(),
        };

        match tokio::task::spawn_blocking(move || dispatcher.dispatch(&request, &ctx)).await {
            Ok(dispatched) => dispatched,
            Err(e) => {
                tracing::error!(connection_id = %connection_id, error = %e, "Handler panicked");
                Dispatched {
                    response: self.dispatcher.error_page("the request handler failed"),
                    close: false,
                }
            }
        }
    }
}

/// The WTVP session server.
#[derive(Clone)]
pub struct WtvpServer {
    shared: Arc<Shared>,
}

impl WtvpServer {
    pub fn new(config: ServerConfig, registry: SessionRegistry) -> Self {
        let mut dispatcher = Dispatcher::new(
            ServiceVault::new(&config.vault.root),
            config.security.show_error_details,
        );
        register_builtin(&mut dispatcher);

        let negotiator = SecurityNegotiator::new(NegotiatorConfig {
            max_unwrap_depth: config.security.max_unwrap_depth,
            trust_learned_quirk: config.security.trust_learned_quirk,
            encrypt_headers: config.security.encrypt_headers,
        });

        let shared = Shared {
            services: ArcSwap::from_pointee(ServiceTable::from_config(&config)),
            dispatcher: Arc::new(dispatcher),
            registry,
            negotiator,
            tracker: ConnectionTracker::new(),
            boundary: config.framing.strategy.boundary(config.framing.max_frame_bytes),
            connection_limit: Arc::new(Semaphore::new(config.server.max_connections)),
            config,
        };

        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.shared.registry
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.shared.tracker
    }

    /// Current service table.
    pub fn services(&self) -> Arc<ServiceTable> {
        self.shared.services.load_full()
    }

    /// Publish the service table of a reloaded configuration.
    pub fn apply_config(&self, config: &ServerConfig) {
        let table = ServiceTable::from_config(config);
        let current = self.shared.services.load();

        if table.bind_ports() != current.bind_ports() {
            tracing::warn!(
                bound = ?current.bind_ports(),
                configured = ?table.bind_ports(),
                "Service ports changed; restart to bind them"
            );
        }

        tracing::info!(services = table.len(), "Service table reloaded");
        self.shared.services.store(Arc::new(table));
    }

    /// Apply every configuration the watcher publishes.
    pub async fn watch_config(&self, mut updates: mpsc::UnboundedReceiver<ServerConfig>) {
        while let Some(config) = updates.recv().await {
            self.apply_config(&config);
        }
    }

    /// Bind every configured service port.
    pub async fn bind(&self) -> Result<Vec<Listener>, ListenerError> {
        let ports = self.shared.services.load().bind_ports();
        if ports.is_empty() {
            tracing::warn!("No service ports configured");
        }

        let mut listeners = Vec::with_capacity(ports.len());
        for port in ports {
            listeners.push(
                Listener::bind(
                    &self.shared.config.server.bind_host,
                    port,
                    Arc::clone(&self.shared.connection_limit),
                )
                .await?,
            );
        }
        Ok(listeners)
    }

    /// Bind and serve until `shutdown` fires.
    pub async fn run(&self, shutdown: &Shutdown) -> Result<(), ListenerError> {
        let listeners = self.bind().await?;
        self.serve(listeners, shutdown).await;
        Ok(())
    }

    /// Serve already bound listeners until `shutdown` fires.
    pub async fn serve(&self, listeners: Vec<Listener>, shutdown: &Shutdown) {
        let loops = listeners
            .into_iter()
            .map(|listener| self.accept_loop(listener, shutdown.subscribe(), shutdown.clone()));
        join_all(loops).await;
        tracing::info!("All listeners stopped");
    }

    /// Wait for live connections to finish.
    pub async fn drain(&self) -> bool {
        let deadline = Duration::from_secs(self.shared.config.server.shutdown_timeout_secs);
        let drained = self.shared.tracker.wait_for_drain(deadline).await;
        if !drained {
            tracing::warn!(
                active = self.shared.tracker.active_count(),
                "Connections still open after shutdown deadline"
            );
        }
        drained
    }

    async fn accept_loop(&self, listener: Listener, mut stop: broadcast::Receiver<()>, shutdown: Shutdown) {
        let address = listener
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        tracing::info!(address = %address, "Accepting connections");

        loop {
            tokio::select! {
                _ = stop.recv() => {
                    tracing::info!(address = %address, "Listener shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer, permit)) => {
                        let shared = Arc::clone(&self.shared);
                        let stop = shutdown.subscribe();
                        tokio::spawn(connection::handle_connection(shared, stream, peer, permit, stop));
                    }
                    Err(ListenerError::LimiterClosed) => break,
                    Err(e) => {
                        tracing::warn!(address = %address, error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }
    }
}
