//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::protocol::FramingStrategy;

/// Root configuration for the WTVP server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener settings shared by every service port.
    pub server: ListenerConfig,

    /// Inbound frame assembly.
    pub framing: FramingConfig,

    /// Encryption negotiation and error disclosure.
    pub security: SecurityConfig,

    /// On-disk content.
    pub vault: VaultConfig,

    /// Client identity persistence.
    pub registry: RegistryConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Service definitions keyed by service name (`wtv-1800`, ...).
    pub services: BTreeMap<String, ServiceConfig>,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Address advertised to clients in `wtv-service` lines.
    pub service_ip: String,

    /// Interface to bind every service port on.
    pub bind_host: String,

    /// Maximum concurrent connections across all ports (backpressure).
    pub max_connections: usize,

    /// Seconds to wait for connections to drain on shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            service_ip: "127.0.0.1".to_string(),
            bind_host: "0.0.0.0".to_string(),
            max_connections: 1_024,
            shutdown_timeout_secs: 10,
        }
    }
}

/// Frame assembly configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FramingConfig {
    /// Frame boundary policy.
    pub strategy: FramingStrategy,

    /// Quiet period after which buffered bytes are dispatched as one frame.
    pub idle_dispatch_ms: u64,

    /// Largest frame accepted before the connection is dropped.
    pub max_frame_bytes: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            strategy: FramingStrategy::Idle,
            idle_dispatch_ms: 300_000,
            max_frame_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Security negotiation configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Layers a frame may be unwrapped into, the outer one included.
    pub max_unwrap_depth: usize,

    /// Skip trial decryption for clients already known to pseudo-encrypt.
    pub trust_learned_quirk: bool,

    /// Encrypt response header blocks on secure connections.
    pub encrypt_headers: bool,

    /// Include error detail in internal-error pages.
    pub show_error_details: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_unwrap_depth: 2,
            trust_learned_quirk: false,
            encrypt_headers: false,
            show_error_details: true,
        }
    }
}

/// Content locations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Root of the per-service content tree.
    pub root: PathBuf,

    /// Directory for client log uploads.
    pub log_dir: PathBuf,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("ServiceVault"),
            log_dir: PathBuf::from("ServiceLogPost"),
        }
    }
}

/// Identity registry configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RegistryConfig {
    /// JSON snapshot loaded at start and written at shutdown.
    pub persistence_path: Option<PathBuf>,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// One logical service.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ServiceConfig {
    /// Port clients are told to use; bound unless `nobind`.
    pub port: Option<u16>,

    /// Advertised host; defaults to `server.service_ip`.
    pub host: Option<String>,

    pub flags: Option<String>,

    pub connections: Option<u32>,

    /// Advertise only, do not listen.
    pub nobind: bool,

    /// Persist uploads received by this service.
    pub write_logs_to_disk: bool,
}
