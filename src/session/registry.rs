//! Client identity registry.
//!
//! Identities are keyed by the client serial number (SSID) and outlive any one
//! TCP connection, so a reconnecting box resumes its incarnation counter,
//! ticket and learned quirks. Connection bindings map the per-peer connection
//! ID to the SSID it last presented.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::net::ConnectionId;

/// Device headers remembered per identity.
pub const DEVICE_HEADERS: [&str; 6] = [
    "wtv-capability-flags",
    "wtv-system-version",
    "wtv-client-bootrom-version",
    "wtv-system-chipversion",
    "wtv-system-sysconfig",
    "wtv-system-cpuspeed",
];

/// Errors from snapshot persistence.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("registry snapshot is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Everything the server remembers about one client box.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    /// Client serial number.
    pub ssid: String,
    /// `wtv-client-rom-type` as last reported.
    pub rom_type: Option<String>,
    /// Last incarnation counter seen.
    pub incarnation: Option<u32>,
    /// Learned quirk: the box flags SECURE ON but sends plaintext.
    pub pseudo_encryption: Option<bool>,
    /// Last ticket presented (base64).
    pub ticket_b64: Option<String>,
    /// Last challenge issued to the box (base64).
    pub challenge_b64: Option<String>,
    /// Selected device headers.
    #[serde(default)]
    pub device: BTreeMap<String, String>,
    /// Seconds since the epoch at last sighting.
    pub last_seen: u64,
}

impl ClientIdentity {
    fn new(ssid: &str) -> Self {
        Self {
            ssid: ssid.to_string(),
            last_seen: now_secs(),
            ..Self::default()
        }
    }

    /// Whether the box is known to send plaintext under SECURE ON.
    pub fn does_pseudo_encryption(&self) -> bool {
        self.pseudo_encryption == Some(true)
    }
}

/// Concurrency-safe identity store shared by all connections.
///
/// Updates are per-field, last writer wins.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    identities: Arc<DashMap<String, ClientIdentity>>,
    connections: Arc<DashMap<ConnectionId, String>>,
    persistence_path: Option<PathBuf>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new(persistence_path: Option<PathBuf>) -> Self {
        Self {
            identities: Arc::new(DashMap::new()),
            connections: Arc::new(DashMap::new()),
            persistence_path,
        }
    }

    /// Create a registry, loading the snapshot at `path` when it exists.
    pub fn load_from_file(path: &Path) -> Result<Self, RegistryError> {
        let registry = Self::new(Some(path.to_path_buf()));
        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            let identities: Vec<ClientIdentity> = serde_json::from_reader(reader)?;
            for identity in identities {
                registry.identities.insert(identity.ssid.clone(), identity);
            }
            metrics::gauge!("wtvp_identities").set(registry.identities.len() as f64);
            tracing::info!(count = registry.identities.len(), path = ?path, "Loaded client identities");
        }
        Ok(registry)
    }

    /// Write the snapshot, if a persistence path is configured.
    pub fn save_to_file(&self) -> Result<(), RegistryError> {
        let Some(path) = &self.persistence_path else {
            return Ok(());
        };

        let mut identities: Vec<ClientIdentity> =
            self.identities.iter().map(|entry| entry.value().clone()).collect();
        identities.sort_by(|a, b| a.ssid.cmp(&b.ssid));

        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, &identities)?;
        tracing::info!(count = identities.len(), path = ?path, "Saved client identities");
        Ok(())
    }

    /// Look up an identity, creating it on first sight.
    pub fn touch(&self, ssid: &str) -> ClientIdentity {
        let mut entry = self
            .identities
            .entry(ssid.to_string())
            .or_insert_with(|| ClientIdentity::new(ssid));
        entry.last_seen = now_secs();
        let identity = entry.clone();
        drop(entry);
        metrics::gauge!("wtvp_identities").set(self.identities.len() as f64);
        identity
    }

    /// Snapshot of an identity.
    pub fn get(&self, ssid: &str) -> Option<ClientIdentity> {
        self.identities.get(ssid).map(|entry| entry.value().clone())
    }

    /// Mutate an identity in place, creating it if needed.
    pub fn update<F>(&self, ssid: &str, f: F)
    where
        F: FnOnce(&mut ClientIdentity),
    {
        let mut entry = self
            .identities
            .entry(ssid.to_string())
            .or_insert_with(|| ClientIdentity::new(ssid));
        f(entry.value_mut());
    }

    pub fn set_rom_type(&self, ssid: &str, rom_type: &str) {
        self.update(ssid, |identity| identity.rom_type = Some(rom_type.to_string()));
    }

    pub fn set_incarnation(&self, ssid: &str, incarnation: u32) {
        self.update(ssid, |identity| identity.incarnation = Some(incarnation));
    }

    pub fn set_pseudo_encryption(&self, ssid: &str, learned: bool) {
        self.update(ssid, |identity| identity.pseudo_encryption = Some(learned));
    }

    pub fn set_ticket(&self, ssid: &str, ticket_b64: &str) {
        self.update(ssid, |identity| identity.ticket_b64 = Some(ticket_b64.to_string()));
    }

    pub fn set_challenge(&self, ssid: &str, challenge_b64: &str) {
        self.update(ssid, |identity| identity.challenge_b64 = Some(challenge_b64.to_string()));
    }

    pub fn set_device_header(&self, ssid: &str, name: &str, value: &str) {
        self.update(ssid, |identity| {
            identity.device.insert(name.to_string(), value.to_string());
        });
    }

    /// Record that `connection` speaks for `ssid`.
    pub fn bind_connection(&self, connection: ConnectionId, ssid: &str) {
        self.connections.insert(connection, ssid.to_string());
    }

    /// Forget a connection binding (on disconnect).
    pub fn unbind_connection(&self, connection: ConnectionId) {
        self.connections.remove(&connection);
    }

    /// SSID bound to `connection`, if any.
    pub fn ssid_for(&self, connection: ConnectionId) -> Option<String> {
        self.connections.get(&connection).map(|entry| entry.value().clone())
    }

    pub fn identity_count(&self) -> usize {
        self.identities.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
