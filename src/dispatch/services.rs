//! Advertised service table.
//!
//! Renders the `wtv-service` lines handed to clients and decides which ports
//! the server binds.

use std::collections::BTreeMap;

use crate::config::schema::{ServerConfig, ServiceConfig};
use crate::net::dedup_ports;

/// Service whose line is duplicated as the `wtv-*` wildcard.
const WILDCARD_SOURCE: &str = "wtv-star";

/// A configured service with its host resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub name: String,
    pub host: String,
    pub port: Option<u16>,
    pub flags: Option<String>,
    pub connections: Option<u32>,
    pub nobind: bool,
    pub write_logs_to_disk: bool,
}

impl Service {
    fn from_config(name: &str, config: &ServiceConfig, service_ip: &str) -> Self {
        Self {
            name: name.to_string(),
            host: config.host.clone().unwrap_or_else(|| service_ip.to_string()),
            port: config.port,
            flags: config.flags.clone(),
            connections: config.connections,
            nobind: config.nobind,
            write_logs_to_disk: config.write_logs_to_disk,
        }
    }

    fn line(&self, name: &str) -> String {
        let mut line = format!("wtv-service: name={} host={}", name, self.host);
        if let Some(port) = self.port {
            line.push_str(&format!(" port={}", port));
        }
        if let Some(flags) = &self.flags {
            line.push_str(&format!(" flags={}", flags));
        }
        if let Some(connections) = self.connections {
            line.push_str(&format!(" connections={}", connections));
        }
        line
    }

    /// Header line(s) advertising this service.
    pub fn service_line(&self) -> String {
        let mut out = self.line(&self.name);
        if self.name == WILDCARD_SOURCE {
            out.push('\n');
            out.push_str(&self.line("wtv-*"));
        }
        out
    }
}

/// All configured services, immutable once built.
#[derive(Debug, Clone, Default)]
pub struct ServiceTable {
    services: BTreeMap<String, Service>,
}

impl ServiceTable {
    pub fn from_config(config: &ServerConfig) -> Self {
        let services = config
            .services
            .iter()
            .map(|(name, service)| {
                (
                    name.clone(),
                    Service::from_config(name, service, &config.server.service_ip),
                )
            })
            .collect();
        Self { services }
    }

    pub fn get(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    /// `wtv-service` text for one service, or every service for `"all"`.
    pub fn service_string(&self, name: &str) -> Option<String> {
        if name == "all" {
            let mut out = String::new();
            for service in self.services.values() {
                out.push_str(&service.service_line());
                out.push('\n');
            }
            return Some(out);
        }
        self.services.get(name).map(Service::service_line)
    }

    /// Sorted unique ports to listen on.
    pub fn bind_ports(&self) -> Vec<u16> {
        dedup_ports(
            self.services
                .values()
                .filter(|service| !service.nobind)
                .filter_map(|service| service.port),
        )
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
