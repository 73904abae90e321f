//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (ports, depths, sizes)
//! - Check that every bound service has a port
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::ServerConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Check a parsed configuration, collecting every error.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.server.max_connections == 0 {
        errors.push(ValidationError::new("server.max_connections", "must be greater than 0"));
    }
    if config.server.service_ip.trim().is_empty() {
        errors.push(ValidationError::new("server.service_ip", "must not be empty"));
    }

    if config.framing.idle_dispatch_ms == 0 {
        errors.push(ValidationError::new("framing.idle_dispatch_ms", "must be greater than 0"));
    }
    if config.framing.max_frame_bytes == 0 {
        errors.push(ValidationError::new("framing.max_frame_bytes", "must be greater than 0"));
    }

    if config.security.max_unwrap_depth == 0 {
        errors.push(ValidationError::new("security.max_unwrap_depth", "must be at least 1"));
    }

    if config.vault.root.as_os_str().is_empty() {
        errors.push(ValidationError::new("vault.root", "must not be empty"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    for (name, service) in &config.services {
        let field = format!("services.{}", name);
        match service.port {
            Some(0) => errors.push(ValidationError::new(format!("{}.port", field), "must not be 0")),
            None if !service.nobind => {
                errors.push(ValidationError::new(format!("{}.port", field), "required unless nobind is set"))
            }
            _ => {}
        }
        if name.contains(char::is_whitespace) || name.is_empty() {
            errors.push(ValidationError::new(field, "service names must be non-empty without spaces"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ServiceConfig;

    #[test]
    fn defaults_are_valid() {
        assert!(validate_config(&ServerConfig::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = ServerConfig::default();
        config.server.max_connections = 0;
        config.security.max_unwrap_depth = 0;
        config.services.insert("wtv-home".to_string(), ServiceConfig::default());
        config.services.insert(
            "wtv-1800".to_string(),
            ServiceConfig {
                port: Some(0),
                ..ServiceConfig::default()
            },
        );

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "server.max_connections",
                "security.max_unwrap_depth",
                "services.wtv-1800.port",
                "services.wtv-home.port",
            ]
        );
    }

    #[test]
    fn nobind_service_needs_no_port() {
        let mut config = ServerConfig::default();
        config.services.insert(
            "wtv-star".to_string(),
            ServiceConfig {
                nobind: true,
                ..ServiceConfig::default()
            },
        );
        assert!(validate_config(&config).is_ok());
    }
}
