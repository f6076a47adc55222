//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check that every server names a known network and a usable address
//! - Detect duplicate server names and endpoints
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: HandoffConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;

use thiserror::Error;

use crate::config::schema::HandoffConfig;
use crate::net::addr::{resolve, Network};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("server #{index} has an empty name")]
    EmptyName { index: usize },

    #[error("server name {0:?} is used more than once")]
    DuplicateName(String),

    #[error("{owner}: {reason}")]
    InvalidEndpoint { owner: String, reason: String },

    #[error("{owner}: {network} cannot carry HTTP")]
    UnsupportedNetwork { owner: String, network: String },

    #[error("endpoint {network} {address} is configured more than once")]
    DuplicateEndpoint { network: String, address: String },

    #[error("{owner}: TLS certificate and key paths must both be set")]
    IncompleteTls { owner: String },

    #[error("admin API is enabled without an api_key")]
    MissingApiKey,

    #[error("unix_socket_permission {0:#o} is not a file mode")]
    InvalidPermission(u32),

    #[error("backlog must be positive, got {0}")]
    InvalidBacklog(i32),

    #[error("log_level {0:?} is not one of trace, debug, info, warn, error")]
    InvalidLogLevel(String),
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Check `config` and collect every problem found.
pub fn validate_config(config: &HandoffConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut names = HashSet::new();
    let mut endpoints = HashSet::new();

    for (index, server) in config.servers.iter().enumerate() {
        if server.name.trim().is_empty() {
            errors.push(ValidationError::EmptyName { index });
        } else if !names.insert(server.name.as_str()) {
            errors.push(ValidationError::DuplicateName(server.name.clone()));
        }

        let owner = format!("server {:?}", server.name);
        check_endpoint(&owner, &server.network, &server.address, &mut endpoints, &mut errors);

        if let Some(tls) = &server.tls {
            if tls.cert_path.as_os_str().is_empty() || tls.key_path.as_os_str().is_empty() {
                errors.push(ValidationError::IncompleteTls { owner });
            }
        }
    }

    if config.admin.enabled {
        check_endpoint(
            "admin",
            &config.admin.network,
            &config.admin.address,
            &mut endpoints,
            &mut errors,
        );
        if config.admin.api_key.is_empty() {
            errors.push(ValidationError::MissingApiKey);
        }
    }

    let listeners = &config.listeners;
    if listeners.unix_socket_permission > 0o7777 {
        errors.push(ValidationError::InvalidPermission(listeners.unix_socket_permission));
    }
    if listeners.backlog <= 0 {
        errors.push(ValidationError::InvalidBacklog(listeners.backlog));
    }

    let level = config.observability.log_level.to_ascii_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        errors.push(ValidationError::InvalidLogLevel(config.observability.log_level.clone()));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_endpoint(
    owner: &str,
    network: &str,
    address: &str,
    seen: &mut HashSet<(Network, String)>,
    errors: &mut Vec<ValidationError>,
) {
    let parsed = match network.parse::<Network>() {
        Ok(parsed) => parsed,
        Err(e) => {
            errors.push(ValidationError::InvalidEndpoint {
                owner: owner.to_string(),
                reason: e.to_string(),
            });
            return;
        }
    };
    if parsed == Network::UnixPacket {
        errors.push(ValidationError::UnsupportedNetwork {
            owner: owner.to_string(),
            network: network.to_string(),
        });
    }
    // Port 0 asks the kernel for a fresh port, which never collides.
    if let Err(e) = resolve(parsed, address) {
        errors.push(ValidationError::InvalidEndpoint {
            owner: owner.to_string(),
            reason: e.to_string(),
        });
    } else if !address.ends_with(":0") && !seen.insert((parsed, address.to_string())) {
        errors.push(ValidationError::DuplicateEndpoint {
            network: network.to_string(),
            address: address.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{ServerConfig, TlsConfig};

    fn server(name: &str, network: &str, address: &str) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
            network: network.to_string(),
            address: address.to_string(),
            tls: None,
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert_eq!(validate_config(&HandoffConfig::default()), Ok(()));
    }

    #[test]
    fn collects_every_error() {
        let mut config = HandoffConfig::default();
        config.servers = vec![
            server("web", "tcp", "127.0.0.1:8080"),
            server("web", "tcp", "127.0.0.1:8080"),
            server("", "carrier-pigeon", "somewhere"),
            server("dgram", "unix-packet", "/tmp/handoff.sock"),
        ];
        config.admin.enabled = true;
        config.listeners.backlog = 0;

        let errors = validate_config(&config).unwrap_err();
        assert!(errors.contains(&ValidationError::DuplicateName("web".to_string())));
        assert!(errors.contains(&ValidationError::DuplicateEndpoint {
            network: "tcp".to_string(),
            address: "127.0.0.1:8080".to_string(),
        }));
        assert!(errors.contains(&ValidationError::EmptyName { index: 2 }));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidEndpoint { .. })));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::UnsupportedNetwork { .. })));
        assert!(errors.contains(&ValidationError::MissingApiKey));
        assert!(errors.contains(&ValidationError::InvalidBacklog(0)));
    }

    #[test]
    fn ephemeral_ports_may_repeat() {
        let mut config = HandoffConfig::default();
        config.servers = vec![server("a", "tcp", "127.0.0.1:0"), server("b", "tcp", "127.0.0.1:0")];
        assert_eq!(validate_config(&config), Ok(()));
    }

    #[test]
    fn tls_needs_both_paths() {
        let mut config = HandoffConfig::default();
        let mut web = server("web", "tcp", "127.0.0.1:8443");
        web.tls = Some(TlsConfig {
            cert_path: "cert.pem".into(),
            key_path: "".into(),
        });
        config.servers = vec![web];
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::IncompleteTls {
                owner: "server \"web\"".to_string()
            }]
        );
    }
}
