//! Configuration validation.
//!
//! Errors are aggregated so the operator sees everything wrong at once. A
//! route whose path regex does not compile is a warning, not an error: the
//! router skips it at match time, and one bad route must not block a
//! startup that contains valid ones.

use std::{collections::HashSet, net::SocketAddr};

use crate::config::models::{ProxyConfig, StorageType, TlsConfig};

pub type ValidationResult<T> = Result<T, ValidationError>;

#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("invalid TLS configuration: {message}")]
    InvalidTls { message: String },

    #[error("invalid service '{id}': {message}")]
    InvalidService { id: String, message: String },

    #[error("invalid route '{id}': {message}")]
    InvalidRoute { id: String, message: String },

    #[error("validation failed:\n{message}")]
    ValidationFailed { message: String },
}

pub struct ProxyConfigValidator;

impl ProxyConfigValidator {
    pub fn validate(config: &ProxyConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if config.listen_addr.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::InvalidListenAddress {
                address: config.listen_addr.clone(),
                reason: "must be in 'IP:PORT' form (e.g. '0.0.0.0:8080')".to_string(),
            });
        }

        if config.health_check.enabled
            && config.health_check.timeout_secs >= config.health_check.interval_secs
        {
            errors.push(ValidationError::InvalidField {
                field: "health_check.timeout_secs".to_string(),
                message: format!(
                    "probe timeout ({}s) must be below the probe interval ({}s)",
                    config.health_check.timeout_secs, config.health_check.interval_secs
                ),
            });
        }
        if config.health_check.fail_threshold == 0 || config.health_check.pass_threshold == 0 {
            errors.push(ValidationError::InvalidField {
                field: "health_check".to_string(),
                message: "fail_threshold and pass_threshold must be at least 1".to_string(),
            });
        }

        if config.rate_limit.enabled {
            if config.rate_limit.rps == 0 {
                errors.push(ValidationError::InvalidField {
                    field: "rate_limit.rps".to_string(),
                    message: "must be at least 1 when rate limiting is enabled".to_string(),
                });
            }
            if config.rate_limit.burst < config.rate_limit.rps {
                errors.push(ValidationError::InvalidField {
                    field: "rate_limit.burst".to_string(),
                    message: format!(
                        "burst ({}) must be at least rps ({})",
                        config.rate_limit.burst, config.rate_limit.rps
                    ),
                });
            }
        }

        if config.circuit_breaker.enabled {
            if config.circuit_breaker.failure_threshold == 0 {
                errors.push(ValidationError::InvalidField {
                    field: "circuit_breaker.failure_threshold".to_string(),
                    message: "must be at least 1".to_string(),
                });
            }
            if config.circuit_breaker.success_threshold == 0 {
                errors.push(ValidationError::InvalidField {
                    field: "circuit_breaker.success_threshold".to_string(),
                    message: "must be at least 1".to_string(),
                });
            }
        }

        if config.retry.enabled && config.retry.max_attempts == 0 {
            errors.push(ValidationError::InvalidField {
                field: "retry.max_attempts".to_string(),
                message: "must be at least 1 when retries are enabled".to_string(),
            });
        }

        if let Some(tls) = &config.tls {
            Self::validate_tls(tls, &mut errors);
        }

        if config.storage.storage_type == StorageType::Sqlite {
            errors.push(ValidationError::InvalidField {
                field: "storage.type".to_string(),
                message: "the sqlite catalog store runs as an external component; \
                          use 'memory' here"
                    .to_string(),
            });
        }

        Self::validate_seed(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            let message = errors
                .iter()
                .map(|e| format!("  - {e}"))
                .collect::<Vec<_>>()
                .join("\n");
            Err(ValidationError::ValidationFailed { message })
        }
    }

    fn validate_tls(tls: &TlsConfig, errors: &mut Vec<ValidationError>) {
        const SUPPORTED: [&str; 4] = ["1.0", "1.1", "1.2", "1.3"];
        if !SUPPORTED.contains(&tls.min_version.as_str()) {
            errors.push(ValidationError::InvalidTls {
                message: format!(
                    "min_version '{}' not one of {SUPPORTED:?}",
                    tls.min_version
                ),
            });
        }
        if tls.cert_path.is_empty() || tls.key_path.is_empty() {
            errors.push(ValidationError::InvalidTls {
                message: "cert_path and key_path are required".to_string(),
            });
        }
    }

    fn validate_seed(config: &ProxyConfig, errors: &mut Vec<ValidationError>) {
        let mut service_ids = HashSet::new();
        for service in &config.services {
            if service.id.is_empty() {
                errors.push(ValidationError::InvalidService {
                    id: "<empty>".to_string(),
                    message: "service id is required".to_string(),
                });
                continue;
            }
            if !service_ids.insert(service.id.as_str()) {
                errors.push(ValidationError::InvalidService {
                    id: service.id.clone(),
                    message: "duplicate service id".to_string(),
                });
            }
            if service.endpoints.is_empty() {
                errors.push(ValidationError::InvalidService {
                    id: service.id.clone(),
                    message: "at least one endpoint is required".to_string(),
                });
            }
            for endpoint in &service.endpoints {
                match url::Url::parse(endpoint) {
                    Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
                    Ok(url) => errors.push(ValidationError::InvalidService {
                        id: service.id.clone(),
                        message: format!("endpoint '{endpoint}' has scheme '{}'", url.scheme()),
                    }),
                    Err(e) => errors.push(ValidationError::InvalidService {
                        id: service.id.clone(),
                        message: format!("endpoint '{endpoint}' does not parse: {e}"),
                    }),
                }
            }
        }

        let mut route_ids = HashSet::new();
        for route in &config.routes {
            if route.id.is_empty() {
                errors.push(ValidationError::InvalidRoute {
                    id: "<empty>".to_string(),
                    message: "route id is required".to_string(),
                });
                continue;
            }
            if !route_ids.insert(route.id.as_str()) {
                errors.push(ValidationError::InvalidRoute {
                    id: route.id.clone(),
                    message: "duplicate route id".to_string(),
                });
            }
            if !service_ids.contains(route.service_id.as_str()) {
                errors.push(ValidationError::InvalidRoute {
                    id: route.id.clone(),
                    message: format!("references unknown service '{}'", route.service_id),
                });
            }
            if let Some(pattern) = route.path_regex.as_deref()
                && let Err(e) = regex::Regex::new(pattern)
            {
                // Skipped at match time, not fatal at startup.
                tracing::warn!(
                    route = %route.id,
                    pattern,
                    error = %e,
                    "route path regex does not compile; route will never match"
                );
            }
        }
    }
}
