use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::ProxyConfig;

/// Prefix for environment overrides; nested keys use a double underscore
/// (`SWITCHYARD_RATE_LIMIT__RPS` → `rate_limit.rps`).
const ENV_PREFIX: &str = "SWITCHYARD";

/// Load configuration from a file, layered with environment overrides.
/// The format follows the file extension: YAML, JSON, TOML or INI.
pub fn load_config(config_path: &str) -> Result<ProxyConfig> {
    let path = Path::new(config_path);

    let format = match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Yaml,
    };

    let settings = Config::builder()
        .add_source(File::new(
            path.to_str()
                .ok_or_else(|| eyre::eyre!("invalid UTF-8 path: {}", path.display()))?,
            format,
        ))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("failed to build config from {}", path.display()))?;

    let proxy_config: ProxyConfig = settings
        .try_deserialize()
        .with_context(|| format!("failed to deserialize config from {}", path.display()))?;

    Ok(proxy_config)
}

/// Environment-only configuration (defaults plus `SWITCHYARD_*`), for
/// running without a config file.
pub fn load_config_from_env() -> Result<ProxyConfig> {
    let settings = Config::builder()
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("failed to build config from environment")?;

    let proxy_config: ProxyConfig = settings
        .try_deserialize()
        .context("failed to deserialize config from environment")?;

    Ok(proxy_config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn load_yaml_config() {
        let yaml_content = r#"
listen_addr: "127.0.0.1:3000"
load_balancing:
  algorithm: ip_hash
  sticky:
    enabled: true
    ttl_secs: 600
health_check:
  interval_secs: 15
  timeout_secs: 3
services:
  - id: s1
    endpoints: ["http://10.0.0.1:8080"]
routes:
  - id: r1
    service_id: s1
    path_prefix: /api
    priority: 10
"#;

        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:3000");
        assert_eq!(
            config.load_balancing.algorithm,
            crate::core::balancer::Algorithm::IpHash
        );
        assert!(config.load_balancing.sticky.enabled);
        assert_eq!(config.load_balancing.sticky.ttl_secs, 600);
        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services[0].weight, 1);
        assert_eq!(config.routes[0].path_prefix.as_deref(), Some("/api"));
    }

    #[test]
    fn load_json_config() {
        let json_content = r#"
{
  "listen_addr": "127.0.0.1:3000",
  "rate_limit": { "enabled": true, "rps": 5, "burst": 10 },
  "services": [],
  "routes": []
}
"#;

        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, "{}", json_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap()).unwrap();
        assert!(config.rate_limit.enabled);
        assert_eq!(config.rate_limit.rps, 5);
        assert_eq!(config.rate_limit.burst, 10);
    }

    #[test]
    fn missing_file_errors() {
        assert!(load_config("/definitely/not/here.yaml").is_err());
    }
}
