//! Configuration file loading.
//!
//! ## Responsibility
//! Read a TOML file from disk (or use defaults when none is given), apply
//! environment overrides, and run validation before returning. This is the
//! entry point both binaries use at startup.
//!
//! ## Guarantees
//! - A successfully loaded config is always validated
//! - I/O errors and parse errors are distinguished in the error type
//! - File path is included in every error message
//!
//! ## NOT Responsible For
//! - Defining the config schema (that belongs to `mod.rs`)

use std::path::Path;

use tracing::debug;

use super::validation::{self, ConfigError};
use super::{LogFormat, ServiceConfig};

/// Load a [`ServiceConfig`] from a TOML file, apply environment overrides
/// and validate.
///
/// # Returns
///
/// - `Ok(ServiceConfig)` if the file is readable, well-formed, and valid.
/// - `Err(ConfigError::Io)` if the file cannot be read.
/// - `Err(ConfigError::Parse)` if the TOML is malformed.
/// - `Err(ConfigError::Validation)` if semantic constraints are violated.
///
/// # Panics
///
/// This function never panics.
pub fn load_from_file(path: &Path) -> Result<ServiceConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_from_str(&content, &path.display().to_string())
}

/// Load a [`ServiceConfig`] from a TOML string.
///
/// Environment overrides are applied; use [`parse_str`] to skip them.
///
/// # Panics
///
/// This function never panics.
pub fn load_from_str(content: &str, source_name: &str) -> Result<ServiceConfig, ConfigError> {
    load_with(content, source_name, |key| std::env::var(key).ok())
}

/// Validation runs once, after the overrides, so an override can replace an
/// invalid file value.
fn load_with<F>(content: &str, source_name: &str, lookup: F) -> Result<ServiceConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = deserialize(content, source_name)?;
    apply_overrides(&mut config, lookup)?;
    check(&config)?;
    Ok(config)
}

/// Load from `path` when given, otherwise start from defaults.
///
/// # Panics
///
/// This function never panics.
pub fn load(path: Option<&Path>) -> Result<ServiceConfig, ConfigError> {
    match path {
        Some(path) => load_from_file(path),
        None => {
            let mut config = ServiceConfig::default();
            apply_overrides(&mut config, |key| std::env::var(key).ok())?;
            check(&config)?;
            Ok(config)
        }
    }
}

/// Parse and validate without consulting the environment.
pub fn parse_str(content: &str, source_name: &str) -> Result<ServiceConfig, ConfigError> {
    let config = deserialize(content, source_name)?;
    check(&config)?;
    Ok(config)
}

fn deserialize(content: &str, source_name: &str) -> Result<ServiceConfig, ConfigError> {
    toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })
}

fn check(config: &ServiceConfig) -> Result<(), ConfigError> {
    validation::validate(config).map_err(|errors| {
        ConfigError::Validation(
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    })
}

/// Apply `REDIS_URL`, `HOST`, `PORT` and `LOG_FORMAT` overrides read through
/// `lookup`.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidField`] if `PORT` or `LOG_FORMAT` cannot be
/// parsed.
pub fn apply_overrides<F>(config: &mut ServiceConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = lookup("REDIS_URL") {
        debug!("REDIS_URL override applied");
        config.storage.redis_url = url;
    }
    if let Some(host) = lookup("HOST") {
        config.server.host = host;
    }
    if let Some(port) = lookup("PORT") {
        config.server.port = port.parse().map_err(|_| ConfigError::InvalidField {
            field: "PORT".into(),
            value: port.clone(),
            reason: "must be a port number".into(),
        })?;
    }
    if let Some(format) = lookup("LOG_FORMAT") {
        config.observability.log_format = match format.as_str() {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            _ => {
                return Err(ConfigError::InvalidField {
                    field: "LOG_FORMAT".into(),
                    value: format,
                    reason: "must be 'json' or 'pretty'".into(),
                })
            }
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageBackend;
    use std::collections::HashMap;
    use std::io::Write;

    const VALID_TOML: &str = r#"
[server]
port = 9000

[storage]
backend = "redis"
redis_url = "redis://redis:6379"
consumer_id = "node-a"

[workers]
api_concurrency = 5

[backends.gpu]
provider = "echo"
"#;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_str_valid() {
        let config = parse_str(VALID_TOML, "inline").expect("test: valid config");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.storage.backend, StorageBackend::Redis);
        assert_eq!(config.storage.consumer_id.as_deref(), Some("node-a"));
        assert_eq!(config.workers.api_concurrency, 5);
    }

    #[test]
    fn test_parse_str_malformed_is_parse_error() {
        let err = parse_str("[server\nport = ", "broken.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { ref file, .. } if file == "broken.toml"));
    }

    #[test]
    fn test_parse_str_invalid_is_validation_error() {
        let err = parse_str("[server]\nport = 0\n", "inline").unwrap_err();
        match err {
            ConfigError::Validation(msg) => assert!(msg.contains("server.port")),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_from_file_roundtrip() {
        let mut file = tempfile::NamedTempFile::new().expect("test: tempfile");
        file.write_all(VALID_TOML.as_bytes()).expect("test: write");
        let config = load_from_file(file.path()).expect("test: load");
        assert_eq!(config.workers.api_concurrency, 5);
    }

    #[test]
    fn test_load_from_missing_file_is_io_error() {
        let err = load_from_file(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("/definitely/not/here.toml"));
    }

    #[test]
    fn test_overrides_apply() {
        let mut config = ServiceConfig::default();
        apply_overrides(
            &mut config,
            env(&[
                ("REDIS_URL", "redis://other:6380"),
                ("HOST", "127.0.0.1"),
                ("PORT", "9100"),
                ("LOG_FORMAT", "json"),
            ]),
        )
        .expect("test: overrides");
        assert_eq!(config.storage.redis_url, "redis://other:6380");
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.observability.log_format, LogFormat::Json);
    }

    #[test]
    fn test_override_bad_port_rejected() {
        let mut config = ServiceConfig::default();
        let err = apply_overrides(&mut config, env(&[("PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidField { ref field, .. } if field == "PORT"));
    }

    #[test]
    fn test_override_bad_log_format_rejected() {
        let mut config = ServiceConfig::default();
        assert!(apply_overrides(&mut config, env(&[("LOG_FORMAT", "xml")])).is_err());
    }

    #[test]
    fn test_override_replaces_invalid_file_value() {
        let file = "[server]\nport = 0\n\n[storage]\nbackend = \"redis\"\nredis_url = \"http://nope\"\n";
        let config = load_with(
            file,
            "inline",
            env(&[("PORT", "9200"), ("REDIS_URL", "redis://fixed:6379")]),
        )
        .expect("test: overrides fix the file");
        assert_eq!(config.server.port, 9200);
        assert_eq!(config.storage.redis_url, "redis://fixed:6379");
    }

    #[test]
    fn test_invalid_value_without_override_still_rejected() {
        let err = load_with("[server]\nport = 0\n", "inline", env(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(ref msg) if msg.contains("server.port")));
    }

    #[test]
    fn test_no_overrides_leaves_config_untouched() {
        let mut config = ServiceConfig::default();
        apply_overrides(&mut config, env(&[])).expect("test: overrides");
        assert_eq!(config, ServiceConfig::default());
    }
}
