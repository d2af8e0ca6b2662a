//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`ServiceConfig`] that cannot
//! be expressed through the type system alone (range checks, cross-field
//! invariants).
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use super::{BackendProvider, BackendSection, ServiceConfig, StorageBackend};

/// Errors arising from configuration parsing, validation, or I/O.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "workers.gpu_timeout_s").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.into(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn at_least_one(errors: &mut Vec<ConfigError>, field: &str, value: u64) {
    if value == 0 {
        errors.push(invalid(field, value, "must be at least 1"));
    }
}

fn validate_backend(errors: &mut Vec<ConfigError>, prefix: &str, backend: &BackendSection) {
    if backend.model.trim().is_empty() {
        errors.push(invalid(
            &format!("{prefix}.model"),
            "\"\"",
            "must not be empty",
        ));
    }
    match backend.provider {
        BackendProvider::Echo => {}
        BackendProvider::LocalServer | BackendProvider::OpenAiCompatible => {
            let url = backend.url.as_deref().unwrap_or("");
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                errors.push(invalid(
                    &format!("{prefix}.url"),
                    format!("{url:?}"),
                    "must be an http(s) URL",
                ));
            }
        }
    }
    if backend.provider == BackendProvider::OpenAiCompatible
        && backend
            .api_key_env
            .as_deref()
            .map_or(true, |v| v.trim().is_empty())
    {
        errors.push(invalid(
            &format!("{prefix}.api_key_env"),
            format!("{:?}", backend.api_key_env),
            "required for open_ai_compatible",
        ));
    }
    if backend.provider == BackendProvider::LocalServer && backend.probe_timeout_ms == 0 {
        errors.push(invalid(
            &format!("{prefix}.probe_timeout_ms"),
            0,
            "must be at least 1",
        ));
    }
}

/// Validate all semantic constraints on a [`ServiceConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &ServiceConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Server ───────────────────────────────────────────────────────
    if config.server.port == 0 {
        errors.push(invalid("server.port", 0, "must be non-zero"));
    }
    if config.server.max_request_size < 1024 {
        errors.push(invalid(
            "server.max_request_size",
            config.server.max_request_size,
            "must be at least 1024 bytes",
        ));
    }

    // ── Storage ──────────────────────────────────────────────────────
    if config.storage.backend == StorageBackend::Redis
        && !config.storage.redis_url.starts_with("redis")
    {
        errors.push(invalid(
            "storage.redis_url",
            &config.storage.redis_url,
            "must be a redis:// or rediss:// URL",
        ));
    }
    if let Some(id) = &config.storage.consumer_id {
        if id.trim().is_empty() {
            errors.push(invalid("storage.consumer_id", id, "must not be blank"));
        }
    }

    // ── Queues ───────────────────────────────────────────────────────
    let names = [
        ("queues.gpu", &config.queues.gpu),
        ("queues.api", &config.queues.api),
        ("queues.gpu_dead_letter", &config.queues.gpu_dead_letter),
        ("queues.api_dead_letter", &config.queues.api_dead_letter),
    ];
    for (i, (field, name)) in names.iter().enumerate() {
        if name.trim().is_empty() {
            errors.push(invalid(field, "\"\"", "must not be empty"));
        } else if names[..i].iter().any(|(_, other)| other == name) {
            errors.push(invalid(field, name, "must differ from every other queue name"));
        }
    }

    // ── Retention ────────────────────────────────────────────────────
    at_least_one(
        &mut errors,
        "retention.idempotency_ttl_s",
        config.retention.idempotency_ttl_s,
    );
    at_least_one(&mut errors, "retention.job_ttl_s", config.retention.job_ttl_s);
    if config.retention.idempotency_ttl_s > config.retention.job_ttl_s {
        errors.push(invalid(
            "retention.idempotency_ttl_s",
            config.retention.idempotency_ttl_s,
            "must be \u{2264} retention.job_ttl_s",
        ));
    }

    // ── Workers ──────────────────────────────────────────────────────
    let w = &config.workers;
    at_least_one(&mut errors, "workers.gpu_timeout_s", w.gpu_timeout_s);
    at_least_one(&mut errors, "workers.api_timeout_s", w.api_timeout_s);
    at_least_one(&mut errors, "workers.gpu_concurrency", w.gpu_concurrency as u64);
    at_least_one(&mut errors, "workers.api_concurrency", w.api_concurrency as u64);
    at_least_one(&mut errors, "workers.heartbeat_interval_s", w.heartbeat_interval_s);
    if w.availability_ttl_s <= w.heartbeat_interval_s {
        errors.push(invalid(
            "workers.availability_ttl_s",
            w.availability_ttl_s,
            "must exceed workers.heartbeat_interval_s",
        ));
    }

    // ── Backends ─────────────────────────────────────────────────────
    validate_backend(&mut errors, "backends.gpu", &config.backends.gpu);
    validate_backend(&mut errors, "backends.api", &config.backends.api);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(config: &ServiceConfig) -> Vec<String> {
        match validate(config) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .into_iter()
                .filter_map(|e| match e {
                    ConfigError::InvalidField { field, .. } => Some(field),
                    _ => None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_validate_default_config_passes() {
        assert!(validate(&ServiceConfig::default()).is_ok());
    }

    #[test]
    fn test_validate_zero_port_fails() {
        let mut config = ServiceConfig::default();
        config.server.port = 0;
        assert_eq!(fields(&config), vec!["server.port"]);
    }

    #[test]
    fn test_validate_tiny_body_limit_fails() {
        let mut config = ServiceConfig::default();
        config.server.max_request_size = 10;
        assert_eq!(fields(&config), vec!["server.max_request_size"]);
    }

    #[test]
    fn test_validate_blank_consumer_id_rejected() {
        let mut config = ServiceConfig::default();
        config.storage.consumer_id = Some(" ".into());
        assert_eq!(fields(&config), vec!["storage.consumer_id"]);
    }

    #[test]
    fn test_validate_redis_url_scheme_checked_only_for_redis() {
        let mut config = ServiceConfig::default();
        config.storage.redis_url = "http://nope".into();
        assert!(validate(&config).is_ok());
        config.storage.backend = StorageBackend::Redis;
        assert_eq!(fields(&config), vec!["storage.redis_url"]);
    }

    #[test]
    fn test_validate_duplicate_queue_names_fail() {
        let mut config = ServiceConfig::default();
        config.queues.api = config.queues.gpu.clone();
        assert_eq!(fields(&config), vec!["queues.api"]);
    }

    #[test]
    fn test_validate_empty_queue_name_fails() {
        let mut config = ServiceConfig::default();
        config.queues.gpu_dead_letter = " ".into();
        assert_eq!(fields(&config), vec!["queues.gpu_dead_letter"]);
    }

    #[test]
    fn test_validate_idempotency_outliving_jobs_fails() {
        let mut config = ServiceConfig::default();
        config.retention.idempotency_ttl_s = 100;
        config.retention.job_ttl_s = 50;
        assert_eq!(fields(&config), vec!["retention.idempotency_ttl_s"]);
    }

    #[test]
    fn test_validate_zero_job_ttl_fails() {
        let mut config = ServiceConfig::default();
        config.retention.idempotency_ttl_s = 0;
        config.retention.job_ttl_s = 0;
        let f = fields(&config);
        assert!(f.contains(&"retention.idempotency_ttl_s".to_string()));
        assert!(f.contains(&"retention.job_ttl_s".to_string()));
    }

    #[test]
    fn test_validate_zero_timeouts_and_concurrency_fail() {
        let mut config = ServiceConfig::default();
        config.workers.gpu_timeout_s = 0;
        config.workers.api_timeout_s = 0;
        config.workers.gpu_concurrency = 0;
        config.workers.api_concurrency = 0;
        let f = fields(&config);
        for field in [
            "workers.gpu_timeout_s",
            "workers.api_timeout_s",
            "workers.gpu_concurrency",
            "workers.api_concurrency",
        ] {
            assert!(f.contains(&field.to_string()), "missing {field}");
        }
    }

    #[test]
    fn test_validate_availability_ttl_must_exceed_heartbeat() {
        let mut config = ServiceConfig::default();
        config.workers.heartbeat_interval_s = 10;
        config.workers.availability_ttl_s = 10;
        assert_eq!(fields(&config), vec!["workers.availability_ttl_s"]);
    }

    #[test]
    fn test_validate_remote_backend_needs_key_env() {
        let mut config = ServiceConfig::default();
        config.backends.api.api_key_env = None;
        assert_eq!(fields(&config), vec!["backends.api.api_key_env"]);
    }

    #[test]
    fn test_validate_local_backend_needs_http_url() {
        let mut config = ServiceConfig::default();
        config.backends.gpu.url = Some("localhost:8000".into());
        assert_eq!(fields(&config), vec!["backends.gpu.url"]);
    }

    #[test]
    fn test_validate_echo_backend_needs_no_url() {
        let mut config = ServiceConfig::default();
        config.backends.gpu.provider = BackendProvider::Echo;
        config.backends.gpu.url = None;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_validate_empty_model_fails() {
        let mut config = ServiceConfig::default();
        config.backends.gpu.model = "".into();
        assert_eq!(fields(&config), vec!["backends.gpu.model"]);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = ServiceConfig::default();
        config.server.port = 0;
        config.workers.gpu_timeout_s = 0;
        config.backends.api.model = " ".into();
        assert_eq!(validate(&config).map_err(|e| e.len()), Err(3));
    }
}
