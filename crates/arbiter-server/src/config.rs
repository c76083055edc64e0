use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use arbiter_core::engine::EngineConfig;
use arbiter_core::schema::SchemaLimits;
use arbiter_storage::SnapshotManagerConfig;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub engine: EngineConfigValues,
    pub snapshot: SnapshotConfig,
    pub request: RequestConfig,
    pub shutdown: ShutdownConfig,
    pub schema_limits: SchemaLimitsConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfigValues {
    pub max_depth: usize,
    pub max_concurrent_branches: usize,
    pub max_expand_subjects: usize,
    pub max_lookup_candidates: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub ttl_ms: u64,
    pub keep_alive_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Deadline applied when a request carries no `timeout_ms`.
    pub default_timeout_ms: u64,
    /// Upper bound on any requested deadline.
    pub max_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub grace_period_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchemaLimitsConfig {
    pub max_types: usize,
    pub max_relations_per_type: usize,
    pub max_permissions_per_type: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    pub level: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_body_bytes: 4 * 1024 * 1024,
        }
    }
}

impl Default for EngineConfigValues {
    fn default() -> Self {
        let defaults = EngineConfig::default();
        Self {
            max_depth: defaults.max_depth,
            max_concurrent_branches: defaults.max_concurrent_branches,
            max_expand_subjects: defaults.max_expand_subjects,
            max_lookup_candidates: defaults.max_lookup_candidates,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 250,
            keep_alive_ms: 30_000,
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
            max_timeout_ms: 30_000,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 10_000,
        }
    }
}

impl Default for SchemaLimitsConfig {
    fn default() -> Self {
        let defaults = SchemaLimits::default();
        Self {
            max_types: defaults.max_types,
            max_relations_per_type: defaults.max_relations_per_type,
            max_permissions_per_type: defaults.max_permissions_per_type,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            level: "info".to_string(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl AppConfig {
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = config_path {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e.to_string()))?;
            toml::from_str::<AppConfig>(&contents)
                .map_err(|e| ConfigError::ParseToml(e.to_string()))?
        } else {
            AppConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ARBITER_HTTP_HOST") {
            self.http.host = v;
        }
        if let Some(port) = env_parse("ARBITER_HTTP_PORT") {
            self.http.port = port;
        }
        if let Some(n) = env_parse("ARBITER_ENGINE_MAX_DEPTH") {
            self.engine.max_depth = n;
        }
        if let Some(n) = env_parse("ARBITER_ENGINE_MAX_CONCURRENT_BRANCHES") {
            self.engine.max_concurrent_branches = n;
        }
        if let Some(ms) = env_parse("ARBITER_SNAPSHOT_TTL_MS") {
            self.snapshot.ttl_ms = ms;
        }
        if let Some(ms) = env_parse("ARBITER_REQUEST_DEFAULT_TIMEOUT_MS") {
            self.request.default_timeout_ms = ms;
        }
        if let Some(ms) = env_parse("ARBITER_SHUTDOWN_GRACE_PERIOD_MS") {
            self.shutdown.grace_period_ms = ms;
        }
        if let Ok(v) = std::env::var("ARBITER_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Ok(v) = std::env::var("ARBITER_LOG_FORMAT") {
            match v.as_str() {
                "json" => self.log.format = LogFormat::Json,
                "pretty" => self.log.format = LogFormat::Pretty,
                _ => {}
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("http.port", u64::from(self.http.port)),
            ("engine.max_depth", self.engine.max_depth as u64),
            (
                "engine.max_concurrent_branches",
                self.engine.max_concurrent_branches as u64,
            ),
            ("snapshot.ttl_ms", self.snapshot.ttl_ms),
            ("snapshot.keep_alive_ms", self.snapshot.keep_alive_ms),
            ("request.default_timeout_ms", self.request.default_timeout_ms),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Validation(format!("{name} must be non-zero")));
        }
        if self.request.max_timeout_ms < self.request.default_timeout_ms {
            return Err(ConfigError::Validation(
                "request.max_timeout_ms must not be below request.default_timeout_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_depth: self.engine.max_depth,
            max_concurrent_branches: self.engine.max_concurrent_branches,
            max_expand_subjects: self.engine.max_expand_subjects,
            max_lookup_candidates: self.engine.max_lookup_candidates,
        }
    }

    pub fn to_schema_limits(&self) -> SchemaLimits {
        SchemaLimits {
            max_types: self.schema_limits.max_types,
            max_relations_per_type: self.schema_limits.max_relations_per_type,
            max_permissions_per_type: self.schema_limits.max_permissions_per_type,
        }
    }

    pub fn to_snapshot_config(&self) -> SnapshotManagerConfig {
        SnapshotManagerConfig {
            ttl: Duration::from_millis(self.snapshot.ttl_ms),
            keep_alive: Duration::from_millis(self.snapshot.keep_alive_ms),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.request.default_timeout_ms)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.request.max_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown.grace_period_ms)
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.http.host, self.http.port)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{0}': {1}")]
    ReadFile(String, String),

    #[error("failed to parse TOML config: {0}")]
    ParseToml(String),

    #[error("config validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{contents}").unwrap();
        (dir, path)
    }

    #[test]
    fn default_config_has_sensible_values() {
        let config = AppConfig::default();

        assert_eq!(config.http.host, "0.0.0.0");
        assert_eq!(config.http.port, 8080);
        assert_eq!(config.engine.max_depth, 16);
        assert_eq!(config.snapshot.ttl_ms, 250);
        assert_eq!(config.request.default_timeout_ms, 5_000);
        assert_eq!(config.log.format, LogFormat::Json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_from_toml_file() {
        let (_dir, path) = write_config(
            r#"
[http]
host = "127.0.0.1"
port = 9090

[engine]
max_depth = 10
max_lookup_candidates = 500

[snapshot]
ttl_ms = 50

[shutdown]
grace_period_ms = 2000

[log]
format = "pretty"
level = "debug"
"#,
        );

        let config = AppConfig::load(Some(&path)).unwrap();

        assert_eq!(config.http_addr(), "127.0.0.1:9090");
        assert_eq!(config.engine.max_depth, 10);
        assert_eq!(config.to_engine_config().max_lookup_candidates, 500);
        assert_eq!(config.to_snapshot_config().ttl, Duration::from_millis(50));
        assert_eq!(config.grace_period(), Duration::from_secs(2));
        assert_eq!(config.log.format, LogFormat::Pretty);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let (_dir, path) = write_config("[engine]\nmax_depth = 4\n");

        let config = AppConfig::load(Some(&path)).unwrap();

        assert_eq!(config.engine.max_depth, 4);
        assert_eq!(config.engine.max_concurrent_branches, 10);
        assert_eq!(config.to_schema_limits(), SchemaLimits::default());
    }

    #[test]
    fn env_vars_override_toml() {
        let (_dir, path) = write_config("[shutdown]\ngrace_period_ms = 9000\n");

        // SAFETY: no other test reads this variable
        unsafe { std::env::set_var("ARBITER_SHUTDOWN_GRACE_PERIOD_MS", "1500") };
        let config = AppConfig::load(Some(&path)).unwrap();
        unsafe { std::env::remove_var("ARBITER_SHUTDOWN_GRACE_PERIOD_MS") };

        assert_eq!(config.shutdown.grace_period_ms, 1500);
    }

    #[test]
    fn malformed_toml_is_rejected() {
        let (_dir, path) = write_config("[http\nport = 1");

        let result = AppConfig::load(Some(&path));
        assert!(matches!(result, Err(ConfigError::ParseToml(_))));
    }

    #[test]
    fn missing_file_is_rejected() {
        let result = AppConfig::load(Some(Path::new("/nonexistent/arbiter.toml")));
        assert!(matches!(result, Err(ConfigError::ReadFile(..))));
    }

    #[test]
    fn validation_rejects_zero_port() {
        let mut config = AppConfig::default();
        config.http.port = 0;

        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Validation(ref msg)) if msg.contains("port")));
    }

    #[test]
    fn validation_rejects_zero_max_depth() {
        let mut config = AppConfig::default();
        config.engine.max_depth = 0;

        let result = config.validate();
        assert!(
            matches!(result, Err(ConfigError::Validation(ref msg)) if msg.contains("max_depth"))
        );
    }

    #[test]
    fn validation_rejects_zero_ttl() {
        let mut config = AppConfig::default();
        config.snapshot.ttl_ms = 0;

        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Validation(ref msg)) if msg.contains("ttl")));
    }

    #[test]
    fn validation_rejects_max_timeout_below_default() {
        let mut config = AppConfig::default();
        config.request.max_timeout_ms = 100;

        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }
}
