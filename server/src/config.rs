//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `PORT`, `REDIS_URL`,
//!    `SESSION_TIMEOUT_MINUTES`, `MAX_QUEUE_SIZE`, `SESSION_SECRET`,
//!    `SESSION_ENV_HOST_PATH`, `SESSION_ENV_CONTAINER_PATH`
//! 2. **Config file** — path via `--config <path>`, or `demogate.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! port = 3000
//!
//! [redis]
//! url = "redis://127.0.0.1:6379"
//!
//! [session]
//! timeout_minutes = 60
//! max_queue_size = 10
//! average_session_minutes = 45
//! disconnect_grace_ms = 10000
//! audit_retention_days = 30
//! secret = "your-hmac-secret"
//! env_host_path = "/run/demogate/session.env"
//! env_container_path = "/run/session.env"
//!
//! [workload]
//! image = "demo-workload:latest"
//! memory_limit = "512m"
//! pids_limit = 256
//! credential_env_keys = ["GRAFANA_DEMO_USER", "GRAFANA_DEMO_PASSWORD"]
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub workload: WorkloadConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP/WebSocket listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen port for HTTP and the client protocol (default 3000).
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Key-value store endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL (default `redis://127.0.0.1:6379`).
    #[serde(default = "default_redis_url")]
    pub url: String,
}

/// Session timing, queue bound, and token-signing settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Soft session timeout in minutes; `expires_at` offset. Warning fires
    /// 5 minutes before, hard kill 5 minutes after (default 60).
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    /// Queue bound; joins beyond it are rejected with `queue_full` (default 10).
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Multiplier for estimated wait (default 45).
    #[serde(default = "default_average_session_minutes")]
    pub average_session_minutes: u64,
    /// Reconnect window after the holder disconnects (default 10000).
    #[serde(default = "default_disconnect_grace_ms")]
    pub disconnect_grace_ms: u64,
    /// Extra TTL for invite records after expiration (default 30).
    #[serde(default = "default_audit_retention_days")]
    pub audit_retention_days: i64,
    /// HMAC key for session tokens. Override with `SESSION_SECRET`.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_secret")]
    pub secret: String,
    /// Host-side path of the workload credential file.
    #[serde(default = "default_env_host_path")]
    pub env_host_path: String,
    /// Path at which the container sees the credential file.
    #[serde(default = "default_env_container_path")]
    pub env_container_path: String,
}

/// Workload container settings for the spawned terminal session.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkloadConfig {
    /// Container image the terminal session runs (default `demo-workload:latest`).
    #[serde(default = "default_image")]
    pub image: String,
    /// Container memory cap, docker `--memory` syntax (default `512m`).
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,
    /// Container process-count cap, docker `--pids-limit` (default 256).
    #[serde(default = "default_pids_limit")]
    pub pids_limit: u32,
    /// Names of process environment variables whose values are copied into the
    /// credential file at session start. Secrets stay out of the argv and the
    /// TOML file.
    #[serde(default)]
    pub credential_env_keys: Vec<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_port() -> u16 {
    3000
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_timeout_minutes() -> u64 {
    60
}
fn default_max_queue_size() -> usize {
    10
}
fn default_average_session_minutes() -> u64 {
    45
}
fn default_disconnect_grace_ms() -> u64 {
    10000
}
fn default_audit_retention_days() -> i64 {
    30
}
fn default_secret() -> String {
    "change-me".to_string()
}
fn default_env_host_path() -> String {
    "/run/demogate/session.env".to_string()
}
fn default_env_container_path() -> String {
    "/run/session.env".to_string()
}
fn default_image() -> String {
    "demo-workload:latest".to_string()
}
fn default_memory_limit() -> String {
    "512m".to_string()
}
fn default_pids_limit() -> u32 {
    256
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: default_timeout_minutes(),
            max_queue_size: default_max_queue_size(),
            average_session_minutes: default_average_session_minutes(),
            disconnect_grace_ms: default_disconnect_grace_ms(),
            audit_retention_days: default_audit_retention_days(),
            secret: default_secret(),
            env_host_path: default_env_host_path(),
            env_container_path: default_env_container_path(),
        }
    }
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            memory_limit: default_memory_limit(),
            pids_limit: default_pids_limit(),
            credential_env_keys: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `demogate.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("demogate.toml").exists() {
            let content =
                std::fs::read_to_string("demogate.toml").expect("Failed to read demogate.toml");
            toml::from_str(&content).expect("Failed to parse demogate.toml")
        } else {
            Config {
                server: ServerConfig::default(),
                redis: RedisConfig::default(),
                session: SessionConfig::default(),
                workload: WorkloadConfig::default(),
                logging: LoggingConfig::default(),
            }
        };

        // Env var overrides
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(p) = port.parse() {
                config.server.port = p;
            }
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis.url = url;
        }
        if let Ok(minutes) = std::env::var("SESSION_TIMEOUT_MINUTES") {
            if let Ok(m) = minutes.parse() {
                config.session.timeout_minutes = m;
            }
        }
        if let Ok(size) = std::env::var("MAX_QUEUE_SIZE") {
            if let Ok(s) = size.parse() {
                config.session.max_queue_size = s;
            }
        }
        if let Ok(secret) = std::env::var("SESSION_SECRET") {
            config.session.secret = secret;
        }
        if let Ok(p) = std::env::var("SESSION_ENV_HOST_PATH") {
            config.session.env_host_path = p;
        }
        if let Ok(p) = std::env::var("SESSION_ENV_CONTAINER_PATH") {
            config.session.env_container_path = p;
        }

        config
    }

    /// Duration of the soft session timeout.
    pub fn session_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.session.timeout_minutes * 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Config {
        toml::from_str("").unwrap()
    }

    #[test]
    fn defaults_match_fixed_values() {
        let config = defaults();
        assert_eq!(config.session.average_session_minutes, 45);
        assert_eq!(config.session.disconnect_grace_ms, 10000);
        assert_eq!(config.session.audit_retention_days, 30);
        assert_eq!(config.session.max_queue_size, 10);
        assert_eq!(config.session.timeout_minutes, 60);
    }

    #[test]
    fn parses_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 8088

            [session]
            timeout_minutes = 30
            max_queue_size = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 8088);
        assert_eq!(config.session.timeout_minutes, 30);
        assert_eq!(config.session.max_queue_size, 3);
        // Untouched sections keep their defaults
        assert_eq!(config.redis.url, "redis://127.0.0.1:6379");
        assert_eq!(config.workload.pids_limit, 256);
    }

    #[test]
    fn parses_workload_section() {
        let config: Config = toml::from_str(
            r#"
            [workload]
            image = "sandbox:v2"
            credential_env_keys = ["DEMO_USER", "DEMO_PASSWORD"]
            "#,
        )
        .unwrap();
        assert_eq!(config.workload.image, "sandbox:v2");
        assert_eq!(
            config.workload.credential_env_keys,
            vec!["DEMO_USER", "DEMO_PASSWORD"]
        );
    }
}
