use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::network::NetworkOptions;
use crate::protocol::auth::AuthOptions;
use crate::protocol::codec::DEFAULT_MAX_LINE_BYTES;
use crate::scheduler::balancer::BalancerOptions;
use crate::scheduler::priority::TaskPriority;
use crate::scheduler::strategy::StrategyKind;
use crate::scheduler::{DEFAULT_MAX_FINISHED_TASKS, DEFAULT_MAX_QUEUED_TASKS};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value {value:?} for {var}: {reason}")]
    InvalidOverride {
        var: String,
        value: String,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Upper bound for `scheduler.retry_delay_base_secs`: one day.
pub const MAX_RETRY_DELAY_BASE_SECS: f64 = 86_400.0;

/// A worker the master connects to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerEndpoint {
    pub worker_id: String,
    /// `host:port`
    pub address: String,
}

impl FromStr for WorkerEndpoint {
    type Err = String;

    /// Parses `id@host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('@') {
            Some((id, addr)) if !id.is_empty() && addr.contains(':') => Ok(Self {
                worker_id: id.to_string(),
                address: addr.to_string(),
            }),
            _ => Err(format!("expected id@host:port, got {:?}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_host: String,
    /// Master's inbound port, serving the HTTP API.
    pub master_port: u16,
    /// Port a worker listens on for its master.
    pub worker_port: u16,
    /// This worker's id. Defaults to the host name.
    pub worker_id: Option<String>,
    /// Workers the master dials at startup.
    pub workers: Vec<WorkerEndpoint>,
    pub heartbeat_interval_secs: u64,
    pub telemetry_interval_secs: u64,
    pub connection_timeout_secs: u64,
    pub challenge_ttl_secs: u64,
    pub token_expiry_secs: u64,
    pub max_line_bytes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            master_port: 9000,
            worker_port: 9001,
            worker_id: None,
            workers: Vec::new(),
            heartbeat_interval_secs: 30,
            telemetry_interval_secs: 5,
            connection_timeout_secs: 30,
            challenge_ttl_secs: 300,
            token_expiry_secs: 3600,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl NetworkConfig {
    /// Sessions are renewed two telemetry polls ahead of their end, or half
    /// way through when the expiry is shorter than that.
    pub fn auth_options(&self) -> AuthOptions {
        let token_expiry = Duration::from_secs(self.token_expiry_secs);
        let two_polls = Duration::from_secs(self.telemetry_interval_secs.saturating_mul(2));
        AuthOptions {
            challenge_ttl: Duration::from_secs(self.challenge_ttl_secs),
            token_expiry,
            renew_before: two_polls.min(token_expiry / 2),
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn network_options(&self) -> NetworkOptions {
        NetworkOptions {
            connection_timeout: self.connection_timeout(),
            max_line_bytes: self.max_line_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub interval_ms: u64,
    /// Attempts allowed for a task a worker refuses to run.
    pub max_retries: u32,
    pub retry_delay_base_secs: f64,
    pub strategy: StrategyKind,
    pub default_priority: TaskPriority,
    pub default_max_concurrent_tasks: u32,
    pub heartbeat_timeout_secs: u64,
    pub performance_window: usize,
    pub max_queued_tasks: usize,
    /// Finished tasks kept in memory.
    pub max_finished_tasks: usize,
    /// Age after which finished tasks, events and offline workers are
    /// dropped. 0 keeps everything.
    pub history_retention_days: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            max_retries: 3,
            retry_delay_base_secs: 5.0,
            strategy: StrategyKind::PerformanceBased,
            default_priority: TaskPriority::Normal,
            default_max_concurrent_tasks: 5,
            heartbeat_timeout_secs: 300,
            performance_window: 20,
            max_queued_tasks: DEFAULT_MAX_QUEUED_TASKS,
            max_finished_tasks: DEFAULT_MAX_FINISHED_TASKS,
            history_retention_days: 30,
        }
    }
}

impl SchedulerConfig {
    pub fn balancer_options(&self) -> BalancerOptions {
        BalancerOptions {
            strategy: self.strategy,
            heartbeat_timeout: chrono::Duration::seconds(self.heartbeat_timeout_secs as i64),
            performance_window: self.performance_window,
            default_max_concurrent_tasks: self.default_max_concurrent_tasks,
        }
    }

    /// `None` when history is kept forever.
    pub fn history_retention(&self) -> Option<chrono::Duration> {
        match self.history_retention_days {
            0 => None,
            days => Some(chrono::Duration::days(days.min(36_500) as i64)),
        }
    }

    /// Delay before re-submitting attempt `attempt + 1`: base * 2^(attempt-1).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let secs = self.retry_delay_base_secs * 2f64.powi(exponent);
        Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
    }
}

/// TLS for the master/worker channel.
///
/// The worker presents `cert_path`/`key_path`, generating a self-signed pair
/// when they are missing and `auto_generate` is set. The master verifies the
/// worker against `ca_cert_path` when given; otherwise it accepts any
/// certificate and relies on the token handshake for peer authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_cert_path: Option<PathBuf>,
    pub auto_generate: bool,
    /// Name the master expects in the worker certificate.
    pub server_name: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cert_path: PathBuf::from("certs/server.crt"),
            key_path: PathBuf::from("certs/server.key"),
            ca_cert_path: None,
            auto_generate: true,
            server_name: "localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub auth_token_file: PathBuf,
    pub tls: TlsConfig,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            auth_token_file: PathBuf::from("secrets/auth_token.txt"),
            tls: TlsConfig::default(),
        }
    }
}

/// Worker-side execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Interpreter the task code is handed to.
    pub program: String,
    /// Arguments placed before the code.
    pub args: Vec<String>,
    pub timeout_secs: u64,
    pub memory_limit_mb: u64,
    pub max_concurrent_tasks: u32,
    pub capabilities: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["-c".to_string()],
            timeout_secs: 300,
            memory_limit_mb: 512,
            max_concurrent_tasks: 5,
            capabilities: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub scheduler: SchedulerConfig,
    pub security: SecurityConfig,
    pub executor: ExecutorConfig,
    pub logging: LoggingConfig,
}

fn parse_override<T>(var: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidOverride {
        var: var.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidOverride {
            var: var.to_string(),
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

impl Config {
    /// Defaults, then the JSON file if given, then `WINLINK_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_from(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        const MASTER_PORT: &str = "WINLINK_MASTER_PORT";
        const WORKER_PORT: &str = "WINLINK_WORKER_PORT";
        const TLS_ENABLED: &str = "WINLINK_TLS_ENABLED";
        const STRATEGY: &str = "WINLINK_LOAD_BALANCING_STRATEGY";
        const INTERVAL: &str = "WINLINK_SCHEDULER_INTERVAL_MS";
        const MEMORY: &str = "WINLINK_MAX_MEMORY_MB";

        if let Some(v) = lookup(MASTER_PORT) {
            self.network.master_port = parse_override(MASTER_PORT, &v)?;
        }
        if let Some(v) = lookup(WORKER_PORT) {
            self.network.worker_port = parse_override(WORKER_PORT, &v)?;
        }
        if let Some(v) = lookup(TLS_ENABLED) {
            self.security.tls.enabled = parse_bool(TLS_ENABLED, &v)?;
        }
        if let Some(v) = lookup("WINLINK_AUTH_TOKEN_FILE") {
            self.security.auth_token_file = PathBuf::from(v);
        }
        if let Some(v) = lookup("WINLINK_SSL_CERT_FILE") {
            self.security.tls.cert_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("WINLINK_SSL_KEY_FILE") {
            self.security.tls.key_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("WINLINK_SSL_CA_FILE") {
            self.security.tls.ca_cert_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup(STRATEGY) {
            self.scheduler.strategy = parse_override(STRATEGY, &v)?;
        }
        if let Some(v) = lookup(INTERVAL) {
            self.scheduler.interval_ms = parse_override(INTERVAL, &v)?;
        }
        if let Some(v) = lookup(MEMORY) {
            self.executor.memory_limit_mb = parse_override(MEMORY, &v)?;
        }
        if let Some(v) = lookup("WINLINK_LOG_LEVEL") {
            self.logging.level = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.network.telemetry_interval_secs == 0 || self.network.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "telemetry and heartbeat intervals must be greater than 0".to_string(),
            ));
        }
        let base = self.scheduler.retry_delay_base_secs;
        if !base.is_finite() || base < 0.0 || base > MAX_RETRY_DELAY_BASE_SECS {
            return Err(ConfigError::Invalid(format!(
                "scheduler.retry_delay_base_secs must be between 0 and {}, got {}",
                MAX_RETRY_DELAY_BASE_SECS, base
            )));
        }
        if self.network.max_line_bytes == 0 {
            return Err(ConfigError::Invalid(
                "network.max_line_bytes must be greater than 0".to_string(),
            ));
        }
        if self.executor.max_concurrent_tasks == 0 {
            return Err(ConfigError::Invalid(
                "executor.max_concurrent_tasks must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.network.master_port, 9000);
        assert_eq!(cfg.network.worker_port, 9001);
        assert_eq!(cfg.scheduler.interval_ms, 1000);
        assert_eq!(cfg.scheduler.strategy, StrategyKind::PerformanceBased);
        assert_eq!(cfg.scheduler.max_retries, 3);
        assert!(cfg.security.tls.enabled);
        assert_eq!(cfg.executor.memory_limit_mb, 512);
        assert_eq!(cfg.executor.timeout_secs, 300);
        cfg.validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg: Config = serde_json::from_str(
            r#"{"scheduler": {"strategy": "least_loaded"}, "network": {"worker_port": 7001}}"#,
        )
        .unwrap();
        assert_eq!(cfg.scheduler.strategy, StrategyKind::LeastLoaded);
        assert_eq!(cfg.scheduler.interval_ms, 1000);
        assert_eq!(cfg.network.worker_port, 7001);
        assert_eq!(cfg.network.master_port, 9000);
    }

    #[test]
    fn unknown_strategy_in_file_is_an_error() {
        assert!(serde_json::from_str::<Config>(r#"{"scheduler": {"strategy": "fastest"}}"#).is_err());
    }

    #[test]
    fn env_overrides() {
        let mut cfg = Config::default();
        cfg.apply_env_from(env(&[
            ("WINLINK_MASTER_PORT", "9100"),
            ("WINLINK_TLS_ENABLED", "off"),
            ("WINLINK_LOAD_BALANCING_STRATEGY", "round_robin"),
            ("WINLINK_SSL_CA_FILE", "/etc/winlink/ca.pem"),
            ("WINLINK_MAX_MEMORY_MB", "1024"),
        ]))
        .unwrap();

        assert_eq!(cfg.network.master_port, 9100);
        assert!(!cfg.security.tls.enabled);
        assert_eq!(cfg.scheduler.strategy, StrategyKind::RoundRobin);
        assert_eq!(
            cfg.security.tls.ca_cert_path.as_deref(),
            Some(Path::new("/etc/winlink/ca.pem"))
        );
        assert_eq!(cfg.executor.memory_limit_mb, 1024);
    }

    #[test]
    fn malformed_override_rejected() {
        let mut cfg = Config::default();
        let err = cfg
            .apply_env_from(env(&[("WINLINK_WORKER_PORT", "ninety")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { ref var, .. } if var == "WINLINK_WORKER_PORT"));

        let err = cfg
            .apply_env_from(env(&[("WINLINK_TLS_ENABLED", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { .. }));
    }

    #[test]
    fn retry_delay_doubles() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.retry_delay(1), Duration::from_secs(5));
        assert_eq!(cfg.retry_delay(2), Duration::from_secs(10));
        assert_eq!(cfg.retry_delay(3), Duration::from_secs(20));
    }

    #[test]
    fn retry_delay_base_must_be_finite_and_non_negative() {
        for base in [f64::INFINITY, f64::NAN, -1.0, 1e300] {
            let mut cfg = Config::default();
            cfg.scheduler.retry_delay_base_secs = base;
            assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))), "{}", base);
        }

        let mut cfg = Config::default();
        cfg.scheduler.retry_delay_base_secs = MAX_RETRY_DELAY_BASE_SECS;
        cfg.validate().unwrap();
        assert_eq!(cfg.scheduler.retry_delay(40), Duration::from_secs(86_400 * 65_536));
    }

    #[test]
    fn retry_delay_never_panics_on_unvalidated_base() {
        let cfg = SchedulerConfig {
            retry_delay_base_secs: f64::INFINITY,
            ..SchedulerConfig::default()
        };
        assert_eq!(cfg.retry_delay(3), Duration::MAX);
    }

    #[test]
    fn renewal_margin_follows_telemetry_interval() {
        let network = NetworkConfig::default();
        assert_eq!(network.auth_options().renew_before, Duration::from_secs(10));

        let short = NetworkConfig {
            token_expiry_secs: 8,
            ..NetworkConfig::default()
        };
        assert_eq!(short.auth_options().renew_before, Duration::from_secs(4));
    }

    #[test]
    fn zero_retention_keeps_history() {
        let mut cfg = SchedulerConfig::default();
        assert_eq!(cfg.history_retention(), Some(chrono::Duration::days(30)));
        cfg.history_retention_days = 0;
        assert!(cfg.history_retention().is_none());
    }

    #[test]
    fn worker_endpoint_parsing() {
        let ep: WorkerEndpoint = "gpu-1@10.0.0.5:9001".parse().unwrap();
        assert_eq!(ep.worker_id, "gpu-1");
        assert_eq!(ep.address, "10.0.0.5:9001");
        assert!("10.0.0.5:9001".parse::<WorkerEndpoint>().is_err());
        assert!("@host:1".parse::<WorkerEndpoint>().is_err());
    }

    #[test]
    fn file_loading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("winlink.json");
        std::fs::write(&path, r#"{"logging": {"level": "debug", "json": true}}"#).unwrap();
        let cfg = Config::from_file(&path).unwrap();
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.logging.json);

        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Parse { .. })));
    }
}
