use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::strategies::{LogicalOperator, TelemetryRule};

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub enforcer: EnforcerConfig,
    pub cache: CacheConfig,
    pub cluster: ClusterConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub policies: Vec<PolicyConfig>,
}

#[derive(Clone, Debug)]
pub struct EnforcerConfig {
    pub interval_secs: u64,
    pub call_timeout_secs: u64,
}

impl EnforcerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub max_metric_age_secs: Option<u64>,
}

impl CacheConfig {
    pub fn max_metric_age(&self) -> Option<chrono::Duration> {
        self.max_metric_age_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(chrono::Duration::try_seconds)
    }
}

#[derive(Clone, Debug)]
pub struct ClusterConfig {
    pub nodes: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

/// A policy declared in the config file, with the strategies backing it.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct PolicyConfig {
    pub name: String,
    #[serde(default)]
    pub strategies: Vec<StrategyConfig>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct StrategyConfig {
    #[serde(rename = "type")]
    pub strategy_type: String,
    #[serde(default)]
    pub logical_operator: Option<LogicalOperator>,
    #[serde(default)]
    pub rules: Vec<TelemetryRule>,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub interval_secs: Option<u64>,
    pub call_timeout_secs: Option<u64>,
    pub health_check_port: Option<u16>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            enforcer: EnforcerConfig { interval_secs: 5, call_timeout_secs: 10 },
            cache: CacheConfig { max_metric_age_secs: None },
            cluster: ClusterConfig { nodes: Vec::new() },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                health_check_port: 9001,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
            policies: Vec::new(),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("tas.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(enforcer) = patch.enforcer {
            if let Some(interval_secs) = enforcer.interval_secs {
                self.enforcer.interval_secs = interval_secs;
            }
            if let Some(call_timeout_secs) = enforcer.call_timeout_secs {
                self.enforcer.call_timeout_secs = call_timeout_secs;
            }
        }

        if let Some(cache) = patch.cache {
            if let Some(max_metric_age_secs) = cache.max_metric_age_secs {
                self.cache.max_metric_age_secs = Some(max_metric_age_secs);
            }
        }

        if let Some(cluster) = patch.cluster {
            if let Some(nodes) = cluster.nodes {
                self.cluster.nodes = nodes;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }

        if let Some(policies) = patch.policies {
            self.policies = policies;
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("TAS_ENFORCER_INTERVAL_SECS") {
            self.enforcer.interval_secs = parse_u64("TAS_ENFORCER_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("TAS_ENFORCER_CALL_TIMEOUT_SECS") {
            self.enforcer.call_timeout_secs = parse_u64("TAS_ENFORCER_CALL_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("TAS_CACHE_MAX_METRIC_AGE_SECS") {
            self.cache.max_metric_age_secs =
                Some(parse_u64("TAS_CACHE_MAX_METRIC_AGE_SECS", &value)?);
        }

        if let Some(value) = read_env("TAS_CLUSTER_NODES") {
            self.cluster.nodes = value
                .split(',')
                .map(str::trim)
                .filter(|node| !node.is_empty())
                .map(str::to_owned)
                .collect();
        }

        if let Some(value) = read_env("TAS_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("TAS_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port = parse_u16("TAS_SERVER_HEALTH_CHECK_PORT", &value)?;
        }
        if let Some(value) = read_env("TAS_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("TAS_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level = read_env("TAS_LOGGING_LEVEL").or_else(|| read_env("TAS_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format = read_env("TAS_LOGGING_FORMAT").or_else(|| read_env("TAS_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(interval_secs) = overrides.interval_secs {
            self.enforcer.interval_secs = interval_secs;
        }
        if let Some(call_timeout_secs) = overrides.call_timeout_secs {
            self.enforcer.call_timeout_secs = call_timeout_secs;
        }
        if let Some(health_check_port) = overrides.health_check_port {
            self.server.health_check_port = health_check_port;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(log_format) = overrides.log_format {
            self.logging.format = log_format;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_enforcer(&self.enforcer)?;
        validate_cache(&self.cache)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        validate_policies(&self.policies)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("tas.toml"), PathBuf::from("config/tas.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_enforcer(enforcer: &EnforcerConfig) -> Result<(), ConfigError> {
    if enforcer.interval_secs == 0 || enforcer.interval_secs > 3600 {
        return Err(ConfigError::Validation(
            "enforcer.interval_secs must be in range 1..=3600".to_string(),
        ));
    }

    if enforcer.call_timeout_secs == 0 || enforcer.call_timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "enforcer.call_timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_cache(cache: &CacheConfig) -> Result<(), ConfigError> {
    if let Some(secs) = cache.max_metric_age_secs {
        if !(1..=86_400).contains(&secs) {
            return Err(ConfigError::Validation(
                "cache.max_metric_age_secs must be within 1..=86400 when set".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn validate_policies(policies: &[PolicyConfig]) -> Result<(), ConfigError> {
    let mut seen = BTreeSet::new();
    for policy in policies {
        let name = policy.name.trim();
        if name.is_empty() {
            return Err(ConfigError::Validation("policies[].name must not be empty".to_string()));
        }
        if !seen.insert(name) {
            return Err(ConfigError::Validation(format!(
                "policy `{name}` is declared more than once"
            )));
        }

        let mut strategy_types = BTreeSet::new();
        for strategy in &policy.strategies {
            let strategy_type = strategy.strategy_type.trim();
            if !strategy_types.insert(strategy_type) {
                return Err(ConfigError::Validation(format!(
                    "policy `{name}` declares strategy type `{strategy_type}` more than once"
                )));
            }
        }
    }
    Ok(())
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    enforcer: Option<EnforcerPatch>,
    cache: Option<CachePatch>,
    cluster: Option<ClusterPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
    policies: Option<Vec<PolicyConfig>>,
}

#[derive(Debug, Default, Deserialize)]
struct EnforcerPatch {
    interval_secs: Option<u64>,
    call_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CachePatch {
    max_metric_age_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ClusterPatch {
    nodes: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
