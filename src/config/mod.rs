//! Configuration management module
//!
//! Handles loading configuration from environment variables and config files,
//! with environment variables taking priority over config file values.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (highest priority)
//! 2. Configuration file (config.toml)
//! 3. Default values (lowest priority)

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One entry of the `doh_providers` configuration map.
///
/// The value half of `doh_providers` is a comma-separated list of bootstrap
/// resolver IPs, with two sentinels: an empty string means "always-on
/// secure" (this provider is used regardless of the active nameserver), and
/// `"*"` means "automatic with fallback regardless of which resolver is
/// active".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum BootstrapResolvers {
    /// Empty value: the provider is always-on secure.
    AlwaysOn,
    /// `"*"`: automatic, independent of the active nameserver.
    Automatic,
    /// Comma-separated bootstrap resolver IPs: the provider participates
    /// only when one of these is the active nameserver.
    Scoped(Vec<String>),
}

impl BootstrapResolvers {
    pub fn parse(raw: &str) -> Self {
        if raw.is_empty() {
            BootstrapResolvers::AlwaysOn
        } else if raw == "*" {
            BootstrapResolvers::Automatic
        } else {
            BootstrapResolvers::Scoped(raw.split(',').map(|s| s.trim().to_string()).collect())
        }
    }
}

/// Application configuration: the external configuration surface listed in
/// the resolver's spec (nameservers, DoH providers, domain policy lists,
/// listen addresses, tuned parameters). No web UI, no database, no auth.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// UDP and TCP addresses to listen on.
    pub listen_addrs: Vec<SocketAddr>,

    /// Plain-text nameserver IP literals (v4 or v6).
    pub nameservers: Vec<String>,

    /// DoH provider URL -> bootstrap resolver spec (raw string form, parsed
    /// via `BootstrapResolvers::parse`).
    pub doh_providers: HashMap<String, String>,

    /// When true, plain-text fallback is disallowed even on DoH failure.
    pub always_on_doh: bool,

    /// FQDNs or `*.`-prefixed suffixes forced to use DoH.
    pub doh_included_domains: Vec<String>,
    /// FQDNs or `*.`-prefixed suffixes forced to bypass DoH.
    pub doh_excluded_domains: Vec<String>,

    /// Whether probing is active; disabled in some test configurations.
    pub probing_enabled: bool,

    // Tuned parameters (spec section 6); exposed here, unlike the source,
    // since this core has no other configuration surface to hide them behind.
    pub max_concurrent_upstreams: usize,
    pub default_recv_buf: usize,
    pub max_recv_buf: usize,
    pub retry_jitter_multiplier: f64,
    pub probe_initial_delay_secs: f64,
    pub probe_max_delay_secs: f64,
    pub probe_retry_multiplier: f64,
    pub max_query_retries: u32,
    pub upstream_timeout_ms: u64,
    pub tcp_listen_backlog: u32,

    // Log configuration
    pub log_path: PathBuf,
    pub log_level: String,
    pub log_max_size: u64,
    pub log_retention_days: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addrs: vec!["127.0.0.1:53".parse().unwrap()],
            nameservers: Vec::new(),
            doh_providers: HashMap::new(),
            always_on_doh: false,
            doh_included_domains: Vec::new(),
            doh_excluded_domains: Vec::new(),
            probing_enabled: true,
            max_concurrent_upstreams: 3,
            default_recv_buf: 2048,
            max_recv_buf: 65536,
            retry_jitter_multiplier: 0.2,
            probe_initial_delay_secs: 1.0,
            probe_max_delay_secs: 3600.0,
            probe_retry_multiplier: 1.5,
            max_query_retries: 3,
            upstream_timeout_ms: 5000,
            tcp_listen_backlog: 16,
            log_path: PathBuf::from("logs"),
            log_level: "info".to_string(),
            log_max_size: 10 * 1024 * 1024,
            log_retention_days: 30,
        }
    }
}

/// Partial configuration for merging from different sources.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct PartialConfig {
    pub listen_addrs: Option<Vec<SocketAddr>>,
    pub nameservers: Option<Vec<String>>,
    pub doh_providers: Option<HashMap<String, String>>,
    pub always_on_doh: Option<bool>,
    pub doh_included_domains: Option<Vec<String>>,
    pub doh_excluded_domains: Option<Vec<String>>,
    pub probing_enabled: Option<bool>,
    pub max_concurrent_upstreams: Option<usize>,
    pub default_recv_buf: Option<usize>,
    pub max_recv_buf: Option<usize>,
    pub retry_jitter_multiplier: Option<f64>,
    pub probe_initial_delay_secs: Option<f64>,
    pub probe_max_delay_secs: Option<f64>,
    pub probe_retry_multiplier: Option<f64>,
    pub max_query_retries: Option<u32>,
    pub upstream_timeout_ms: Option<u64>,
    pub tcp_listen_backlog: Option<u32>,
    pub log_path: Option<PathBuf>,
    pub log_level: Option<String>,
    pub log_max_size: Option<u64>,
    pub log_retention_days: Option<u32>,
}

/// Configuration manager responsible for loading and providing access to
/// configuration.
pub struct ConfigManager {
    config: RwLock<AppConfig>,
}

impl ConfigManager {
    /// Load configuration from environment variables and config file.
    pub fn load() -> Result<Self> {
        Self::load_with_path("config.toml")
    }

    /// Load configuration with a custom config file path.
    pub fn load_with_path<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = AppConfig::default();

        if let Ok(file_config) = Self::load_from_file(config_path.as_ref()) {
            Self::merge_config(&mut config, file_config);
        }

        let env_config = Self::load_from_env();
        Self::merge_config(&mut config, env_config);

        Ok(Self {
            config: RwLock::new(config),
        })
    }

    /// Create a ConfigManager from explicit configs for testing.
    pub fn from_configs(
        file_config: Option<PartialConfig>,
        env_config: Option<PartialConfig>,
    ) -> Self {
        let mut config = AppConfig::default();

        if let Some(fc) = file_config {
            Self::merge_config(&mut config, fc);
        }
        if let Some(ec) = env_config {
            Self::merge_config(&mut config, ec);
        }

        Self {
            config: RwLock::new(config),
        }
    }

    /// Get the current configuration.
    pub fn get(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Load configuration overrides from environment variables.
    ///
    /// List-valued fields are comma-separated; `doh_providers` is
    /// `url=bootstrap;url=bootstrap` pairs.
    pub fn load_from_env() -> PartialConfig {
        PartialConfig {
            listen_addrs: std::env::var("LISTEN_ADDRS").ok().map(|v| {
                v.split(',')
                    .filter_map(|a| a.trim().parse().ok())
                    .collect()
            }),
            nameservers: std::env::var("NAMESERVERS")
                .ok()
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect()),
            doh_providers: std::env::var("DOH_PROVIDERS").ok().map(|v| {
                v.split(';')
                    .filter_map(|pair| {
                        let (url, bootstrap) = pair.split_once('=')?;
                        Some((url.trim().to_string(), bootstrap.trim().to_string()))
                    })
                    .collect()
            }),
            always_on_doh: std::env::var("ALWAYS_ON_DOH")
                .ok()
                .and_then(|v| v.parse().ok()),
            doh_included_domains: std::env::var("DOH_INCLUDED_DOMAINS")
                .ok()
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect()),
            doh_excluded_domains: std::env::var("DOH_EXCLUDED_DOMAINS")
                .ok()
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect()),
            probing_enabled: std::env::var("PROBING_ENABLED")
                .ok()
                .and_then(|v| v.parse().ok()),
            max_concurrent_upstreams: std::env::var("MAX_CONCURRENT_UPSTREAMS")
                .ok()
                .and_then(|v| v.parse().ok()),
            default_recv_buf: std::env::var("DEFAULT_RECV_BUF")
                .ok()
                .and_then(|v| v.parse().ok()),
            max_recv_buf: std::env::var("MAX_RECV_BUF").ok().and_then(|v| v.parse().ok()),
            retry_jitter_multiplier: std::env::var("RETRY_JITTER_MULTIPLIER")
                .ok()
                .and_then(|v| v.parse().ok()),
            probe_initial_delay_secs: std::env::var("PROBE_INITIAL_DELAY_SECS")
                .ok()
                .and_then(|v| v.parse().ok()),
            probe_max_delay_secs: std::env::var("PROBE_MAX_DELAY_SECS")
                .ok()
                .and_then(|v| v.parse().ok()),
            probe_retry_multiplier: std::env::var("PROBE_RETRY_MULTIPLIER")
                .ok()
                .and_then(|v| v.parse().ok()),
            max_query_retries: std::env::var("MAX_QUERY_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok()),
            upstream_timeout_ms: std::env::var("UPSTREAM_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok()),
            tcp_listen_backlog: std::env::var("TCP_LISTEN_BACKLOG")
                .ok()
                .and_then(|v| v.parse().ok()),
            log_path: std::env::var("LOG_PATH").ok().map(PathBuf::from),
            log_level: std::env::var("LOG_LEVEL").ok(),
            log_max_size: std::env::var("LOG_MAX_SIZE").ok().and_then(|v| v.parse().ok()),
            log_retention_days: std::env::var("LOG_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }

    /// Load configuration from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<PartialConfig> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let config: PartialConfig =
            toml::from_str(&content).with_context(|| "Failed to parse config file as TOML")?;
        Ok(config)
    }

    /// Merge a partial config into a full config, field by field.
    pub fn merge_config(config: &mut AppConfig, partial: PartialConfig) {
        if let Some(v) = partial.listen_addrs {
            config.listen_addrs = v;
        }
        if let Some(v) = partial.nameservers {
            config.nameservers = v;
        }
        if let Some(v) = partial.doh_providers {
            config.doh_providers = v;
        }
        if let Some(v) = partial.always_on_doh {
            config.always_on_doh = v;
        }
        if let Some(v) = partial.doh_included_domains {
            config.doh_included_domains = v;
        }
        if let Some(v) = partial.doh_excluded_domains {
            config.doh_excluded_domains = v;
        }
        if let Some(v) = partial.probing_enabled {
            config.probing_enabled = v;
        }
        if let Some(v) = partial.max_concurrent_upstreams {
            config.max_concurrent_upstreams = v;
        }
        if let Some(v) = partial.default_recv_buf {
            config.default_recv_buf = v;
        }
        if let Some(v) = partial.max_recv_buf {
            config.max_recv_buf = v;
        }
        if let Some(v) = partial.retry_jitter_multiplier {
            config.retry_jitter_multiplier = v;
        }
        if let Some(v) = partial.probe_initial_delay_secs {
            config.probe_initial_delay_secs = v;
        }
        if let Some(v) = partial.probe_max_delay_secs {
            config.probe_max_delay_secs = v;
        }
        if let Some(v) = partial.probe_retry_multiplier {
            config.probe_retry_multiplier = v;
        }
        if let Some(v) = partial.max_query_retries {
            config.max_query_retries = v;
        }
        if let Some(v) = partial.upstream_timeout_ms {
            config.upstream_timeout_ms = v;
        }
        if let Some(v) = partial.tcp_listen_backlog {
            config.tcp_listen_backlog = v;
        }
        if let Some(v) = partial.log_path {
            config.log_path = v;
        }
        if let Some(v) = partial.log_level {
            config.log_level = v;
        }
        if let Some(v) = partial.log_max_size {
            config.log_max_size = v;
        }
        if let Some(v) = partial.log_retention_days {
            config.log_retention_days = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.max_concurrent_upstreams, 3);
        assert_eq!(config.default_recv_buf, 2048);
        assert_eq!(config.max_recv_buf, 65536);
        assert_eq!(config.tcp_listen_backlog, 16);
        assert!(!config.always_on_doh);
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
nameservers = ["1.1.1.1", "8.8.8.8"]
always_on_doh = true
log_level = "debug"
"#
        )
        .unwrap();

        let config = ConfigManager::load_from_file(file.path()).unwrap();
        assert_eq!(
            config.nameservers,
            Some(vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()])
        );
        assert_eq!(config.always_on_doh, Some(true));
        assert_eq!(config.log_level, Some("debug".to_string()));
    }

    #[test]
    fn test_merge_config() {
        let mut config = AppConfig::default();
        let partial = PartialConfig {
            nameservers: Some(vec!["9.9.9.9".to_string()]),
            always_on_doh: Some(true),
            ..Default::default()
        };

        ConfigManager::merge_config(&mut config, partial);

        assert_eq!(config.nameservers, vec!["9.9.9.9".to_string()]);
        assert!(config.always_on_doh);
        assert_eq!(config.max_concurrent_upstreams, 3); // unchanged
    }

    #[test]
    fn test_env_priority_over_file() {
        let file_config = PartialConfig {
            nameservers: Some(vec!["1.1.1.1".to_string()]),
            always_on_doh: Some(false),
            ..Default::default()
        };

        let env_config = PartialConfig {
            always_on_doh: Some(true),
            ..Default::default()
        };

        let manager = ConfigManager::from_configs(Some(file_config), Some(env_config));
        let config = manager.get();

        assert!(config.always_on_doh);
        assert_eq!(config.nameservers, vec!["1.1.1.1".to_string()]);
    }

    #[test]
    fn test_missing_config_file_uses_defaults() {
        let manager = ConfigManager::load_with_path("nonexistent_config.toml").unwrap();
        let config = manager.get();
        assert_eq!(config.max_concurrent_upstreams, 3);
    }

    #[test]
    fn bootstrap_resolvers_parses_sentinels() {
        assert_eq!(BootstrapResolvers::parse(""), BootstrapResolvers::AlwaysOn);
        assert_eq!(BootstrapResolvers::parse("*"), BootstrapResolvers::Automatic);
        assert_eq!(
            BootstrapResolvers::parse("1.1.1.1,8.8.8.8"),
            BootstrapResolvers::Scoped(vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()])
        );
    }
}
