// src/config.rs

//! Proxy configuration: loading, defaults and validation.
//!
//! The configuration is TOML, deserialized with serde. Every knob has a
//! default chosen to be safe; `validate()` cross-checks references between
//! sections (services to servers and filters, listeners to services) so a
//! broken configuration is rejected at load time and never surfaces
//! mid-session.

use std::collections::HashSet;
use std::fs;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::monitor::{MasterConditions, SlaveConditions};
use crate::core::router::SelectCriteria;

/// Top-level configuration tree.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Worker threads started at boot.
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Upper bound for runtime worker resizes; slots are provisioned up
    /// front.
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// How long in-flight sessions may drain on shutdown before being
    /// force-closed.
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
    #[serde(default)]
    pub watermarks: WatermarkConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub users: UserCacheConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
}

fn default_threads() -> usize {
    4
}
fn default_max_threads() -> usize {
    64
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_shutdown_grace() -> Duration {
    Duration::from_secs(10)
}
fn default_inbox_capacity() -> usize {
    1024
}

/// Write-queue backpressure thresholds in bytes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct WatermarkConfig {
    #[serde(default = "default_low_water")]
    pub low: usize,
    #[serde(default = "default_high_water")]
    pub high: usize,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        WatermarkConfig {
            low: default_low_water(),
            high: default_high_water(),
        }
    }
}

fn default_low_water() -> usize {
    8 * 1024
}
fn default_high_water() -> usize {
    64 * 1024
}

/// Persistent backend pool settings (per worker).
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Parked connections older than this are evicted. Zero disables
    /// pooling.
    #[serde(default = "default_pool_ttl", with = "humantime_serde")]
    pub ttl: Duration,
    #[serde(default = "default_pool_max")]
    pub max_per_server: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            ttl: default_pool_ttl(),
            max_per_server: default_pool_max(),
        }
    }
}

fn default_pool_ttl() -> Duration {
    Duration::from_secs(60)
}
fn default_pool_max() -> usize {
    4
}

/// User-account cache settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UserCacheConfig {
    /// Seed/fallback account file (TOML), also used when no directory
    /// source is wired in.
    pub file: Option<String>,
    #[serde(default = "default_users_refresh", with = "humantime_serde")]
    pub refresh_interval: Duration,
    /// On-demand refreshes allowed per window, to stop thundering herds.
    #[serde(default = "default_users_refresh_limit")]
    pub refresh_limit: usize,
    #[serde(default = "default_users_refresh_window", with = "humantime_serde")]
    pub refresh_window: Duration,
}

impl Default for UserCacheConfig {
    fn default() -> Self {
        UserCacheConfig {
            file: None,
            refresh_interval: default_users_refresh(),
            refresh_limit: default_users_refresh_limit(),
            refresh_window: default_users_refresh_window(),
        }
    }
}

fn default_users_refresh() -> Duration {
    Duration::from_secs(30)
}
fn default_users_refresh_limit() -> usize {
    5
}
fn default_users_refresh_window() -> Duration {
    Duration::from_secs(60)
}

/// Monitor policy knobs the core honors when a monitor publishes status.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MonitorConfig {
    /// Allow more than one master per replication group.
    #[serde(default)]
    pub multi_master: bool,
    /// Keep the sticky `was_master` bit usable during failover windows.
    #[serde(default)]
    pub allow_stale_master: bool,
    #[serde(default)]
    pub master_conditions: MasterConditions,
    #[serde(default)]
    pub slave_conditions: SlaveConditions,
}

/// One backend server.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub address: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Status seeded before any monitor publishes: "master", "slave" or
    /// "down".
    #[serde(default)]
    pub initial_status: Option<String>,
}

fn default_server_port() -> u16 {
    3306
}

/// One routed service.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default = "default_router")]
    pub router: String,
    pub servers: Vec<String>,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub select_criteria: SelectCriteria,
    #[serde(default = "default_sescmd_history")]
    pub max_sescmd_history: usize,
    /// Replicas lagging more than this many seconds are not eligible;
    /// negative disables the cap.
    #[serde(default = "default_max_rlag")]
    pub max_replication_lag: i64,
    #[serde(default)]
    pub causal_reads: bool,
    #[serde(default = "default_causal_timeout", with = "humantime_serde")]
    pub causal_reads_timeout: Duration,
    #[serde(default = "default_retry_reads")]
    pub retry_failed_reads: bool,
    /// EWMA smoothing for adaptive routing, in (0, 1].
    #[serde(default = "default_latency_smoothing")]
    pub latency_smoothing: f64,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// A reply not completing within this window fires the same error path
    /// as a backend failure. Zero disables the timer.
    #[serde(default = "default_query_timeout", with = "humantime_serde")]
    pub query_timeout: Duration,
}

fn default_router() -> String {
    "readwritesplit".to_string()
}
fn default_sescmd_history() -> usize {
    50
}
fn default_max_rlag() -> i64 {
    -1
}
fn default_causal_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_retry_reads() -> bool {
    true
}
fn default_latency_smoothing() -> f64 {
    0.2
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_query_timeout() -> Duration {
    Duration::from_secs(300)
}

/// TLS material of a listener.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TlsConfig {
    pub cert: String,
    pub key: String,
}

/// One client-facing listener.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ListenerConfig {
    pub name: String,
    #[serde(default = "default_bind")]
    pub address: String,
    pub port: u16,
    pub service: String,
    /// Networks allowed to send a proxy-protocol prelude; unset disables
    /// the prelude entirely.
    pub proxy_networks: Option<String>,
    /// Relay client credentials to the master and let its reply decide
    /// (restricts the session to backends the relayed token can reach).
    #[serde(default)]
    pub passthrough_auth: bool,
    #[serde(default = "default_version_string")]
    pub version_string: String,
    pub tls: Option<TlsConfig>,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_version_string() -> String {
    "5.5.5-10.6.0-sqlgate".to_string()
}

/// Typed filter definitions, keyed by module.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "module", rename_all = "snake_case")]
pub enum FilterConfig {
    Regexfilter {
        name: String,
        #[serde(rename = "match")]
        pattern: String,
        replace: String,
        #[serde(default = "default_true")]
        case_insensitive: bool,
        #[serde(default)]
        extended: bool,
        source: Option<String>,
        user: Option<String>,
        log_file: Option<String>,
        #[serde(default)]
        log_trace: bool,
        #[serde(default = "default_growth_factor")]
        growth_factor: f64,
    },
    Tee {
        name: String,
        target: String,
        #[serde(rename = "match")]
        pattern: Option<String>,
        exclude: Option<String>,
        source: Option<String>,
        user: Option<String>,
        #[serde(default)]
        sync: bool,
    },
    Insertstream {
        name: String,
        source: Option<String>,
        user: Option<String>,
    },
    Topfilter {
        name: String,
        #[serde(default = "default_top_count")]
        count: usize,
        filebase: String,
        #[serde(rename = "match")]
        pattern: Option<String>,
        exclude: Option<String>,
        source: Option<String>,
        user: Option<String>,
    },
    Qlafilter {
        name: String,
        filebase: String,
        #[serde(default)]
        unified: bool,
        #[serde(default = "default_qla_separator")]
        separator: String,
        #[serde(rename = "match")]
        pattern: Option<String>,
        exclude: Option<String>,
        source: Option<String>,
        user: Option<String>,
    },
    Luafilter {
        name: String,
        global_script: Option<String>,
        session_script: Option<String>,
    },
    Optimistictrx {
        name: String,
    },
}

impl FilterConfig {
    pub fn name(&self) -> &str {
        match self {
            FilterConfig::Regexfilter { name, .. }
            | FilterConfig::Tee { name, .. }
            | FilterConfig::Insertstream { name, .. }
            | FilterConfig::Topfilter { name, .. }
            | FilterConfig::Qlafilter { name, .. }
            | FilterConfig::Luafilter { name, .. }
            | FilterConfig::Optimistictrx { name } => name,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_growth_factor() -> f64 {
    1.5
}
fn default_top_count() -> usize {
    10
}
fn default_qla_separator() -> String {
    ",".to_string()
}

impl Config {
    /// Loads and validates a configuration file.
    pub fn from_file(path: &str) -> Result<Config> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading configuration file '{path}'"))?;
        let config: Config =
            toml::from_str(&raw).with_context(|| format!("parsing configuration '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-checks the configuration tree.
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            bail!("threads must be at least 1");
        }
        if self.threads > self.max_threads {
            bail!(
                "threads ({}) exceeds max_threads ({})",
                self.threads,
                self.max_threads
            );
        }
        if self.watermarks.low > self.watermarks.high {
            bail!("watermark low must not exceed high");
        }

        let mut server_names = HashSet::new();
        for server in &self.servers {
            if !server_names.insert(server.name.as_str()) {
                bail!("duplicate server '{}'", server.name);
            }
            if let Some(status) = &server.initial_status
                && !matches!(status.as_str(), "master" | "slave" | "down")
            {
                bail!(
                    "server '{}': initial_status must be master, slave or down",
                    server.name
                );
            }
        }
        let filter_names: HashSet<&str> = self.filters.iter().map(|f| f.name()).collect();
        if filter_names.len() != self.filters.len() {
            bail!("duplicate filter names");
        }

        let mut service_names = HashSet::new();
        for service in &self.services {
            if !service_names.insert(service.name.as_str()) {
                bail!("duplicate service '{}'", service.name);
            }
            if service.servers.is_empty() {
                bail!("service '{}' has no servers", service.name);
            }
            for server in &service.servers {
                if !server_names.contains(server.as_str()) {
                    bail!("service '{}' references unknown server '{server}'", service.name);
                }
            }
            for filter in &service.filters {
                if !filter_names.contains(filter.as_str()) {
                    bail!("service '{}' references unknown filter '{filter}'", service.name);
                }
            }
            if !(0.0..=1.0).contains(&service.latency_smoothing) || service.latency_smoothing == 0.0
            {
                bail!("service '{}': latency_smoothing must be in (0, 1]", service.name);
            }
        }

        for listener in &self.listeners {
            if !service_names.contains(listener.service.as_str()) {
                bail!(
                    "listener '{}' references unknown service '{}'",
                    listener.name,
                    listener.service
                );
            }
            if let Some(networks) = &listener.proxy_networks {
                crate::core::protocol::proxy_header::AllowedNetworks::parse(networks)
                    .map_err(|e| anyhow!("listener '{}': {e}", listener.name))?;
            }
        }

        for filter in &self.filters {
            if let FilterConfig::Tee { name, target, .. } = filter
                && !service_names.contains(target.as_str())
            {
                bail!("tee filter '{name}' targets unknown service '{target}'");
            }
        }
        Ok(())
    }
}
