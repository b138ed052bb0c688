//! Configuration management for ratecache.
//!
//! Settings are read once from the process environment and then passed by
//! reference into the constructors that need them. Variable names match the
//! field names upper-cased, e.g. `REDIS_PIPELINE_WINDOW`.

use std::collections::HashSet;
use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{RateCacheError, Result};
use crate::filter::{Filter, IpFilter, UidFilter};

/// How a store address should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketType {
    /// `host:port`
    Tcp,
    /// Filesystem path of a unix domain socket
    Unix,
}

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Process-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log_level: String,
    pub log_format: LogFormat,

    // Standard-unit counter store
    pub redis_socket_type: SocketType,
    pub redis_url: String,
    pub redis_pool_size: usize,
    pub redis_auth: String,
    pub redis_tls: bool,
    #[serde(deserialize_with = "deserialize_duration")]
    pub redis_pipeline_window: Duration,
    pub redis_pipeline_limit: usize,

    // Isolated store for SECOND-unit rules
    pub redis_persecond: bool,
    pub redis_persecond_socket_type: SocketType,
    pub redis_persecond_url: String,
    pub redis_persecond_pool_size: usize,
    pub redis_persecond_auth: String,
    pub redis_persecond_tls: bool,
    #[serde(deserialize_with = "deserialize_duration")]
    pub redis_persecond_pipeline_window: Duration,
    pub redis_persecond_pipeline_limit: usize,

    /// Upper bound, in seconds, of the random extension added to a counter's TTL
    pub expiration_jitter_max_seconds: u64,
    /// Near-cache byte budget; 0 disables it
    pub local_cache_size_in_bytes: usize,
    /// Fraction of the limit above which a within-limit hit counts as "near limit"
    pub near_limit_ratio: f64,

    /// Enforce every rule even when shadow mode is requested
    pub force_flag: bool,
    /// Global shadow mode: log over-limit decisions but report OK
    pub only_log_on_limit: bool,
    /// Treat "limiter unavailable" as over limit instead of OK
    pub failure_mode_deny: bool,

    pub blacklist_ip_net: String,
    pub whitelist_ip_net: String,
    pub blacklist_uid: String,
    pub whitelist_uid: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "WARN".to_string(),
            log_format: LogFormat::Text,
            redis_socket_type: SocketType::Tcp,
            redis_url: "localhost:6379".to_string(),
            redis_pool_size: 10,
            redis_auth: String::new(),
            redis_tls: false,
            redis_pipeline_window: default_pipeline_window(),
            redis_pipeline_limit: 8,
            redis_persecond: false,
            redis_persecond_socket_type: SocketType::Unix,
            redis_persecond_url: "/var/run/nutcracker/ratelimitpersecond.sock".to_string(),
            redis_persecond_pool_size: 10,
            redis_persecond_auth: String::new(),
            redis_persecond_tls: false,
            redis_persecond_pipeline_window: default_pipeline_window(),
            redis_persecond_pipeline_limit: 8,
            expiration_jitter_max_seconds: 300,
            local_cache_size_in_bytes: 0,
            near_limit_ratio: 0.8,
            force_flag: false,
            only_log_on_limit: false,
            failure_mode_deny: false,
            blacklist_ip_net: String::new(),
            whitelist_ip_net: String::new(),
            blacklist_uid: String::new(),
            whitelist_uid: String::new(),
        }
    }
}

fn default_pipeline_window() -> Duration {
    Duration::from_micros(75)
}

/// Connection and batching parameters of one counter store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    pub socket_type: SocketType,
    pub url: String,
    pub pool_size: usize,
    pub auth: Option<String>,
    pub tls: bool,
    pub pipeline: PipelineSettings,
}

/// Flush thresholds of a pipeline batcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub window: Duration,
    pub limit: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            window: default_pipeline_window(),
            limit: 8,
        }
    }
}

impl Settings {
    /// Load settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_environment(config::Environment::default())
    }

    /// Load settings from an explicit environment source.
    pub fn from_environment(environment: config::Environment) -> Result<Self> {
        let settings: Settings = config::Config::builder()
            .add_source(environment.try_parsing(true))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check everything that would otherwise fail later at request time.
    pub fn validate(&self) -> Result<()> {
        if self.redis_pool_size == 0 {
            return Err(RateCacheError::Config("REDIS_POOL_SIZE must be at least 1".into()));
        }
        if self.redis_persecond && self.redis_persecond_pool_size == 0 {
            return Err(RateCacheError::Config(
                "REDIS_PERSECOND_POOL_SIZE must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.near_limit_ratio) {
            return Err(RateCacheError::Config(format!(
                "NEAR_LIMIT_RATIO must be within [0, 1], got {}",
                self.near_limit_ratio
            )));
        }
        self.filters().map(|_| ())
    }

    /// Settings of the store used for every unit except SECOND (and for
    /// SECOND too when no per-second store is configured).
    pub fn standard_store(&self) -> StoreSettings {
        StoreSettings {
            socket_type: self.redis_socket_type,
            url: self.redis_url.clone(),
            pool_size: self.redis_pool_size,
            auth: non_empty(&self.redis_auth),
            tls: self.redis_tls,
            pipeline: PipelineSettings {
                window: self.redis_pipeline_window,
                limit: self.redis_pipeline_limit,
            },
        }
    }

    /// Settings of the isolated per-second store, if enabled.
    pub fn per_second_store(&self) -> Option<StoreSettings> {
        if !self.redis_persecond {
            return None;
        }
        Some(StoreSettings {
            socket_type: self.redis_persecond_socket_type,
            url: self.redis_persecond_url.clone(),
            pool_size: self.redis_persecond_pool_size,
            auth: non_empty(&self.redis_persecond_auth),
            tls: self.redis_persecond_tls,
            pipeline: PipelineSettings {
                window: self.redis_persecond_pipeline_window,
                limit: self.redis_persecond_pipeline_limit,
            },
        })
    }

    /// Build the IP and UID override filters.
    pub fn filters(&self) -> Result<(Filter, Filter)> {
        let ip = IpFilter::new(
            parse_ip_net_list(&self.whitelist_ip_net)?,
            parse_ip_net_list(&self.blacklist_ip_net)?,
        );
        let uid = UidFilter::new(
            parse_uid_list(&self.whitelist_uid),
            parse_uid_list(&self.blacklist_uid),
        );
        Ok((Filter::Ip(ip), Filter::Uid(uid)))
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Parse a comma-separated list of CIDR ranges. Blank items are skipped.
pub fn parse_ip_net_list(list: &str) -> Result<Vec<IpNet>> {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<IpNet>()
                .map_err(|source| RateCacheError::InvalidCidr {
                    entry: item.to_string(),
                    source,
                })
        })
        .collect()
}

/// Parse a comma-separated list of UIDs. Blank items are skipped.
pub fn parse_uid_list(list: &str) -> HashSet<String> {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a Go-style duration such as `75us`, `75µs`, `1ms` or `1m30s`.
///
/// A bare integer is read as microseconds.
pub fn parse_duration(input: &str) -> std::result::Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(micros) = input.parse::<u64>() {
        return Ok(Duration::from_micros(micros));
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration '{}'", input))?;
        if digits == 0 {
            return Err(format!("invalid duration '{}'", input));
        }
        let value: f64 = rest[..digits]
            .parse()
            .map_err(|_| format!("invalid number in duration '{}'", input))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            other => return Err(format!("unknown unit '{}' in duration '{}'", other, input)),
        };
        rest = &rest[unit_len..];
        total += Duration::from_nanos((value * nanos_per_unit).round() as u64);
    }
    Ok(total)
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Micros(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Micros(micros) => Ok(Duration::from_micros(micros)),
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}
