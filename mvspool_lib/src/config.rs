// Copyright (C) 2024, 2025 MVSPool Developers (see AUTHORS)
//
// This file is part of MVSPool
//
// MVSPool is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// MVSPool is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// MVSPool. If not, see <https://www.gnu.org/licenses/>.

use crate::util::is_valid_mvs_address;
use serde::Deserialize;
use std::time::Duration;

/// Minimum confirmation depth; maturity depth must be at least twice this.
const MIN_DEPTH: u64 = 16;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("you must set instance name")]
    MissingName,
    #[error("block maturity depth can't be < {0}, your depth is {1}")]
    DepthTooSmall(u64, u64),
    #[error("immature depth can't be < {0}, your depth is {1}")]
    ImmatureDepthTooSmall(u64, u64),
    #[error("invalid pool fee address: {0}")]
    InvalidFeeAddress(String),
    #[error("at least one upstream must be configured")]
    NoUpstreams,
    #[error("failed to load config: {0}")]
    Load(#[from] config::ConfigError),
}

/// Parses duration strings like "250ms", "10s", "2m" or "1h".
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("can't parse duration `{s}`: missing unit"))?;
    let (value, unit) = s.split_at(split);
    let value: u64 = value
        .parse()
        .map_err(|e| format!("can't parse duration `{s}`: {e}"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(format!("can't parse duration `{s}`: unknown unit `{unit}`")),
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    pub name: String,
    pub url: String,
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StratumTierConfig {
    pub enabled: bool,
    /// host:port this tier listens on
    pub listen: String,
    pub difficulty: u64,
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// host:port of the HTTP work endpoint
    pub listen: String,
    #[serde(default = "default_limit_headers_size")]
    pub limit_headers_size: usize,
    #[serde(default = "default_limit_body_size")]
    pub limit_body_size: usize,
    #[serde(default)]
    pub behind_reverse_proxy: bool,
    #[serde(deserialize_with = "deserialize_duration")]
    pub block_refresh_interval: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub state_update_interval: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub hashrate_expiration: Duration,
    #[serde(default)]
    pub health_check: bool,
    #[serde(default = "default_max_fails")]
    pub max_fails: i64,
    /// New-block push endpoint of the daemon (host:port, path /ws).
    /// The periodic refresh runs regardless, so this is optional.
    #[serde(default)]
    pub websocket: Option<String>,
    #[serde(default)]
    pub stratums: Vec<StratumTierConfig>,
}

fn default_limit_headers_size() -> usize {
    1024
}

fn default_limit_body_size() -> usize {
    256
}

fn default_max_fails() -> i64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct UnlockerConfig {
    pub enabled: bool,
    pub pool_fee: f64,
    #[serde(default)]
    pub pool_fee_address: String,
    #[serde(default)]
    pub donate: bool,
    pub depth: u64,
    pub immature_depth: u64,
    #[serde(default)]
    pub keep_tx_fees: bool,
    #[serde(deserialize_with = "deserialize_duration")]
    pub interval: Duration,
    /// Daemon the unlocker reconciles against; independent of the proxy
    /// upstreams so reward accounting can pin one node.
    pub daemon: String,
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    /// Coinbase payout address the pool mines to.
    pub address: String,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct LoggingConfig {
    /// Log to file if specified
    pub file: Option<String>,
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub console: Option<bool>,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Instance name, used as the node-state key in storage.
    pub name: String,
    /// Daemon account the pool authenticates RPC calls with.
    pub account: String,
    pub password: String,
    #[serde(deserialize_with = "deserialize_duration")]
    pub upstream_check_interval: Duration,
    pub upstreams: Vec<UpstreamConfig>,
    pub proxy: ProxyConfig,
    pub unlocker: UnlockerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let config: Config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("MVSPOOL").separator("_"))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Startup validation. Any error here refuses to start the pool.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::MissingName);
        }
        if self.upstreams.is_empty() {
            return Err(ConfigError::NoUpstreams);
        }
        if self.unlocker.depth < MIN_DEPTH * 2 {
            return Err(ConfigError::DepthTooSmall(MIN_DEPTH * 2, self.unlocker.depth));
        }
        if self.unlocker.immature_depth < MIN_DEPTH {
            return Err(ConfigError::ImmatureDepthTooSmall(
                MIN_DEPTH,
                self.unlocker.immature_depth,
            ));
        }
        if !self.unlocker.pool_fee_address.is_empty()
            && !is_valid_mvs_address(&self.unlocker.pool_fee_address)
        {
            return Err(ConfigError::InvalidFeeAddress(
                self.unlocker.pool_fee_address.clone(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
name = "main-pool"
account = "pool"
password = "secret"
upstream_check_interval = "5s"

[[upstreams]]
name = "local"
url = "http://127.0.0.1:8820/rpc/v2"
timeout = "10s"

[proxy]
listen = "0.0.0.0:8888"
limit_headers_size = 1024
limit_body_size = 256
behind_reverse_proxy = false
block_refresh_interval = "120ms"
state_update_interval = "3s"
hashrate_expiration = "3h"
health_check = true
max_fails = 100
websocket = "127.0.0.1:8821"

[[proxy.stratums]]
enabled = true
listen = "0.0.0.0:8008"
difficulty = 2000000
timeout = "120s"

[[proxy.stratums]]
enabled = false
listen = "0.0.0.0:8009"
difficulty = 8000000
timeout = "120s"

[unlocker]
enabled = true
pool_fee = 1.0
pool_fee_address = "MX1ycRPFcDNMMj122J81zKBd7PSFy8e632"
donate = false
depth = 32
immature_depth = 16
keep_tx_fees = false
interval = "10m"
daemon = "http://127.0.0.1:8820/rpc/v2"
timeout = "10s"
address = "MShk2pe2GF1AFuYthKUE7JWGJki4geg16U"

[logging]
level = "info"
"#;

    fn parse(toml: &str) -> Config {
        config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_load_sample_config() {
        let config = parse(SAMPLE);
        assert_eq!(config.name, "main-pool");
        assert_eq!(config.upstream_check_interval, Duration::from_secs(5));
        assert_eq!(config.proxy.block_refresh_interval, Duration::from_millis(120));
        assert_eq!(config.proxy.hashrate_expiration, Duration::from_secs(3 * 3600));
        assert_eq!(config.proxy.stratums.len(), 2);
        assert_eq!(config.proxy.stratums[0].difficulty, 2_000_000);
        assert_eq!(config.unlocker.interval, Duration::from_secs(600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_name_is_fatal() {
        let mut config = parse(SAMPLE);
        config.name.clear();
        assert!(matches!(config.validate(), Err(ConfigError::MissingName)));
    }

    #[test]
    fn test_shallow_depth_is_fatal() {
        let mut config = parse(SAMPLE);
        config.unlocker.depth = 31;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DepthTooSmall(32, 31))
        ));

        let mut config = parse(SAMPLE);
        config.unlocker.immature_depth = 15;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ImmatureDepthTooSmall(16, 15))
        ));
    }

    #[test]
    fn test_invalid_fee_address_is_fatal() {
        let mut config = parse(SAMPLE);
        config.unlocker.pool_fee_address = "MX1ycRPFcDNMMj122J81zKBd7PSFy8e633".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidFeeAddress(_))
        ));
    }

    #[test]
    fn test_empty_fee_address_is_allowed() {
        let mut config = parse(SAMPLE);
        config.unlocker.pool_fee_address.clear();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10d").is_err());
    }
}
