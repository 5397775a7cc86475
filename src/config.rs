use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server settings, read from `FLEETCAL_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub write_timeout: Duration,
    pub sweep_interval: Duration,
    pub anonymous_user: String,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "fleetcal".into(),
            max_connections: 256,
            compact_threshold: 1000,
            write_timeout: Duration::from_millis(5000),
            sweep_interval: Duration::from_secs(60),
            anonymous_user: "anonymous".into(),
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset or unparsable values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());
        Self {
            bind: lookup("FLEETCAL_BIND").unwrap_or(d.bind),
            port: parse_or(&lookup, "FLEETCAL_PORT", d.port),
            data_dir: lookup("FLEETCAL_DATA_DIR").map_or(d.data_dir, PathBuf::from),
            password: lookup("FLEETCAL_PASSWORD").unwrap_or(d.password),
            max_connections: parse_or(&lookup, "FLEETCAL_MAX_CONNECTIONS", d.max_connections),
            compact_threshold: parse_or(&lookup, "FLEETCAL_COMPACT_THRESHOLD", d.compact_threshold),
            write_timeout: parsed("FLEETCAL_WRITE_TIMEOUT_MS")
                .map_or(d.write_timeout, Duration::from_millis),
            sweep_interval: parsed("FLEETCAL_SWEEP_INTERVAL_SECS")
                .filter(|s| *s > 0)
                .map_or(d.sweep_interval, Duration::from_secs),
            anonymous_user: lookup("FLEETCAL_ANONYMOUS_USER").unwrap_or(d.anonymous_user),
            metrics_port: lookup("FLEETCAL_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
            tls_cert: lookup("FLEETCAL_TLS_CERT"),
            tls_key: lookup("FLEETCAL_TLS_KEY"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}
