use std::fmt::{self, Display};
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::info;

/// Server settings, read from `SPOTBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind: IpAddr,
    pub data_dir: PathBuf,
    /// Shared connection password; per-user auth happens in SQL.
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between background compactions.
    pub compact_threshold: u64,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// Prometheus exporter port. Unset disables the endpoint.
    pub metrics_port: Option<u16>,
}

#[derive(Debug, PartialEq)]
pub struct ConfigError {
    pub key: &'static str,
    pub message: String,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {}", self.key, self.message)
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let config = Self {
            port: try_load(&lookup, "SPOTBOOK_PORT", "5433")?,
            bind: try_load(&lookup, "SPOTBOOK_BIND", "0.0.0.0")?,
            data_dir: try_load(&lookup, "SPOTBOOK_DATA_DIR", "./data")?,
            password: try_load(&lookup, "SPOTBOOK_PASSWORD", "spotbook")?,
            max_connections: try_load(&lookup, "SPOTBOOK_MAX_CONNECTIONS", "256")?,
            compact_threshold: try_load(&lookup, "SPOTBOOK_COMPACT_THRESHOLD", "1000")?,
            tls_cert: try_load_opt(&lookup, "SPOTBOOK_TLS_CERT")?,
            tls_key: try_load_opt(&lookup, "SPOTBOOK_TLS_KEY")?,
            metrics_port: try_load_opt(&lookup, "SPOTBOOK_METRICS_PORT")?,
        };
        if config.max_connections == 0 {
            return Err(ConfigError {
                key: "SPOTBOOK_MAX_CONNECTIONS",
                message: "must be at least 1".into(),
            });
        }
        if config.compact_threshold == 0 {
            return Err(ConfigError {
                key: "SPOTBOOK_COMPACT_THRESHOLD",
                message: "must be at least 1".into(),
            });
        }
        Ok(config)
    }
}

fn parse<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    raw.parse().map_err(|e: T::Err| ConfigError {
        key,
        message: format!("{raw:?}: {e}"),
    })
}

fn try_load<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: &str,
) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => parse(key, &raw),
        None => {
            info!("{key} not set, using default: {default}");
            parse(key, default)
        }
    }
}

fn try_load_opt<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: Display,
{
    lookup(key)
        .filter(|raw| !raw.is_empty())
        .map(|raw| parse(key, &raw))
        .transpose()
}
