//! Configuration (§6, §9 "Global environment state"). Every setting the
//! broker needs is read from the process environment exactly once, here,
//! and threaded through as an explicit value from then on — nothing else
//! in this crate calls [`std::env::var`]. This is what lets tests
//! construct a [`BrokerConfig`] directly via [`BrokerConfig::for_test`]
//! without touching the environment at all.

use std::{path::PathBuf, time::Duration};

/// `INTERCOM_MODE` values (§4.A, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntercomMode {
    Plaintext,
    MutualTls,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for environment variable {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// All configuration needed to stand up the broker (§6 plus the defaults
/// named in §3 and §5). Construct once at process startup via
/// [`BrokerConfig::from_env`]; construct ad hoc in tests via
/// [`BrokerConfig::for_test`].
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub intercom_mode: IntercomMode,
    pub intercom_id: u32,
    pub intercom_port: u16,
    pub intercom_sitename: String,
    /// Only meaningful when `intercom_mode` is [`IntercomMode::MutualTls`]
    /// and the configured private key is passphrase-protected. Loading and
    /// decrypting the key material from disk is an external concern (§1);
    /// this field just carries the passphrase through.
    pub intercom_passphrase: Option<String>,

    pub site_intercom_id: u32,
    pub site_intercom_host: String,
    pub site_intercom_port: u16,

    /// Minimum `confirmations` at which a transaction is final for
    /// crediting (§3, default 3).
    pub confirm_threshold: i32,
    /// Fractional digits for balance amounts (§3, default 8).
    pub decimal_precision: u32,

    pub database_url: String,

    /// Base directory under which mode-2 certificate material lives, as
    /// `<config_dir>/cert/CA.pem` and `<config_dir>/cert/<sitename>/...`
    /// (§6). Defaults to the process's working directory.
    pub config_dir: PathBuf,

    /// §4.B default 30s.
    pub request_timeout: Duration,
    /// §5 default 10s.
    pub handler_shutdown_grace: Duration,
    /// §5 default 8.
    pub worker_pool_size: usize,
    /// §4.A, implementation-defined, default 16 MiB.
    pub max_frame: u32,
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let intercom_mode = match env_var("INTERCOM_MODE")?.as_str() {
            "1" => IntercomMode::Plaintext,
            "2" => IntercomMode::MutualTls,
            other => {
                return Err(ConfigError::Invalid {
                    name: "INTERCOM_MODE",
                    value: other.to_owned(),
                })
            }
        };

        Ok(Self {
            intercom_mode,
            intercom_id: parse_env("INTERCOM_ID")?,
            intercom_port: parse_env("INTERCOM_PORT")?,
            intercom_sitename: env_var("INTERCOM_SITENAME")?,
            intercom_passphrase: std::env::var("INTERCOM_PASSPHRASE").ok(),

            site_intercom_id: parse_env("SITE_INTERCOM_ID")?,
            site_intercom_host: env_var("SITE_INTERCOM_HOST")?,
            site_intercom_port: parse_env("SITE_INTERCOM_PORT")?,

            confirm_threshold: std::env::var("CONFIRM_THRESHOLD")
                .ok()
                .map(|v| parse("CONFIRM_THRESHOLD", &v))
                .transpose()?
                .unwrap_or(3),
            decimal_precision: std::env::var("DECIMAL_PRECISION")
                .ok()
                .map(|v| parse("DECIMAL_PRECISION", &v))
                .transpose()?
                .unwrap_or(8),

            database_url: env_var("DATABASE_URL")?,

            config_dir: std::env::var("CONFIG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),

            request_timeout: Duration::from_secs(
                std::env::var("REQUEST_TIMEOUT_SECS")
                    .ok()
                    .map(|v| parse("REQUEST_TIMEOUT_SECS", &v))
                    .transpose()?
                    .unwrap_or(30),
            ),
            handler_shutdown_grace: Duration::from_secs(
                std::env::var("HANDLER_SHUTDOWN_GRACE_SECS")
                    .ok()
                    .map(|v| parse("HANDLER_SHUTDOWN_GRACE_SECS", &v))
                    .transpose()?
                    .unwrap_or(10),
            ),
            worker_pool_size: std::env::var("WORKER_POOL_SIZE")
                .ok()
                .map(|v| parse("WORKER_POOL_SIZE", &v))
                .transpose()?
                .unwrap_or(8),
            max_frame: intercom::DEFAULT_MAX_FRAME,
        })
    }

    /// A [`BrokerConfig`] with fixed, deterministic test values, so unit
    /// and property tests never need to touch the real environment (§9).
    pub fn for_test() -> Self {
        Self {
            intercom_mode: IntercomMode::Plaintext,
            intercom_id: 1,
            intercom_port: 0,
            intercom_sitename: "test-site".to_owned(),
            intercom_passphrase: None,
            site_intercom_id: 2,
            site_intercom_host: "127.0.0.1".to_owned(),
            site_intercom_port: 0,
            confirm_threshold: 3,
            decimal_precision: 8,
            database_url: "postgres://test@localhost/test".to_owned(),
            config_dir: PathBuf::from("."),
            request_timeout: Duration::from_secs(5),
            handler_shutdown_grace: Duration::from_secs(1),
            worker_pool_size: 2,
            max_frame: intercom::DEFAULT_MAX_FRAME,
        }
    }
}

fn env_var(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn parse<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        name,
        value: value.to_owned(),
    })
}

fn parse_env<T: std::str::FromStr>(name: &'static str) -> Result<T, ConfigError> {
    parse(name, &env_var(name)?)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn for_test_config_has_sane_defaults() {
        let config = BrokerConfig::for_test();
        assert_eq!(config.confirm_threshold, 3);
        assert_eq!(config.decimal_precision, 8);
        assert_eq!(config.intercom_mode, IntercomMode::Plaintext);
    }
}
