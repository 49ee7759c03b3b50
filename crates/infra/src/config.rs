//! Process configuration loaded from the environment.

use std::net::SocketAddr;
use std::time::Duration;

use tracing::warn;

const DEV_CALLBACK_TOKEN: &str = "dev-callback-token";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: String,
}

// Keys stay out of logs.
impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobsConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub gateway_timeout: Duration,
    pub lease_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_size: 50,
            gateway_timeout: Duration::from_secs(30),
            lease_timeout: Duration::from_secs(900),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct FulfillmentConfig {
    pub bind_addr: SocketAddr,
    /// `None` selects the in-memory stores.
    pub database_url: Option<String>,
    pub payment_callback_token: String,
    pub payment_gateway: GatewayConfig,
    pub shipping_gateway: GatewayConfig,
    pub jobs: JobsConfig,
}

impl std::fmt::Debug for FulfillmentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FulfillmentConfig")
            .field("bind_addr", &self.bind_addr)
            .field("database_url", &self.database_url.as_ref().map(|_| "<set>"))
            .field("payment_callback_token", &"<redacted>")
            .field("payment_gateway", &self.payment_gateway)
            .field("shipping_gateway", &self.shipping_gateway)
            .field("jobs", &self.jobs)
            .finish()
    }
}

impl FulfillmentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bind_addr = match get("BIND_ADDR") {
            Some(raw) => raw.parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                name: "BIND_ADDR",
                reason: e.to_string(),
            })?,
            None => SocketAddr::from(([0, 0, 0, 0], 8080)),
        };

        let dev_mode = get("FULFILLMENT_DEV_MODE").is_some_and(|v| v.eq_ignore_ascii_case("true"));
        let payment_callback_token = match get("PAYMENT_CALLBACK_TOKEN") {
            Some(token) => token,
            None if dev_mode => {
                warn!("PAYMENT_CALLBACK_TOKEN not set; using insecure dev default");
                DEV_CALLBACK_TOKEN.to_string()
            }
            None => return Err(ConfigError::Missing("PAYMENT_CALLBACK_TOKEN")),
        };

        let defaults = JobsConfig::default();
        let jobs = JobsConfig {
            poll_interval: secs(&get, "JOB_POLL_INTERVAL_SECS", defaults.poll_interval)?,
            batch_size: positive(&get, "JOB_BATCH_SIZE", defaults.batch_size as u64)? as usize,
            gateway_timeout: secs(&get, "GATEWAY_TIMEOUT_SECS", defaults.gateway_timeout)?,
            lease_timeout: secs(&get, "JOB_LEASE_TIMEOUT_SECS", defaults.lease_timeout)?,
            sweep_interval: secs(&get, "JOB_SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
        };
        if jobs.lease_timeout <= jobs.gateway_timeout {
            return Err(ConfigError::Invalid {
                name: "JOB_LEASE_TIMEOUT_SECS",
                reason: "must be longer than GATEWAY_TIMEOUT_SECS".into(),
            });
        }

        Ok(Self {
            bind_addr,
            database_url: get("DATABASE_URL"),
            payment_callback_token,
            payment_gateway: GatewayConfig {
                base_url: get("PAYMENT_GATEWAY_URL")
                    .unwrap_or_else(|| "https://api.xendit.co".to_string()),
                api_key: get("PAYMENT_GATEWAY_SECRET_KEY").unwrap_or_default(),
            },
            shipping_gateway: GatewayConfig {
                base_url: get("SHIPPING_GATEWAY_URL")
                    .unwrap_or_else(|| "https://api.biteship.com".to_string()),
                api_key: get("SHIPPING_GATEWAY_API_KEY").unwrap_or_default(),
            },
            jobs,
        })
    }
}

fn positive<G>(get: &G, name: &'static str, default: u64) -> Result<u64, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(name) else {
        return Ok(default);
    };
    match raw.parse::<u64>() {
        Ok(0) => Err(ConfigError::Invalid {
            name,
            reason: "must be greater than zero".into(),
        }),
        Ok(v) => Ok(v),
        Err(e) => Err(ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
    }
}

fn secs<G>(get: &G, name: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    positive(get, name, default.as_secs()).map(Duration::from_secs)
}
