//! Runtime configuration
//!
//! All settings come from environment variables with defaults suitable for
//! an in-cluster deployment. Lookups go through a closure so tests can feed
//! values without touching the process environment.

use crate::error::ControllerError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Webhook configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace holding the BareMetalHosts
    pub namespace: String,
    /// Shared HMAC secret; `None` disables signature verification
    pub webhook_secret: Option<String>,
    /// Image used when a START event carries none
    pub provision_image: Option<String>,
    pub provision_checksum: Option<String>,
    pub provision_checksum_type: String,
    /// Login user written into cloud-init user data
    pub userdata_user: String,
    pub port: u16,
    /// Overall deadline per event, covering the lock wait and every retry
    pub reconcile_timeout: Duration,
    pub reconcile_max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// How long the provisioning monitor waits for a terminal state
    pub provisioning_timeout: Duration,
    pub notification_endpoint: Option<String>,
    pub notification_timeout: Duration,
    pub webhook_log_endpoint: Option<String>,
    pub webhook_log_timeout: Duration,
    /// Exclude probe and metrics routes from request tracing
    pub disable_healthz_logs: bool,
}

impl Config {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// Empty values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let reconcile_max_attempts: u32 = parse_or(&get, "RECONCILE_MAX_ATTEMPTS", 5)?;
        if reconcile_max_attempts == 0 {
            return Err(ControllerError::InvalidConfig(
                "RECONCILE_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        let backoff_base = Duration::from_millis(parse_or(&get, "RECONCILE_BACKOFF_BASE_MS", 100)?);
        let backoff_max = Duration::from_millis(parse_or(&get, "RECONCILE_BACKOFF_MAX_MS", 5000)?);
        if backoff_max < backoff_base {
            return Err(ControllerError::InvalidConfig(
                "RECONCILE_BACKOFF_MAX_MS must not be below RECONCILE_BACKOFF_BASE_MS".to_string(),
            ));
        }

        Ok(Self {
            namespace: get("K8S_NAMESPACE").unwrap_or_else(|| "default".to_string()),
            webhook_secret: get("WEBHOOK_SECRET"),
            provision_image: get("PROVISION_IMAGE"),
            provision_checksum: get("PROVISION_CHECKSUM"),
            provision_checksum_type: get("PROVISION_CHECKSUM_TYPE")
                .unwrap_or_else(|| "sha256".to_string()),
            userdata_user: get("USERDATA_USER").unwrap_or_else(|| "provision".to_string()),
            port: parse_or(&get, "PORT", 8080)?,
            reconcile_timeout: Duration::from_secs(parse_or(&get, "RECONCILE_TIMEOUT_SECS", 30)?),
            reconcile_max_attempts,
            backoff_base,
            backoff_max,
            provisioning_timeout: Duration::from_secs(parse_or(&get, "PROVISIONING_TIMEOUT", 600)?),
            notification_endpoint: get("NOTIFICATION_ENDPOINT"),
            notification_timeout: Duration::from_secs(parse_or(&get, "NOTIFICATION_TIMEOUT", 30)?),
            webhook_log_endpoint: get("WEBHOOK_LOG_ENDPOINT"),
            webhook_log_timeout: Duration::from_secs(parse_or(&get, "WEBHOOK_LOG_TIMEOUT", 30)?),
            disable_healthz_logs: parse_bool(get("DISABLE_HEALTHZ_LOGS").as_deref(), true),
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ControllerError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| {
            ControllerError::InvalidConfig(format!("{} has invalid value '{}'", key, raw))
        }),
    }
}

fn parse_bool(value: Option<&str>, default: bool) -> bool {
    match value.map(str::to_ascii_lowercase).as_deref() {
        Some("true" | "1" | "yes" | "on") => true,
        Some("false" | "0" | "no" | "off") => false,
        _ => default,
    }
}
