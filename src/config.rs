use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::acquisition::PortalConfig;
use crate::gateway::GatewayConfig;
use crate::secret::{Credentials, SecretString};
use crate::transport::TransportConfig;

/// Application configuration loaded from `SCOUT_*` environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: Option<PathBuf>,
    pub transport: TransportConfig,
    pub gateway: GatewayConfig,
    /// Absent when no portal URL is configured
    pub portal: Option<PortalConfig>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let defaults = TransportConfig::default();
        let delay: f64 = parse_or(&get, "SCOUT_REQUEST_DELAY", defaults.request_delay.as_secs_f64())?;
        let timeout: f64 = parse_or(&get, "SCOUT_REQUEST_TIMEOUT", defaults.timeout.as_secs_f64())?;
        let transport = TransportConfig {
            request_delay: seconds("SCOUT_REQUEST_DELAY", delay)?,
            max_retries: parse_or(&get, "SCOUT_MAX_RETRIES", defaults.max_retries)?,
            timeout: seconds("SCOUT_REQUEST_TIMEOUT", timeout)?,
            backoff_base: Duration::from_millis(parse_or(
                &get,
                "SCOUT_BACKOFF_MS",
                defaults.backoff_base.as_millis() as u64,
            )?),
            ..defaults
        };

        let gateway_defaults = GatewayConfig::default();
        let gateway = GatewayConfig {
            webhook_secret: get("SCOUT_WEBHOOK_SECRET").map(SecretString::new).unwrap_or_default(),
            allow_private_destinations: parse_or(&get, "SCOUT_ALLOW_PRIVATE_WEBHOOKS", false)?,
            n8n_url: get("SCOUT_N8N_WEBHOOK_URL"),
            make_url: get("SCOUT_MAKE_WEBHOOK_URL"),
            source_tag: get("SCOUT_SOURCE_TAG").unwrap_or(gateway_defaults.source_tag),
            call_script: gateway_defaults.call_script,
        };

        let portal = match get("SCOUT_PORTAL_URL") {
            None => None,
            Some(url) => {
                let mut portal = PortalConfig::new(url);
                if let Some(path) = get("SCOUT_SEARCH_PATH") {
                    portal.search_path = path;
                }
                if let Some(path) = get("SCOUT_LOGIN_PATH") {
                    portal.login_path = path;
                }
                portal.credentials = match (get("SCOUT_PORTAL_USERNAME"), get("SCOUT_PORTAL_PASSWORD")) {
                    (Some(user), Some(password)) => Some(Credentials::new(user, password)),
                    (None, None) => None,
                    _ => bail!("SCOUT_PORTAL_USERNAME and SCOUT_PORTAL_PASSWORD must be set together"),
                };
                Some(portal)
            }
        };

        Ok(Self {
            db_path: get("SCOUT_DB_PATH").map(PathBuf::from),
            transport,
            gateway,
            portal,
        })
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .to_lowercase()
            .parse()
            .with_context(|| format!("{} must be a valid value, got '{}'", key, raw)),
        None => Ok(default),
    }
}

fn seconds(key: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("{} must be a non-negative number of seconds", key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.transport.request_delay, Duration::from_secs(2));
        assert_eq!(config.transport.max_retries, 3);
        assert_eq!(config.transport.timeout, Duration::from_secs(30));
        assert_eq!(config.transport.backoff_base, Duration::from_millis(500));
        assert!(!config.gateway.allow_private_destinations);
        assert!(config.gateway.webhook_secret.is_empty());
        assert!(config.portal.is_none());
        assert!(config.db_path.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("SCOUT_REQUEST_DELAY", "0.5"),
            ("SCOUT_MAX_RETRIES", "1"),
            ("SCOUT_ALLOW_PRIVATE_WEBHOOKS", "True"),
            ("SCOUT_WEBHOOK_SECRET", "whsec"),
            ("SCOUT_PORTAL_URL", "https://portal.example.com"),
            ("SCOUT_PORTAL_USERNAME", "me"),
            ("SCOUT_PORTAL_PASSWORD", "pw"),
        ])
        .unwrap();
        assert_eq!(config.transport.request_delay, Duration::from_millis(500));
        assert_eq!(config.transport.max_retries, 1);
        assert!(config.gateway.allow_private_destinations);
        assert!(config.gateway.webhook_secret.matches("whsec"));
        let portal = config.portal.unwrap();
        assert_eq!(portal.base_url, "https://portal.example.com");
        assert!(portal.credentials.is_some());
    }

    #[test]
    fn test_invalid_values() {
        assert!(config(&[("SCOUT_MAX_RETRIES", "many")]).is_err());
        assert!(config(&[("SCOUT_REQUEST_DELAY", "-1")]).is_err());
        assert!(config(&[("SCOUT_PORTAL_URL", "https://p.example.com"), ("SCOUT_PORTAL_USERNAME", "me")]).is_err());
    }
}
