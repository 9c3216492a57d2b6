use crate::*;
use std::env::var;
use std::str::FromStr;
use std::time::Duration;

/// Longest accepted ceremony timeout: one week
pub const MAX_CEREMONY_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Runtime settings, read from `LPV_*` environment variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Hex ed25519 secret used to sign audit events. A fresh key is generated when absent.
    pub signing_key: Option<String>,
    pub max_rounds: u32,
    pub ceremony_timeout: Duration,
    pub ceremony_attempts: u32,
    pub append_retries: u32,
    pub backoff_base: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            signing_key: None,
            max_rounds: DEFAULT_MAX_ROUNDS,
            ceremony_timeout: Duration::from_secs(300),
            ceremony_attempts: 3,
            append_retries: 5,
            backoff_base: Duration::from_millis(100),
        }
    }
}

fn parse<T: FromStr>(name: &str, value: Option<String>, default: T) -> Result<T, Error> {
    match value {
        Some(val) => val
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{} must be a number, got {:?}", name, val))),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, Error> {
        Config::from_lookup(|name| var(name).ok())
    }

    /// Build a config from any variable source
    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self, Error> {
        let defaults = Config::default();

        let signing_key = match lookup("LPV_SIGNING_KEY") {
            Some(val) if !val.trim().is_empty() => {
                // Reject a malformed key now rather than at first signature
                Ed25519Signer::from_secret_hex(&val)
                    .map_err(|e| Error::Config(format!("LPV_SIGNING_KEY: {}", e)))?;
                Some(val.trim().to_owned())
            }
            _ => None,
        };

        let max_rounds = parse("LPV_MAX_ROUNDS", lookup("LPV_MAX_ROUNDS"), defaults.max_rounds)?;
        if max_rounds == 0 {
            return Err(Error::Config("LPV_MAX_ROUNDS must be at least 1".to_owned()));
        }

        let timeout_secs = parse(
            "LPV_CEREMONY_TIMEOUT_SECS",
            lookup("LPV_CEREMONY_TIMEOUT_SECS"),
            defaults.ceremony_timeout.as_secs(),
        )?;
        if timeout_secs > MAX_CEREMONY_TIMEOUT_SECS {
            return Err(Error::Config(format!(
                "LPV_CEREMONY_TIMEOUT_SECS must be at most {}, got {}",
                MAX_CEREMONY_TIMEOUT_SECS, timeout_secs
            )));
        }
        let ceremony_attempts = parse(
            "LPV_CEREMONY_ATTEMPTS",
            lookup("LPV_CEREMONY_ATTEMPTS"),
            defaults.ceremony_attempts,
        )?;
        let append_retries = parse(
            "LPV_APPEND_RETRIES",
            lookup("LPV_APPEND_RETRIES"),
            defaults.append_retries,
        )?;
        let backoff_ms = parse(
            "LPV_BACKOFF_BASE_MS",
            lookup("LPV_BACKOFF_BASE_MS"),
            defaults.backoff_base.as_millis() as u64,
        )?;

        Ok(Config {
            signing_key,
            max_rounds,
            ceremony_timeout: Duration::from_secs(timeout_secs),
            ceremony_attempts: ceremony_attempts.max(1),
            append_retries: append_retries.max(1),
            backoff_base: Duration::from_millis(backoff_ms),
        })
    }

    pub fn engine(&self) -> CountingEngine {
        CountingEngine::new(self.max_rounds)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.append_retries,
            base_delay: self.backoff_base,
            max_delay: self.backoff_base * 32,
        }
    }

    /// The audit signer for this process
    pub fn signer(&self) -> Result<Ed25519Signer, Error> {
        match &self.signing_key {
            Some(key) => Ed25519Signer::from_secret_hex(key),
            None => Ok(Ed25519Signer::generate()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(vars: &[(&str, &str)]) -> Result<Config, Error> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = from(&[]).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.engine().max_rounds(), 50);
        assert_eq!(config.retry_policy().max_attempts, 5);
        assert_eq!(config.ceremony_timeout, Duration::from_secs(300));
    }

    #[test]
    fn reads_overrides() {
        let key = Ed25519Signer::generate().secret_hex();
        let config = from(&[
            ("LPV_SIGNING_KEY", key.as_str()),
            ("LPV_MAX_ROUNDS", "12"),
            ("LPV_CEREMONY_TIMEOUT_SECS", "30"),
            ("LPV_CEREMONY_ATTEMPTS", "2"),
            ("LPV_BACKOFF_BASE_MS", "5"),
        ])
        .unwrap();
        assert_eq!(config.max_rounds, 12);
        assert_eq!(config.ceremony_attempts, 2);
        assert_eq!(config.retry_policy().base_delay, Duration::from_millis(5));
        assert_eq!(config.signer().unwrap().secret_hex(), key);
    }

    #[test]
    fn malformed_values_are_errors() {
        assert!(matches!(
            from(&[("LPV_MAX_ROUNDS", "fifty")]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            from(&[("LPV_MAX_ROUNDS", "0")]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            from(&[("LPV_SIGNING_KEY", "beef")]),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn huge_ceremony_timeout_rejected() {
        assert!(matches!(
            from(&[("LPV_CEREMONY_TIMEOUT_SECS", "18446744073709551615")]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            from(&[("LPV_CEREMONY_TIMEOUT_SECS", "99999999999999999999999")]),
            Err(Error::Config(_))
        ));

        let week = MAX_CEREMONY_TIMEOUT_SECS.to_string();
        let config = from(&[("LPV_CEREMONY_TIMEOUT_SECS", week.as_str())]).unwrap();
        assert_eq!(config.ceremony_timeout, Duration::from_secs(MAX_CEREMONY_TIMEOUT_SECS));
    }
}
