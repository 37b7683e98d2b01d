use std::path::PathBuf;
use std::str::FromStr;

use crate::limits::*;
use crate::resolver::RetryPolicy;
use crate::tenant::TenantSettings;

/// Server settings, read once from `TRIPLOCK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub tenant: TenantSettings,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            bind: lookup("TRIPLOCK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&lookup, "TRIPLOCK_PORT").unwrap_or(7433),
            data_dir: lookup("TRIPLOCK_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            max_connections: parsed(&lookup, "TRIPLOCK_MAX_CONNECTIONS").unwrap_or(256),
            metrics_port: parsed(&lookup, "TRIPLOCK_METRICS_PORT"),
            tenant: TenantSettings {
                compact_threshold: parsed(&lookup, "TRIPLOCK_COMPACT_THRESHOLD")
                    .unwrap_or(DEFAULT_COMPACT_THRESHOLD),
                claim_ttl_ms: parsed(&lookup, "TRIPLOCK_CLAIM_TTL_MS")
                    .unwrap_or(DEFAULT_CLAIM_TTL_MS),
                redelivery_after_ms: parsed(&lookup, "TRIPLOCK_REDELIVERY_MS")
                    .unwrap_or(DEFAULT_REDELIVERY_AFTER_MS),
                retry: RetryPolicy::new(
                    parsed(&lookup, "TRIPLOCK_RETRY_ATTEMPTS").unwrap_or(DEFAULT_RETRY_ATTEMPTS),
                    parsed(&lookup, "TRIPLOCK_RETRY_BASE_MS").unwrap_or(DEFAULT_RETRY_BASE_MS),
                ),
            },
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = from_pairs(&[]);
        assert_eq!(config.addr(), "0.0.0.0:7433");
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.metrics_port, None);
        assert_eq!(config.tenant, TenantSettings::default());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = from_pairs(&[
            ("TRIPLOCK_PORT", "9000"),
            ("TRIPLOCK_METRICS_PORT", "9100"),
            ("TRIPLOCK_CLAIM_TTL_MS", "30000"),
            ("TRIPLOCK_RETRY_ATTEMPTS", "3"),
            ("TRIPLOCK_RETRY_BASE_MS", "10"),
        ]);
        assert_eq!(config.port, 9000);
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.tenant.claim_ttl_ms, 30_000);
        assert_eq!(config.tenant.retry, RetryPolicy::new(3, 10));
    }

    #[test]
    fn garbage_falls_back_to_default() {
        let config =
            from_pairs(&[("TRIPLOCK_PORT", "not-a-port"), ("TRIPLOCK_RETRY_ATTEMPTS", "-1")]);
        assert_eq!(config.port, 7433);
        assert_eq!(config.tenant.retry.max_attempts, DEFAULT_RETRY_ATTEMPTS);
    }
}
