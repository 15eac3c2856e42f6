use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::limits::{MAX_CAPACITY, MAX_TTL_SECONDS};
use crate::model::Ms;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Malformed { var: &'static str, value: String },
    #[error("{var} must be greater than zero")]
    Zero { var: &'static str },
    #[error("{var} must be at most {max}")]
    TooLarge { var: &'static str, max: u32 },
}

/// Admission parameters shared by every resource. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionConfig {
    pub enabled: bool,
    pub capacity: u32,
    pub ttl_seconds: u32,
    /// Never longer than `ttl_seconds`.
    pub heartbeat_seconds: u32,
}

impl AdmissionConfig {
    pub fn new(
        enabled: bool,
        capacity: u32,
        ttl_seconds: u32,
        heartbeat_seconds: u32,
    ) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::Zero {
                var: "SLOTGATE_CAPACITY",
            });
        }
        if capacity > MAX_CAPACITY {
            return Err(ConfigError::TooLarge {
                var: "SLOTGATE_CAPACITY",
                max: MAX_CAPACITY,
            });
        }
        if ttl_seconds == 0 {
            return Err(ConfigError::Zero {
                var: "SLOTGATE_TTL_SECONDS",
            });
        }
        if ttl_seconds > MAX_TTL_SECONDS {
            return Err(ConfigError::TooLarge {
                var: "SLOTGATE_TTL_SECONDS",
                max: MAX_TTL_SECONDS,
            });
        }
        if heartbeat_seconds == 0 {
            return Err(ConfigError::Zero {
                var: "SLOTGATE_HEARTBEAT_SECONDS",
            });
        }
        Ok(Self {
            enabled,
            capacity,
            ttl_seconds,
            heartbeat_seconds: heartbeat_seconds.min(ttl_seconds),
        })
    }

    pub fn ttl_ms(&self) -> Ms {
        Ms::from(self.ttl_seconds) * 1_000
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 50,
            ttl_seconds: 45,
            heartbeat_seconds: 15,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub bind: String,
    pub port: u16,
    pub cookie_secure: bool,
    pub rate_limit_max: u32,
    pub rate_limit_window: Duration,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub data_dir: PathBuf,
    pub tenant: String,
    pub compact_threshold: u64,
    pub reap_interval: Duration,
    /// When set, admission talks to a remote store server instead of a local engine.
    pub remote_url: Option<String>,
    /// When set, the local engine is also served over pgwire on this port.
    pub serve_port: Option<u16>,
    pub serve_bind: String,
    pub password: String,
    pub max_connections: usize,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub admission: AdmissionConfig,
    pub http: HttpSettings,
    pub store: StoreSettings,
    pub metrics_port: Option<u16>,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup. Unset and empty values take the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(lookup);

        let admission = AdmissionConfig::new(
            env.flag("SLOTGATE_ENABLED", true)?,
            env.parse("SLOTGATE_CAPACITY", 50)?,
            env.parse("SLOTGATE_TTL_SECONDS", 45)?,
            env.parse("SLOTGATE_HEARTBEAT_SECONDS", 15)?,
        )?;

        let rate_window: u64 = env.parse("SLOTGATE_RATE_LIMIT_WINDOW_SECONDS", 15)?;
        if rate_window == 0 {
            return Err(ConfigError::Zero {
                var: "SLOTGATE_RATE_LIMIT_WINDOW_SECONDS",
            });
        }
        let http = HttpSettings {
            bind: env.string("SLOTGATE_HTTP_BIND", "0.0.0.0"),
            port: env.parse("SLOTGATE_HTTP_PORT", 8080)?,
            cookie_secure: env.flag("SLOTGATE_COOKIE_SECURE", false)?,
            rate_limit_max: env.parse("SLOTGATE_RATE_LIMIT_MAX", 60)?,
            rate_limit_window: Duration::from_secs(rate_window),
        };

        let reap_seconds: u64 = env.parse("SLOTGATE_REAP_INTERVAL_SECONDS", 5)?;
        if reap_seconds == 0 {
            return Err(ConfigError::Zero {
                var: "SLOTGATE_REAP_INTERVAL_SECONDS",
            });
        }
        let store = StoreSettings {
            data_dir: PathBuf::from(env.string("SLOTGATE_DATA_DIR", "./data")),
            tenant: env.string("SLOTGATE_TENANT", "default"),
            compact_threshold: env.parse("SLOTGATE_COMPACT_THRESHOLD", 1000)?,
            reap_interval: Duration::from_secs(reap_seconds),
            remote_url: env.optional("SLOTGATE_STORE_URL"),
            serve_port: env.parse_optional("SLOTGATE_STORE_PORT")?,
            serve_bind: env.string("SLOTGATE_STORE_BIND", "0.0.0.0"),
            password: env.string("SLOTGATE_STORE_PASSWORD", "slotgate"),
            max_connections: env.parse("SLOTGATE_STORE_MAX_CONNECTIONS", 256)?,
            tls_cert: env.optional("SLOTGATE_TLS_CERT"),
            tls_key: env.optional("SLOTGATE_TLS_KEY"),
        };

        Ok(Self {
            admission,
            http,
            store,
            metrics_port: env.parse_optional("SLOTGATE_METRICS_PORT")?,
        })
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn optional(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, var: &str, default: &str) -> String {
        self.optional(var).unwrap_or_else(|| default.to_string())
    }

    fn parse_optional<T: FromStr>(&self, var: &'static str) -> Result<Option<T>, ConfigError> {
        self.optional(var)
            .map(|value| {
                value
                    .parse()
                    .map_err(|_| ConfigError::Malformed { var, value })
            })
            .transpose()
    }

    fn parse<T: FromStr>(&self, var: &'static str, default: T) -> Result<T, ConfigError> {
        Ok(self.parse_optional(var)?.unwrap_or(default))
    }

    fn flag(&self, var: &'static str, default: bool) -> Result<bool, ConfigError> {
        let Some(value) = self.optional(var) else {
            return Ok(default);
        };
        match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Malformed { var, value }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let s = settings(&[]).unwrap();
        assert_eq!(s.admission, AdmissionConfig::default());
        assert_eq!(s.http.port, 8080);
        assert_eq!(s.http.rate_limit_max, 60);
        assert_eq!(s.http.rate_limit_window, Duration::from_secs(15));
        assert!(!s.http.cookie_secure);
        assert_eq!(s.store.tenant, "default");
        assert_eq!(s.store.password, "slotgate");
        assert_eq!(s.store.remote_url, None);
        assert_eq!(s.store.serve_port, None);
        assert_eq!(s.metrics_port, None);
    }

    #[test]
    fn values_are_read() {
        let s = settings(&[
            ("SLOTGATE_ENABLED", "off"),
            ("SLOTGATE_CAPACITY", "1"),
            ("SLOTGATE_TTL_SECONDS", "3"),
            ("SLOTGATE_HEARTBEAT_SECONDS", "2"),
            ("SLOTGATE_STORE_URL", "postgres://slotgate:pw@store:5433/lobby"),
            ("SLOTGATE_STORE_PORT", "5433"),
            ("SLOTGATE_COOKIE_SECURE", "true"),
        ])
        .unwrap();
        assert!(!s.admission.enabled);
        assert_eq!(s.admission.capacity, 1);
        assert_eq!(s.admission.ttl_ms(), 3_000);
        assert_eq!(s.admission.heartbeat_seconds, 2);
        assert_eq!(
            s.store.remote_url.as_deref(),
            Some("postgres://slotgate:pw@store:5433/lobby")
        );
        assert_eq!(s.store.serve_port, Some(5433));
        assert!(s.http.cookie_secure);
    }

    #[test]
    fn heartbeat_is_clamped_to_ttl() {
        let cfg = AdmissionConfig::new(true, 5, 10, 30).unwrap();
        assert_eq!(cfg.heartbeat_seconds, 10);
    }

    #[test]
    fn zero_values_are_rejected() {
        assert_eq!(
            settings(&[("SLOTGATE_CAPACITY", "0")]).err(),
            Some(ConfigError::Zero {
                var: "SLOTGATE_CAPACITY"
            })
        );
        assert!(settings(&[("SLOTGATE_TTL_SECONDS", "0")]).is_err());
        assert!(settings(&[("SLOTGATE_HEARTBEAT_SECONDS", "0")]).is_err());
        assert!(settings(&[("SLOTGATE_RATE_LIMIT_WINDOW_SECONDS", "0")]).is_err());
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert_eq!(
            settings(&[("SLOTGATE_CAPACITY", "fifty")]).err(),
            Some(ConfigError::Malformed {
                var: "SLOTGATE_CAPACITY",
                value: "fifty".into()
            })
        );
        assert!(settings(&[("SLOTGATE_ENABLED", "maybe")]).is_err());
        assert!(settings(&[("SLOTGATE_HTTP_PORT", "70000")]).is_err());
        assert!(settings(&[("SLOTGATE_TTL_SECONDS", "-5")]).is_err());
    }

    #[test]
    fn oversized_capacity_is_rejected() {
        let too_many = (MAX_CAPACITY + 1).to_string();
        assert!(matches!(
            settings(&[("SLOTGATE_CAPACITY", too_many.as_str())]),
            Err(ConfigError::TooLarge { .. })
        ));
    }
}
