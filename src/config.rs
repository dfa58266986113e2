use std::time::Duration;

use tracing::warn;

use crate::limits::*;
use crate::model::{Ms, SessionType};

const MINUTE_MS: Ms = 60_000;

/// Default duration and price of one session type. Owned by the session
/// configuration, read by the slot generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub duration_ms: Ms,
    pub price_cents: i64,
}

/// Per-engine behavior knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Rolling generation window length, starting today.
    pub horizon_days: u32,
    pub default_hold_ttl_ms: Ms,
    pub max_hold_ttl_ms: Ms,
    /// Past slots are kept this long before the reaper purges them.
    pub slot_retention_ms: Ms,
    pub personal: SessionSettings,
    pub webinar: SessionSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            horizon_days: 30,
            default_hold_ttl_ms: 10 * MINUTE_MS,
            max_hold_ttl_ms: MAX_HOLD_TTL_MS,
            slot_retention_ms: 7 * 24 * 60 * MINUTE_MS,
            personal: SessionSettings {
                duration_ms: 60 * MINUTE_MS,
                price_cents: 0,
            },
            webinar: SessionSettings {
                duration_ms: 90 * MINUTE_MS,
                price_cents: 0,
            },
        }
    }
}

impl EngineSettings {
    pub fn session(&self, session_type: SessionType) -> &SessionSettings {
        match session_type {
            SessionType::Personal => &self.personal,
            SessionType::Webinar => &self.webinar,
        }
    }
}

/// Server configuration, read from `SLOTKEEPER_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: String,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub reaper_interval: Duration,
    pub generation_interval: Duration,
    pub engine: EngineSettings,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("both SLOTKEEPER_TLS_CERT and SLOTKEEPER_TLS_KEY must be set, or neither")]
    PartialTls,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys take defaults, unparsable ones
    /// take defaults with a warning.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = EngineSettings::default();
        let tls_cert = lookup("SLOTKEEPER_TLS_CERT");
        let tls_key = lookup("SLOTKEEPER_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::PartialTls);
        }

        let personal_minutes: Ms = parsed(&lookup, "SLOTKEEPER_PERSONAL_DURATION_MIN", 60);
        let webinar_minutes: Ms = parsed(&lookup, "SLOTKEEPER_WEBINAR_DURATION_MIN", 90);

        let max_hold_ttl_ms =
            scaled(&lookup, "SLOTKEEPER_MAX_HOLD_TTL_SECS", 3600, 1000).min(MAX_HOLD_TTL_MS);
        let mut default_hold_ttl_ms = scaled(&lookup, "SLOTKEEPER_HOLD_TTL_SECS", 600, 1000);
        if default_hold_ttl_ms > max_hold_ttl_ms {
            warn!("hold TTL {default_hold_ttl_ms}ms exceeds the maximum, using {max_hold_ttl_ms}ms");
            default_hold_ttl_ms = max_hold_ttl_ms;
        }

        let engine = EngineSettings {
            horizon_days: parsed(&lookup, "SLOTKEEPER_HORIZON_DAYS", defaults.horizon_days)
                .clamp(1, MAX_HORIZON_DAYS),
            default_hold_ttl_ms,
            max_hold_ttl_ms,
            slot_retention_ms: scaled(&lookup, "SLOTKEEPER_SLOT_RETENTION_HOURS", 168, 60 * MINUTE_MS),
            personal: SessionSettings {
                duration_ms: session_minutes(personal_minutes, 60) * MINUTE_MS,
                price_cents: parsed(&lookup, "SLOTKEEPER_PERSONAL_PRICE_CENTS", 0),
            },
            webinar: SessionSettings {
                duration_ms: session_minutes(webinar_minutes, 90) * MINUTE_MS,
                price_cents: parsed(&lookup, "SLOTKEEPER_WEBINAR_PRICE_CENTS", 0),
            },
        };

        Ok(Self {
            bind: lookup("SLOTKEEPER_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&lookup, "SLOTKEEPER_PORT", 5433),
            data_dir: lookup("SLOTKEEPER_DATA_DIR").unwrap_or_else(|| "./data".into()),
            password: lookup("SLOTKEEPER_PASSWORD").unwrap_or_else(|| "slotkeeper".into()),
            max_connections: parsed(&lookup, "SLOTKEEPER_MAX_CONNECTIONS", 256),
            compact_threshold: parsed(&lookup, "SLOTKEEPER_COMPACT_THRESHOLD", 1000),
            metrics_port: lookup("SLOTKEEPER_METRICS_PORT").and_then(|s| s.parse().ok()),
            tls_cert,
            tls_key,
            reaper_interval: Duration::from_secs(parsed(&lookup, "SLOTKEEPER_REAPER_INTERVAL_SECS", 5)),
            generation_interval: Duration::from_secs(parsed(
                &lookup,
                "SLOTKEEPER_GENERATION_INTERVAL_SECS",
                3600,
            )),
            engine,
        })
    }
}

fn parsed<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy + std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("ignoring invalid {key}={raw:?}, using {default}");
            default
        }),
    }
}

/// A positive count of `unit`s, in ms. Saturates instead of overflowing.
fn scaled<F>(lookup: &F, key: &str, default: Ms, unit: Ms) -> Ms
where
    F: Fn(&str) -> Option<String>,
{
    let value: Ms = parsed(lookup, key, default);
    if value <= 0 {
        warn!("{key} must be positive, using {default}");
        return default * unit;
    }
    value.saturating_mul(unit)
}

fn session_minutes(minutes: Ms, default: Ms) -> Ms {
    if minutes <= 0 || minutes.saturating_mul(MINUTE_MS) > MAX_SESSION_DURATION_MS {
        warn!("session duration {minutes}m out of range, using {default}m");
        return default;
    }
    minutes
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = config_from(&[]).unwrap();
        assert_eq!(cfg.port, 5433);
        assert_eq!(cfg.bind, "0.0.0.0");
        assert_eq!(cfg.engine, EngineSettings::default());
        assert_eq!(cfg.engine.personal.duration_ms, 3_600_000);
        assert_eq!(cfg.metrics_port, None);
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = config_from(&[
            ("SLOTKEEPER_PORT", "6000"),
            ("SLOTKEEPER_HORIZON_DAYS", "14"),
            ("SLOTKEEPER_PERSONAL_DURATION_MIN", "45"),
            ("SLOTKEEPER_WEBINAR_PRICE_CENTS", "2500"),
            ("SLOTKEEPER_HOLD_TTL_SECS", "120"),
        ])
        .unwrap();
        assert_eq!(cfg.port, 6000);
        assert_eq!(cfg.engine.horizon_days, 14);
        assert_eq!(cfg.engine.personal.duration_ms, 45 * 60_000);
        assert_eq!(cfg.engine.webinar.price_cents, 2500);
        assert_eq!(cfg.engine.default_hold_ttl_ms, 120_000);
    }

    #[test]
    fn invalid_values_fall_back() {
        let cfg = config_from(&[
            ("SLOTKEEPER_PORT", "not-a-port"),
            ("SLOTKEEPER_WEBINAR_DURATION_MIN", "0"),
            ("SLOTKEEPER_HORIZON_DAYS", "9999"),
        ])
        .unwrap();
        assert_eq!(cfg.port, 5433);
        assert_eq!(cfg.engine.webinar.duration_ms, 90 * 60_000);
        assert_eq!(cfg.engine.horizon_days, MAX_HORIZON_DAYS);
    }

    #[test]
    fn hold_ttl_is_clamped_to_the_maximum() {
        let cfg = config_from(&[("SLOTKEEPER_HOLD_TTL_SECS", "7200")]).unwrap();
        assert_eq!(cfg.engine.max_hold_ttl_ms, 3_600_000);
        assert_eq!(cfg.engine.default_hold_ttl_ms, cfg.engine.max_hold_ttl_ms);

        let cfg = config_from(&[
            ("SLOTKEEPER_MAX_HOLD_TTL_SECS", "300"),
            ("SLOTKEEPER_HOLD_TTL_SECS", "600"),
        ])
        .unwrap();
        assert_eq!(cfg.engine.default_hold_ttl_ms, 300_000);
    }

    #[test]
    fn huge_values_saturate() {
        let huge = i64::MAX.to_string();
        let cfg = config_from(&[
            ("SLOTKEEPER_HOLD_TTL_SECS", huge.as_str()),
            ("SLOTKEEPER_MAX_HOLD_TTL_SECS", huge.as_str()),
            ("SLOTKEEPER_SLOT_RETENTION_HOURS", huge.as_str()),
            ("SLOTKEEPER_PERSONAL_DURATION_MIN", huge.as_str()),
        ])
        .unwrap();
        assert_eq!(cfg.engine.max_hold_ttl_ms, MAX_HOLD_TTL_MS);
        assert_eq!(cfg.engine.default_hold_ttl_ms, MAX_HOLD_TTL_MS);
        assert_eq!(cfg.engine.slot_retention_ms, Ms::MAX);
        assert_eq!(cfg.engine.personal.duration_ms, 60 * 60_000);

        let cfg = config_from(&[("SLOTKEEPER_HOLD_TTL_SECS", "-5")]).unwrap();
        assert_eq!(cfg.engine.default_hold_ttl_ms, 600_000);
    }

    #[test]
    fn half_configured_tls_is_rejected() {
        let result = config_from(&[("SLOTKEEPER_TLS_CERT", "/tmp/cert.pem")]);
        assert!(matches!(result, Err(ConfigError::PartialTls)));
    }
}
