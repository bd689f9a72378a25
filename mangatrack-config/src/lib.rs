//! Environment-driven configuration with strict fail-fast validation.
//!
//! Required variables are `DATABASE_URL`, `REDIS_URL`, and `CANONICAL_URL`;
//! everything else is optional with sensible defaults. A missing or
//! malformed required variable aborts startup with a precise message
//! instead of failing later inside a worker.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),

    #[error("environment variable {name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

/// Fully validated runtime settings.
#[derive(Clone, Debug)]
pub struct Settings {
    pub database_url: String,
    pub redis_url: String,
    /// Public canonical site URL; CSRF and redirect guards key off its host.
    pub canonical_url: Url,
    pub environment: Environment,
    pub bind_addr: SocketAddr,
    /// Extra origins allowed by the CSRF check.
    pub csrf_allowed_origins: Vec<String>,
    /// Extra hosts the open-redirect guard accepts.
    pub redirect_allowed_hosts: Vec<String>,
    /// Feature flag blob, opaque to this crate.
    pub feature_flags: Value,
    /// Shared secret guarding internal observability endpoints.
    pub internal_api_secret: Option<String>,
    /// Sync worker parallelism.
    pub sync_workers: usize,
    /// Periodic sweep interval.
    pub sweep_interval: Duration,
}

impl Settings {
    /// Load from the process environment, reading `.env` first when
    /// present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_lookup(&vars)
    }

    /// Load from an explicit map; the testable seam under `from_env`.
    pub fn from_lookup(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let database_url = require(vars, "DATABASE_URL")?;
        let redis_url = require(vars, "REDIS_URL")?;

        let canonical_raw = require(vars, "CANONICAL_URL")?;
        let canonical_url = Url::parse(&canonical_raw).map_err(|e| ConfigError::Invalid {
            name: "CANONICAL_URL",
            reason: e.to_string(),
        })?;
        if canonical_url.host_str().is_none() {
            return Err(ConfigError::Invalid {
                name: "CANONICAL_URL",
                reason: "url has no host".to_string(),
            });
        }

        let environment = match vars.get("ENVIRONMENT").map(String::as_str) {
            None | Some("production") => Environment::Production,
            Some("development") | Some("dev") => Environment::Development,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "ENVIRONMENT",
                    reason: format!("unknown environment: {other}"),
                });
            }
        };

        let bind_addr = match vars.get("BIND_ADDR") {
            Some(raw) => raw.parse().map_err(|e| ConfigError::Invalid {
                name: "BIND_ADDR",
                reason: format!("{e}"),
            })?,
            None => SocketAddr::from(([0, 0, 0, 0], 8080)),
        };

        let feature_flags = match vars.get("FEATURE_FLAGS") {
            Some(raw) => {
                let parsed: Value =
                    serde_json::from_str(raw).map_err(|e| ConfigError::Invalid {
                        name: "FEATURE_FLAGS",
                        reason: e.to_string(),
                    })?;
                if !parsed.is_object() {
                    return Err(ConfigError::Invalid {
                        name: "FEATURE_FLAGS",
                        reason: "expected a JSON object".to_string(),
                    });
                }
                parsed
            }
            None => Value::Object(Default::default()),
        };

        let sync_workers = match vars.get("SYNC_WORKERS") {
            Some(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|count| *count > 0)
                .ok_or_else(|| ConfigError::Invalid {
                    name: "SYNC_WORKERS",
                    reason: format!("expected a positive integer, got {raw}"),
                })?,
            None => 4,
        };

        let sweep_interval = match vars.get("SWEEP_INTERVAL") {
            Some(raw) => humantime::parse_duration(raw).map_err(|e| ConfigError::Invalid {
                name: "SWEEP_INTERVAL",
                reason: e.to_string(),
            })?,
            None => Duration::from_secs(60),
        };

        Ok(Self {
            database_url,
            redis_url,
            canonical_url,
            environment,
            bind_addr,
            csrf_allowed_origins: comma_list(vars.get("CSRF_ALLOWED_ORIGINS")),
            redirect_allowed_hosts: comma_list(vars.get("REDIRECT_ALLOWED_HOSTS")),
            feature_flags,
            internal_api_secret: vars
                .get("INTERNAL_API_SECRET")
                .filter(|secret| !secret.is_empty())
                .cloned(),
            sync_workers,
            sweep_interval,
        })
    }

    pub fn feature_enabled(&self, name: &str) -> bool {
        self.feature_flags
            .get(name)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

fn require(vars: &HashMap<String, String>, name: &'static str) -> Result<String, ConfigError> {
    vars.get(name)
        .filter(|value| !value.trim().is_empty())
        .cloned()
        .ok_or(ConfigError::Missing(name))
}

fn comma_list(raw: Option<&String>) -> Vec<String> {
    raw.map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::to_owned)
            .collect()
    })
    .unwrap_or_default()
}
