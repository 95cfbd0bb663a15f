//! Process configuration, read from environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::worker::RetryPolicy;

pub const DEFAULT_JWT_SECRET: &str = "change-me";
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Answer the user's questions clearly and concisely.";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionSettings {
    pub base_url: String,
    /// When unset, the deterministic echo service is used.
    pub api_key: Option<String>,
    pub model: String,
    pub system_prompt: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub bind_addr: SocketAddr,
    pub jwt_secret: String,
    pub use_persistent_stores: bool,
    pub database_url: String,
    pub redis_url: String,
    pub task_stream: String,
    pub task_group: String,
    pub worker_concurrency: usize,
    pub retry: RetryPolicy,
    pub soft_time_limit: Duration,
    pub heartbeat_interval: Duration,
    pub orphan_grace: Duration,
    pub completion: CompletionSettings,
    pub embedded_workers: bool,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build settings from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let jwt_secret = get("JWT_SECRET").unwrap_or_else(|| {
            warn!("JWT_SECRET not set; using an insecure default secret (dev only)");
            DEFAULT_JWT_SECRET.to_string()
        });

        let retry = RetryPolicy::exponential(
            parse(&get, "TASK_MAX_ATTEMPTS", 3u32)?.max(1),
            Duration::from_millis(parse(&get, "TASK_BACKOFF_BASE_MS", 1_000u64)?),
            Duration::from_millis(parse(&get, "TASK_BACKOFF_MAX_MS", 600_000u64)?),
        );

        Ok(Self {
            bind_addr: parse(&get, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8000)))?,
            jwt_secret,
            use_persistent_stores: parse_bool(&get, "USE_PERSISTENT_STORES", false)?,
            database_url: get("DATABASE_URL").unwrap_or_else(|| "postgres://localhost/parley".to_string()),
            redis_url: get("REDIS_URL").unwrap_or_else(|| "redis://localhost:6379".to_string()),
            task_stream: get("TASK_STREAM").unwrap_or_else(|| "parley:tasks".to_string()),
            task_group: get("TASK_GROUP").unwrap_or_else(|| parley_tasks::PROCESS_SESSION_TASK.to_string()),
            worker_concurrency: parse(&get, "WORKER_CONCURRENCY", 4usize)?.max(1),
            retry,
            soft_time_limit: parse_nonzero_secs(&get, "TASK_SOFT_TIME_LIMIT_SECS", 1_800)?,
            heartbeat_interval: parse_nonzero_secs(&get, "BROKER_HEARTBEAT_SECS", 30)?,
            orphan_grace: Duration::from_secs(parse(&get, "ORPHAN_GRACE_SECS", 300u64)?),
            completion: CompletionSettings {
                base_url: get("COMPLETION_BASE_URL")
                    .unwrap_or_else(|| "https://api.groq.com/openai/v1".to_string()),
                api_key: get("COMPLETION_API_KEY"),
                model: get("COMPLETION_MODEL").unwrap_or_else(|| "llama3-8b-8192".to_string()),
                system_prompt: get("COMPLETION_SYSTEM_PROMPT").unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            },
            embedded_workers: parse_bool(&get, "EMBEDDED_WORKERS", true)?,
        })
    }

    /// A delivery whose lease is not renewed for two heartbeats is redelivered.
    pub fn visibility_timeout(&self) -> Duration {
        self.heartbeat_interval * 2
    }
}

fn parse<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

/// A whole number of seconds; zero is rejected.
fn parse_nonzero_secs<G>(get: &G, var: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match parse(get, var, default)? {
        0 => Err(ConfigError::Invalid {
            var,
            value: "0".to_string(),
            reason: "must be greater than zero".to_string(),
        }),
        secs => Ok(Duration::from_secs(secs)),
    }
}

fn parse_bool<G>(get: &G, var: &'static str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                var,
                value: raw,
                reason: "expected a boolean".to_string(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Settings::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn defaults_match_documented_values() {
        let s = settings(&[]).unwrap();
        assert_eq!(s.bind_addr, "0.0.0.0:8000".parse().unwrap());
        assert!(!s.use_persistent_stores);
        assert_eq!(s.task_group, "ai.process_session");
        assert_eq!(s.retry.max_attempts, 3);
        assert_eq!(s.retry.base_delay, Duration::from_secs(1));
        assert_eq!(s.soft_time_limit, Duration::from_secs(1800));
        assert_eq!(s.visibility_timeout(), Duration::from_secs(60));
        assert!(s.completion.api_key.is_none());
        assert!(s.embedded_workers);
    }

    #[test]
    fn overrides_are_applied() {
        let s = settings(&[
            ("USE_PERSISTENT_STORES", "true"),
            ("WORKER_CONCURRENCY", "8"),
            ("TASK_MAX_ATTEMPTS", "5"),
            ("COMPLETION_API_KEY", "gsk_test"),
            ("EMBEDDED_WORKERS", "off"),
        ])
        .unwrap();
        assert!(s.use_persistent_stores);
        assert_eq!(s.worker_concurrency, 8);
        assert_eq!(s.retry.max_attempts, 5);
        assert_eq!(s.completion.api_key.as_deref(), Some("gsk_test"));
        assert!(!s.embedded_workers);
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let err = settings(&[("WORKER_CONCURRENCY", "many")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "WORKER_CONCURRENCY", .. }));

        assert!(settings(&[("USE_PERSISTENT_STORES", "maybe")]).is_err());
    }

    #[test]
    fn zero_time_limits_are_rejected() {
        let err = settings(&[("TASK_SOFT_TIME_LIMIT_SECS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "TASK_SOFT_TIME_LIMIT_SECS", .. }));

        let err = settings(&[("BROKER_HEARTBEAT_SECS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "BROKER_HEARTBEAT_SECS", .. }));

        let s = settings(&[("TASK_SOFT_TIME_LIMIT_SECS", "1")]).unwrap();
        assert_eq!(s.soft_time_limit, Duration::from_secs(1));
    }
}
