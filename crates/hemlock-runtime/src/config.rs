//! Runtime configuration
//!
//! Defaults are compiled in; `HEMLOCK_*` environment variables override
//! them at startup.

use serde::{Deserialize, Serialize};

/// Call depth at which a thread reports StackOverflow.
pub const DEFAULT_STACK_LIMIT: u32 = 10_000;

pub const MIN_WORKERS: usize = 2;
pub const MAX_WORKERS: usize = 256;

/// Worker count used when the hardware parallelism cannot be queried.
const FALLBACK_WORKERS: usize = 4;

const DEFAULT_LOG_FILTER: &str = "warn";
const DEFAULT_CHANNEL_POLL_MS: u64 = 1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Pool size. `None` picks one worker per hardware thread.
    pub workers: Option<usize>,
    pub stack_limit: u32,
    /// Polling interval of `select` over several channels.
    pub channel_poll_interval_ms: u64,
    /// `tracing-subscriber` env-filter directive.
    pub log_filter: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: None,
            stack_limit: DEFAULT_STACK_LIMIT,
            channel_poll_interval_ms: DEFAULT_CHANNEL_POLL_MS,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `HEMLOCK_WORKERS`, `HEMLOCK_STACK_LIMIT` and
    /// `HEMLOCK_LOG`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(raw) = lookup("HEMLOCK_WORKERS") {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.workers = Some(n),
                _ => tracing::warn!(value = %raw, "ignoring malformed HEMLOCK_WORKERS"),
            }
        }
        if let Some(raw) = lookup("HEMLOCK_STACK_LIMIT") {
            match raw.trim().parse::<u32>() {
                Ok(n) if n > 0 => config.stack_limit = n,
                _ => tracing::warn!(value = %raw, "ignoring malformed HEMLOCK_STACK_LIMIT"),
            }
        }
        if let Some(filter) = lookup("HEMLOCK_LOG") {
            config.log_filter = filter;
        }
        config
    }

    /// Worker count after auto-detection and clamping to
    /// [`MIN_WORKERS`, `MAX_WORKERS`].
    pub fn resolved_workers(&self) -> usize {
        let n = self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(FALLBACK_WORKERS)
        });
        n.clamp(MIN_WORKERS, MAX_WORKERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_env_overrides() {
        let config = RuntimeConfig::from_lookup(lookup_from(&[
            ("HEMLOCK_WORKERS", "3"),
            ("HEMLOCK_STACK_LIMIT", "500"),
            ("HEMLOCK_LOG", "hemlock_runtime=debug"),
        ]));
        assert_eq!(config.workers, Some(3));
        assert_eq!(config.stack_limit, 500);
        assert_eq!(config.log_filter, "hemlock_runtime=debug");
        assert_eq!(config.resolved_workers(), 3);
    }

    #[test]
    fn test_malformed_values_ignored() {
        let config = RuntimeConfig::from_lookup(lookup_from(&[
            ("HEMLOCK_WORKERS", "many"),
            ("HEMLOCK_STACK_LIMIT", "0"),
        ]));
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn test_worker_clamp() {
        let one = RuntimeConfig {
            workers: Some(1),
            ..RuntimeConfig::default()
        };
        assert_eq!(one.resolved_workers(), MIN_WORKERS);
        let huge = RuntimeConfig {
            workers: Some(10_000),
            ..RuntimeConfig::default()
        };
        assert_eq!(huge.resolved_workers(), MAX_WORKERS);
        let auto = RuntimeConfig::default().resolved_workers();
        assert!((MIN_WORKERS..=MAX_WORKERS).contains(&auto));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: RuntimeConfig = serde_json::from_str(r#"{"stack_limit": 64}"#).unwrap();
        assert_eq!(config.stack_limit, 64);
        assert_eq!(config.log_filter, "warn");
        assert_eq!(config.workers, None);
    }
}
