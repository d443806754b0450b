//! Controller settings, with `REKON_*` environment overrides.

use std::str::FromStr;
use std::time::Duration;

use rekon_core::ObjectKey;
use rekon_kubehub::InformerConfig;
use rekon_queue::{controller_rate_limiter, MaxOf};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Queue name used in logs and metric labels.
    pub name: String,
    pub workers: usize,
    /// Full re-delivery interval for cached objects. New objects get their
    /// first sync from it, so it is never zero when read from the environment.
    pub resync: Duration,
    /// Wait between a deletion notification and its first sync.
    pub grace_period: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub bucket_qps: f64,
    pub bucket_burst: u32,
    pub cache_sync_timeout: Duration,
    /// Abort `run` instead of continuing when the initial cache sync fails.
    pub strict_cache_sync: bool,
    pub sync_timeout: Duration,
    pub watch_backoff_max: Duration,
    /// Top-level fields holding desired state; changes elsewhere don't trigger a sync.
    pub spec_fields: Vec<String>,
    pub finalizer: Option<String>,
    /// Record `status.observedGeneration` after a successful sync.
    pub observed_generation: bool,
    pub label_selector: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: "rekon-controller".to_string(),
            workers: 2,
            resync: Duration::from_secs(300),
            grace_period: Duration::from_secs(5),
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
            bucket_qps: 10.0,
            bucket_burst: 100,
            cache_sync_timeout: Duration::from_secs(60),
            strict_cache_sync: false,
            sync_timeout: Duration::from_secs(30),
            watch_backoff_max: Duration::from_secs(30),
            spec_fields: vec!["spec".to_string()],
            finalizer: None,
            observed_generation: false,
            label_selector: None,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|s| matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

impl ControllerConfig {
    /// Defaults overridden by any `REKON_*` variables that are set and parse.
    pub fn from_env() -> Self {
        let mut c = Self::default();
        if let Some(v) = env_parse::<usize>("REKON_WORKERS").filter(|v| *v > 0) { c.workers = v; }
        if let Some(v) = env_secs("REKON_RESYNC_SECS").filter(|v| !v.is_zero()) { c.resync = v; }
        if let Some(v) = env_secs("REKON_GRACE_SECS") { c.grace_period = v; }
        if let Some(v) = env_parse::<u64>("REKON_BACKOFF_BASE_MS").filter(|v| *v > 0) { c.backoff_base = Duration::from_millis(v); }
        if let Some(v) = env_secs("REKON_BACKOFF_MAX_SECS").filter(|v| !v.is_zero()) { c.backoff_max = v; }
        if let Some(v) = env_secs("REKON_CACHE_SYNC_TIMEOUT_SECS") { c.cache_sync_timeout = v; }
        if let Some(v) = env_flag("REKON_STRICT_CACHE_SYNC") { c.strict_cache_sync = v; }
        if let Some(v) = env_secs("REKON_SYNC_TIMEOUT_SECS").filter(|v| !v.is_zero()) { c.sync_timeout = v; }
        if let Some(v) = env_secs("REKON_WATCH_BACKOFF_MAX_SECS").filter(|v| !v.is_zero()) { c.watch_backoff_max = v; }
        if let Ok(v) = std::env::var("REKON_FINALIZER") {
            if !v.trim().is_empty() { c.finalizer = Some(v.trim().to_string()); }
        }
        if let Some(v) = env_flag("REKON_OBSERVED_GENERATION") { c.observed_generation = v; }
        c
    }

    pub fn rate_limiter(&self) -> MaxOf<ObjectKey> {
        controller_rate_limiter(self.backoff_base, self.backoff_max, self.bucket_qps, self.bucket_burst)
    }

    pub fn informer_config(&self) -> InformerConfig {
        InformerConfig { watch_backoff_max: self.watch_backoff_max, label_selector: self.label_selector.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_controller_conventions() {
        let c = ControllerConfig::default();
        assert_eq!(c.grace_period, Duration::from_secs(5));
        assert_eq!(c.backoff_base, Duration::from_millis(5));
        assert_eq!(c.backoff_max, Duration::from_secs(1000));
        assert_eq!(c.spec_fields, vec!["spec"]);
        assert!(!c.strict_cache_sync);
    }

    // Single test touching the environment to avoid races between tests.
    #[test]
    fn env_overrides_apply_and_bad_values_are_ignored() {
        std::env::set_var("REKON_WORKERS", "7");
        std::env::set_var("REKON_GRACE_SECS", "12");
        std::env::set_var("REKON_BACKOFF_BASE_MS", "not-a-number");
        std::env::set_var("REKON_STRICT_CACHE_SYNC", "true");
        std::env::set_var("REKON_FINALIZER", " rekon.io/cleanup ");
        std::env::set_var("REKON_RESYNC_SECS", "0");
        let c = ControllerConfig::from_env();
        for k in ["REKON_WORKERS", "REKON_GRACE_SECS", "REKON_BACKOFF_BASE_MS", "REKON_STRICT_CACHE_SYNC", "REKON_FINALIZER", "REKON_RESYNC_SECS"] {
            std::env::remove_var(k);
        }
        assert_eq!(c.workers, 7);
        assert_eq!(c.grace_period, Duration::from_secs(12));
        assert_eq!(c.backoff_base, Duration::from_millis(5));
        assert!(c.strict_cache_sync);
        assert_eq!(c.finalizer.as_deref(), Some("rekon.io/cleanup"));
        assert_eq!(c.resync, Duration::from_secs(300), "zero resync would strand new objects");
    }
}
