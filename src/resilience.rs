// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience utilities: retry with exponential backoff.
//!
//! Every fallible I/O call in the engine (scan query, fan-out query,
//! projection query, index check/create, bulk write) is wrapped individually
//! in [`retry()`], so a failure in one call never re-runs siblings that
//! already completed.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> search_sync_engine::Result<()> {
//! use search_sync_engine::resilience::{retry, RetryConfig};
//!
//! let config = RetryConfig::default();
//! let rows = retry("scan_changes", &config, || async {
//!     // pool.fetch_all(...).await.map_err(...)
//!     Ok::<_, search_sync_engine::SyncError>(vec![1, 2, 3])
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, SyncError};
use crate::metrics;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts (first call included).
    /// Set to `usize::MAX` for infinite retries (daemon mode).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Base delay; the first retry waits `initial_delay * backoff_factor`.
    #[serde(default = "default_initial_delay", with = "humantime_serde_compat")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    #[serde(default = "default_max_delay", with = "humantime_serde_compat")]
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_max_attempts() -> usize {
    usize::MAX
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for RetryConfig {
    /// Infinite retry: 0.1s base, factor 2, 10s ceiling.
    fn default() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Bounded retry for the initial source connection.
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        1s
    /// 2        2s
    /// 3        4s
    /// 4        8s
    /// 5-9      10s (capped)
    /// ```
    ///
    /// Exhausting these attempts is a fatal startup failure.
    pub fn startup() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_factor: 2.0,
        }
    }

    /// Delay before retry number `attempt`: `min(initial * factor^attempt, max)`.
    ///
    /// `factor^0 == 1`, so attempt 0 yields exactly `initial_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.min(i32::MAX as usize) as i32;
        let delay_secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);

        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs.max(0.0))
    }

    /// Reject policies that cannot back off sensibly.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(SyncError::Config("retry.max_attempts must be > 0".into()));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(SyncError::Config(format!(
                "retry.backoff_factor must be a finite number >= 1.0, got {}",
                self.backoff_factor
            )));
        }
        if self.initial_delay > self.max_delay {
            return Err(SyncError::Config(
                "retry.initial_delay must not exceed retry.max_delay".into(),
            ));
        }
        Ok(())
    }
}

/// Run `f` until it succeeds, a non-retryable error occurs, or attempts run out.
///
/// Each failure is logged with the operation name; the sleep before retry `n`
/// (1-indexed) is [`RetryConfig::delay_for_attempt(n)`](RetryConfig::delay_for_attempt).
pub async fn retry<F, Fut, T>(operation: &str, config: &RetryConfig, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: usize = 0;

    loop {
        debug!(operation, attempt, "Executing");
        match f().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation, attempts = attempt + 1, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_retryable() => {
                warn!(operation, error = %e, "Non-retryable error");
                return Err(e);
            }
            Err(e) => {
                attempt += 1;
                if attempt >= config.max_attempts {
                    warn!(operation, attempts = attempt, error = %e, "Retries exhausted");
                    return Err(e);
                }

                let delay = config.delay_for_attempt(attempt);
                warn!(
                    operation,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, backing off"
                );
                metrics::record_retry(operation);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Durations in config files are humantime strings ("100ms", "10s").
mod humantime_serde_compat {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn daemon_config() -> RetryConfig {
        RetryConfig {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
        }
    }

    #[test]
    fn test_default_config() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, usize::MAX);
        assert_eq!(config.initial_delay, Duration::from_millis(100));
        assert_eq!(config.max_delay, Duration::from_secs(10));
    }

    #[test]
    fn test_startup_config_is_bounded() {
        let config = RetryConfig::startup();
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
    }

    #[test]
    fn test_negative_factor_never_panics() {
        let config = RetryConfig {
            backoff_factor: -2.0,
            ..daemon_config()
        };
        assert_eq!(config.delay_for_attempt(1), Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_nan_factor_falls_back_to_ceiling() {
        let config = RetryConfig {
            backoff_factor: f64::NAN,
            ..daemon_config()
        };
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(10));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let config = RetryConfig {
            max_attempts: 0,
            ..daemon_config()
        };
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_shrinking_factor() {
        let config = RetryConfig {
            backoff_factor: 0.5,
            ..daemon_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_initial_above_ceiling() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(30),
            ..daemon_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_presets_are_valid() {
        RetryConfig::default().validate().unwrap();
        RetryConfig::startup().validate().unwrap();
        RetryConfig::testing().validate().unwrap();
    }

    #[test]
    fn test_attempt_zero_is_base_interval() {
        assert_eq!(daemon_config().delay_for_attempt(0), Duration::from_millis(100));
    }

    #[test]
    fn test_delay_for_attempt() {
        let config = daemon_config();
        let close = |d: Duration, ms: u64| (d.as_secs_f64() - ms as f64 / 1000.0).abs() < 1e-9;

        assert!(close(config.delay_for_attempt(1), 200));
        assert!(close(config.delay_for_attempt(2), 400));
        assert!(close(config.delay_for_attempt(3), 800));
        assert!(close(config.delay_for_attempt(6), 6400));
        // 0.1 * 2^7 = 12.8s, capped
        assert_eq!(config.delay_for_attempt(7), Duration::from_secs(10));
        assert_eq!(config.delay_for_attempt(8), Duration::from_secs(10));
        assert_eq!(config.delay_for_attempt(10_000), Duration::from_secs(10));
    }

    #[test]
    fn test_config_deserializes_humantime() {
        let json = r#"{"initial_delay": "250ms", "max_delay": "1m", "backoff_factor": 1.5}"#;
        let config: RetryConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.initial_delay, Duration::from_millis(250));
        assert_eq!(config.max_delay, Duration::from_secs(60));
        assert_eq!(config.max_attempts, usize::MAX);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = AtomicUsize::new(0);
        let result = retry("flaky", &RetryConfig::testing(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(SyncError::sink_transport("flaky", "connection reset"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_non_retryable() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry("bad_query", &RetryConfig::testing(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SyncError::UnknownQuery("film_work".into())) }
        })
        .await;

        assert!(matches!(result, Err(SyncError::UnknownQuery(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry("down", &RetryConfig::testing(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SyncError::sink_status("down", 503, "unavailable")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
