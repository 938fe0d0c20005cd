//! Engine timing and sampling configuration.
//!
//! Built from the `[cache]` section of `sluice.toml`.

use std::time::Duration;

use rand::Rng;

const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_MAX_RW_TIME: Duration = Duration::from_millis(1000);
const DEFAULT_CACHE_EXPIRATION: Duration = Duration::from_secs(600);
const DEFAULT_EMPTY_EXPIRATION: Duration = Duration::from_secs(30);
const DEFAULT_DISTRUST_PROBABILITY: f64 = 0.01;
const DEFAULT_CEILING_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Ledger entries outlive the flush that persists them by this margin.
const LEDGER_SAFETY_MARGIN: Duration = Duration::from_secs(1);

/// Upper bound of the random extension applied to positive TTLs.
const EXPIRATION_JITTER_RATIO: f64 = 0.1;

/// Bound on optimistic-lock read attempts.
pub const MAX_WATCH_RETRIES: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Write-back queue flush period.
    pub sync_interval: Duration,
    /// Bound on one durable write; used for double-delete and shutdown drain.
    pub max_rw_time: Duration,
    /// Baseline TTL of positive entries.
    pub cache_expiration: Duration,
    /// TTL of negative-cache placeholders.
    pub empty_expiration: Duration,
    /// Probability that a relation read bypasses the bitmap.
    pub distrust_probability: f64,
    pub ceiling_refresh_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sync_interval: DEFAULT_SYNC_INTERVAL,
            max_rw_time: DEFAULT_MAX_RW_TIME,
            cache_expiration: DEFAULT_CACHE_EXPIRATION,
            empty_expiration: DEFAULT_EMPTY_EXPIRATION,
            distrust_probability: DEFAULT_DISTRUST_PROBABILITY,
            ceiling_refresh_interval: DEFAULT_CEILING_REFRESH_INTERVAL,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            sync_interval: Duration::from_secs(settings.sync_interval_seconds),
            max_rw_time: Duration::from_millis(settings.max_rw_time_ms),
            cache_expiration: Duration::from_secs(settings.cache_expiration_seconds),
            empty_expiration: Duration::from_secs(settings.empty_expiration_seconds),
            distrust_probability: settings.distrust_probability,
            ceiling_refresh_interval: Duration::from_secs(settings.ceiling_refresh_interval_seconds),
        }
    }
}

impl CacheConfig {
    /// Worst-case delay between a mutation and its durable persistence.
    pub fn max_sync_delay(&self) -> Duration {
        self.sync_interval + self.max_rw_time
    }

    pub fn ledger_ttl(&self) -> Duration {
        self.max_sync_delay() + LEDGER_SAFETY_MARGIN
    }

    /// Delay before a mutation's bitmap bit is corrected.
    pub fn correction_delay(&self) -> Duration {
        self.max_sync_delay()
    }

    /// Positive TTL extended by a random share of up to 10%.
    pub fn positive_ttl(&self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.0..=EXPIRATION_JITTER_RATIO);
        self.cache_expiration.mul_f64(1.0 + jitter)
    }

    pub fn negative_ttl(&self) -> Duration {
        self.empty_expiration
    }

    /// Clamp the sampling rate into `[0, 1]`; NaN disables bypass.
    pub fn effective_distrust(&self) -> f64 {
        if self.distrust_probability.is_nan() {
            0.0
        } else {
            self.distrust_probability.clamp(0.0, 1.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.sync_interval, Duration::from_secs(10));
        assert_eq!(config.max_rw_time, Duration::from_millis(1000));
        assert_eq!(config.cache_expiration, Duration::from_secs(600));
        assert_eq!(config.empty_expiration, Duration::from_secs(30));
        assert_eq!(config.distrust_probability, 0.01);
    }

    #[test]
    fn derived_delays() {
        let config = CacheConfig::default();
        assert_eq!(config.max_sync_delay(), Duration::from_secs(11));
        assert_eq!(config.ledger_ttl(), Duration::from_secs(12));
        assert_eq!(config.correction_delay(), config.max_sync_delay());
        assert!(config.ledger_ttl() > config.correction_delay());
    }

    #[test]
    fn positive_ttl_stays_within_jitter_and_above_negative() {
        let config = CacheConfig::default();
        for _ in 0..200 {
            let ttl = config.positive_ttl();
            assert!(ttl >= config.cache_expiration);
            assert!(ttl <= config.cache_expiration.mul_f64(1.1));
            assert!(config.negative_ttl() < ttl);
        }
    }

    #[test]
    fn distrust_is_clamped() {
        let mut config = CacheConfig {
            distrust_probability: 3.0,
            ..Default::default()
        };
        assert_eq!(config.effective_distrust(), 1.0);
        config.distrust_probability = f64::NAN;
        assert_eq!(config.effective_distrust(), 0.0);
    }
}
