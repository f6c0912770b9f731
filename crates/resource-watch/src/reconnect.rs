//! Reconnect policy.
//!
//! Two halves: [`calculate_backoff`] turns the failed-attempt count into a
//! delay, and [`classify_close`] decides what a cleanly ended stream means.
//! A stream that carried data and stayed open past the healthy minimum is
//! healthy. A watch on one named resource that carried data but closed early
//! gets a long, fixed delay. Anything else counts as a failure and goes
//! through the backoff.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff settings derived from [`WatchConfig`](crate::WatchConfig).
#[derive(Clone, Copy, Debug)]
pub(crate) struct BackoffConfig {
    pub(crate) initial_delay: Duration,
    pub(crate) max_delay: Duration,
    pub(crate) factor: f64,
    pub(crate) jitter: f64,
}

impl BackoffConfig {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.initial_delay.is_zero() {
            return Err("Initial reconnect delay must be > 0".to_string());
        }
        if self.max_delay.is_zero() {
            return Err("Max reconnect delay must be > 0".to_string());
        }
        if self.max_delay < self.initial_delay {
            return Err("Max reconnect delay must be >= initial reconnect delay".to_string());
        }
        if self.factor < 1.0 || !self.factor.is_finite() {
            return Err("Backoff factor must be >= 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter) || !self.jitter.is_finite() {
            return Err("Jitter must be between 0.0 and 1.0".to_string());
        }
        Ok(())
    }
}

pub(crate) fn calculate_backoff(config: BackoffConfig, attempt: u32) -> Duration {
    let initial = config.initial_delay.as_secs_f64();
    let max = config.max_delay.as_secs_f64();
    let exponent = config.factor.powf(f64::from(attempt));
    let base = (initial * exponent).min(max);

    if config.jitter == 0.0 {
        return Duration::from_secs_f64(base);
    }

    let mut rng = rand::rng();
    let randomized = rng.random_range(0.0..=base);
    let blended = base * (1.0 - config.jitter) + randomized * config.jitter;
    Duration::from_secs_f64(blended)
}

/// How a stream that ended without an error is treated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CloseKind {
    /// Data flowed and the stream stayed open long enough; reconnect promptly.
    Healthy,
    /// A watch on one named resource went quiet and the server closed it.
    SingleResourceIdle,
    /// Closed too early to trust; handled like a transport failure.
    Premature,
}

/// Facts about a finished stream needed to classify its closure.
#[derive(Clone, Copy, Debug)]
pub(crate) struct StreamSummary<'a> {
    pub(crate) received_data: bool,
    pub(crate) open_for: Duration,
    pub(crate) single_resource: bool,
    pub(crate) resource_version: &'a str,
}

pub(crate) fn classify_close(summary: StreamSummary<'_>, min_healthy: Duration) -> CloseKind {
    if summary.received_data && summary.open_for >= min_healthy {
        return CloseKind::Healthy;
    }
    if summary.received_data && summary.single_resource && summary.resource_version != "0" {
        return CloseKind::SingleResourceIdle;
    }
    CloseKind::Premature
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(jitter: f64) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            jitter,
        }
    }

    #[test]
    fn backoff_without_jitter_doubles_per_attempt() {
        let config = backoff(0.0);
        let delays: Vec<_> = (0..5).map(|a| calculate_backoff(config, a)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
            ]
        );
    }

    #[test]
    fn backoff_is_capped_at_max_delay() {
        assert_eq!(calculate_backoff(backoff(0.0), 10), Duration::from_secs(30));
    }

    #[test]
    fn backoff_with_jitter_stays_within_base() {
        let config = backoff(0.5);
        for attempt in 0..6 {
            let base = calculate_backoff(backoff(0.0), attempt);
            let jittered = calculate_backoff(config, attempt);
            assert!(jittered <= base);
            assert!(jittered >= base / 2);
        }
    }

    #[test]
    fn validate_rejects_inverted_delays() {
        let config = BackoffConfig {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(1),
            factor: 2.0,
            jitter: 0.0,
        };
        assert_eq!(
            config.validate().expect_err("should fail"),
            "Max reconnect delay must be >= initial reconnect delay"
        );
    }

    #[test]
    fn classify_close_cases() {
        let min = Duration::from_secs(5);
        let summary = |received_data, secs, single_resource, rv| StreamSummary {
            received_data,
            open_for: Duration::from_secs(secs),
            single_resource,
            resource_version: rv,
        };

        assert_eq!(
            classify_close(summary(true, 10, false, "7"), min),
            CloseKind::Healthy
        );
        assert_eq!(
            classify_close(summary(true, 10, true, "7"), min),
            CloseKind::Healthy
        );
        assert_eq!(
            classify_close(summary(true, 1, true, "7"), min),
            CloseKind::SingleResourceIdle
        );
        assert_eq!(
            classify_close(summary(true, 1, true, "0"), min),
            CloseKind::Premature
        );
        assert_eq!(
            classify_close(summary(true, 1, false, "7"), min),
            CloseKind::Premature
        );
        assert_eq!(
            classify_close(summary(false, 60, true, "7"), min),
            CloseKind::Premature
        );
    }
}
