//! Watch manager configuration.

use std::time::Duration;

use crate::reconnect::BackoffConfig;

/// Configuration for a [`WatchManager`](crate::WatchManager).
///
/// Every timing constant of the reconnection state machine lives here so it
/// can be tuned per deployment. Setters are chainable.
#[derive(Clone, Debug)]
pub struct WatchConfig {
    /// Base URL of the control-plane API; resolved resource paths are joined
    /// onto it by [`HttpTransport`](crate::HttpTransport).
    pub base_url: String,
    /// Additional HTTP headers sent with every watch request.
    pub headers: http::HeaderMap,
    /// Upper bound on waiting for the initial response of a watch request.
    pub connect_timeout: Duration,
    /// Server-side watch timeout hint, sent as `timeoutSeconds`.
    pub server_timeout: Duration,
    /// How long a connection without subscribers is kept before teardown.
    pub cleanup_grace: Duration,
    /// Period of the health sweep over all connections.
    pub health_check_interval: Duration,
    /// Silence after which the health sweep force-reconnects a connection.
    pub stale_after: Duration,
    /// Silence on an open body after which the driver force-reconnects.
    pub idle_timeout: Duration,
    /// Minimum lifetime for a server-closed stream to count as healthy.
    pub min_healthy_duration: Duration,
    /// Delay before reopening after a healthy closure.
    pub healthy_reconnect_delay: Duration,
    /// Delay before reopening an idle single-resource watch.
    pub single_resource_reconnect_delay: Duration,
    /// Delay before reopening after the server expired the resource version.
    pub expired_reconnect_delay: Duration,
    /// Initial delay before the first reconnection attempt after a failure.
    pub reconnect_initial_delay: Duration,
    /// Maximum delay between reconnection attempts.
    pub reconnect_max_delay: Duration,
    /// Backoff multiplier for reconnection delays.
    pub reconnect_backoff_factor: f64,
    /// Consecutive failed attempts after which the connection gives up.
    pub reconnect_max_attempts: u32,
    /// Random jitter factor (0.0–1.0) for reconnection delays.
    pub reconnect_jitter: f64,
    /// Field selector key a resource `name` is folded into.
    pub name_field: String,
    /// Whether to ask the server for `BOOKMARK` events.
    pub allow_bookmarks: bool,
    /// Capacity of the manager command channel.
    pub command_channel_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            headers: http::HeaderMap::new(),
            connect_timeout: Duration::from_secs(10),
            server_timeout: Duration::from_secs(300),
            cleanup_grace: Duration::from_secs(1),
            health_check_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(45),
            min_healthy_duration: Duration::from_secs(5),
            healthy_reconnect_delay: Duration::from_secs(1),
            single_resource_reconnect_delay: Duration::from_secs(60),
            expired_reconnect_delay: Duration::from_millis(100),
            reconnect_initial_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_backoff_factor: 2.0,
            reconnect_max_attempts: 5,
            reconnect_jitter: 0.0,
            name_field: "metadata.name".to_string(),
            allow_bookmarks: false,
            command_channel_capacity: 64,
        }
    }
}

impl WatchConfig {
    /// Create a new configuration with the given API base URL.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Set additional HTTP headers.
    #[must_use]
    pub fn headers(mut self, headers: http::HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the server-side watch timeout hint.
    #[must_use]
    pub fn server_timeout(mut self, timeout: Duration) -> Self {
        self.server_timeout = timeout;
        self
    }

    /// Set the grace period before an unsubscribed connection is torn down.
    #[must_use]
    pub fn cleanup_grace(mut self, grace: Duration) -> Self {
        self.cleanup_grace = grace;
        self
    }

    /// Set the health sweep period.
    #[must_use]
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Set the staleness threshold used by the health sweep.
    #[must_use]
    pub fn stale_after(mut self, threshold: Duration) -> Self {
        self.stale_after = threshold;
        self
    }

    /// Set the per-chunk idle timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the minimum lifetime of a healthy stream.
    #[must_use]
    pub fn min_healthy_duration(mut self, duration: Duration) -> Self {
        self.min_healthy_duration = duration;
        self
    }

    /// Set the delay before reopening after a healthy closure.
    #[must_use]
    pub fn healthy_reconnect_delay(mut self, delay: Duration) -> Self {
        self.healthy_reconnect_delay = delay;
        self
    }

    /// Set the delay before reopening an idle single-resource watch.
    #[must_use]
    pub fn single_resource_reconnect_delay(mut self, delay: Duration) -> Self {
        self.single_resource_reconnect_delay = delay;
        self
    }

    /// Set the delay before reopening after an expired resource version.
    #[must_use]
    pub fn expired_reconnect_delay(mut self, delay: Duration) -> Self {
        self.expired_reconnect_delay = delay;
        self
    }

    /// Set the initial reconnection delay.
    #[must_use]
    pub fn reconnect_initial_delay(mut self, delay: Duration) -> Self {
        self.reconnect_initial_delay = delay;
        self
    }

    /// Set the maximum reconnection delay.
    #[must_use]
    pub fn reconnect_max_delay(mut self, delay: Duration) -> Self {
        self.reconnect_max_delay = delay;
        self
    }

    /// Set the reconnection backoff factor.
    #[must_use]
    pub fn reconnect_backoff_factor(mut self, factor: f64) -> Self {
        self.reconnect_backoff_factor = factor;
        self
    }

    /// Set the maximum number of consecutive failed attempts.
    #[must_use]
    pub fn reconnect_max_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_max_attempts = attempts;
        self
    }

    /// Set the reconnection jitter factor.
    #[must_use]
    pub fn reconnect_jitter(mut self, jitter: f64) -> Self {
        self.reconnect_jitter = jitter;
        self
    }

    /// Set the field selector key used for `name` filters.
    #[must_use]
    pub fn name_field(mut self, field: impl Into<String>) -> Self {
        self.name_field = field.into();
        self
    }

    /// Set whether `allowWatchBookmarks=true` is requested.
    #[must_use]
    pub fn allow_bookmarks(mut self, allow: bool) -> Self {
        self.allow_bookmarks = allow;
        self
    }

    /// Set the command channel capacity.
    #[must_use]
    pub fn command_channel_capacity(mut self, capacity: usize) -> Self {
        self.command_channel_capacity = capacity;
        self
    }

    pub(crate) fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: self.reconnect_initial_delay,
            max_delay: self.reconnect_max_delay,
            factor: self.reconnect_backoff_factor,
            jitter: self.reconnect_jitter,
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error message string if any field has an invalid value.
    pub fn validate(&self) -> Result<(), String> {
        self.backoff().validate()?;
        if self.reconnect_max_attempts == 0 {
            return Err("Max reconnect attempts must be > 0".to_string());
        }
        if self.health_check_interval.is_zero() {
            return Err("Health check interval must be > 0".to_string());
        }
        if self.idle_timeout.is_zero() {
            return Err("Idle timeout must be > 0".to_string());
        }
        if self.connect_timeout.is_zero() {
            return Err("Connect timeout must be > 0".to_string());
        }
        if self.name_field.is_empty() {
            return Err("Name field cannot be empty".to_string());
        }
        if self.command_channel_capacity == 0 {
            return Err("Command channel capacity must be > 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WatchConfig::default();
        assert!(config.base_url.is_empty());
        assert!(config.headers.is_empty());
        assert_eq!(config.cleanup_grace, Duration::from_secs(1));
        assert_eq!(config.expired_reconnect_delay, Duration::from_millis(100));
        assert_eq!(config.reconnect_initial_delay, Duration::from_secs(1));
        assert_eq!(config.reconnect_backoff_factor, 2.0);
        assert_eq!(config.reconnect_max_attempts, 5);
        assert_eq!(config.reconnect_jitter, 0.0);
        assert_eq!(config.name_field, "metadata.name");
        assert!(!config.allow_bookmarks);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            "Bearer token".parse().expect("valid header value"),
        );

        let config = WatchConfig::new("https://api.example.com")
            .headers(headers)
            .cleanup_grace(Duration::from_millis(250))
            .stale_after(Duration::from_secs(120))
            .reconnect_max_attempts(8)
            .allow_bookmarks(true)
            .name_field("spec.name");

        assert_eq!(config.base_url, "https://api.example.com");
        assert!(config.headers.contains_key(http::header::AUTHORIZATION));
        assert_eq!(config.cleanup_grace, Duration::from_millis(250));
        assert_eq!(config.stale_after, Duration::from_secs(120));
        assert_eq!(config.reconnect_max_attempts, 8);
        assert!(config.allow_bookmarks);
        assert_eq!(config.name_field, "spec.name");
    }

    #[test]
    fn test_validation_invalid_backoff() {
        let config = WatchConfig::new("https://example.com").reconnect_backoff_factor(0.5);
        assert_eq!(
            config.validate().expect_err("should fail"),
            "Backoff factor must be >= 1.0"
        );
    }

    #[test]
    fn test_validation_zero_attempts() {
        let config = WatchConfig::new("https://example.com").reconnect_max_attempts(0);
        assert_eq!(
            config.validate().expect_err("should fail"),
            "Max reconnect attempts must be > 0"
        );
    }

    #[test]
    fn test_validation_zero_command_channel() {
        let config = WatchConfig::new("https://example.com").command_channel_capacity(0);
        assert_eq!(
            config.validate().expect_err("should fail"),
            "Command channel capacity must be > 0"
        );
    }

    #[test]
    fn test_validation_boundary_jitter() {
        let config = WatchConfig::new("https://example.com").reconnect_jitter(1.0);
        assert!(config.validate().is_ok());

        let config = WatchConfig::new("https://example.com").reconnect_jitter(1.5);
        assert_eq!(
            config.validate().expect_err("should fail"),
            "Jitter must be between 0.0 and 1.0"
        );
    }
}
