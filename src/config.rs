//! Configuration surface (§6). Plain structs with sane defaults — loading
//! them from a file or environment is the surrounding process's job, not
//! this crate's.

/// Backoff schedule for the file backend's per-project region acquisition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryBackoff {
    pub min_millis: u64,
    pub max_millis: u64,
    pub factor: f64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            min_millis: 10,
            max_millis: 500,
            factor: 2.0,
        }
    }
}

impl RetryBackoff {
    pub fn with_min_millis(mut self, min_millis: u64) -> Self {
        self.min_millis = min_millis;
        self
    }

    pub fn with_max_millis(mut self, max_millis: u64) -> Self {
        self.max_millis = max_millis;
        self
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Delay for the given (zero-based) retry attempt, capped at `max_millis`.
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let scaled = self.min_millis as f64 * self.factor.powi(attempt as i32);
        let capped = scaled.min(self.max_millis as f64);
        std::time::Duration::from_millis(capped as u64)
    }
}

/// Broker-wide configuration (spec.md §6 "Configuration surface").
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    pub default_max_retries: u32,
    pub default_lease_duration_minutes: f64,
    pub reaper_interval_minutes: f64,
    pub session_default_ttl_seconds: u64,
    pub storage_lock_timeout_millis: u64,
    pub concurrent_fetch_retry_backoff: RetryBackoff,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            default_lease_duration_minutes: 10.0,
            reaper_interval_minutes: 1.0,
            session_default_ttl_seconds: 3_600,
            storage_lock_timeout_millis: 5_000,
            concurrent_fetch_retry_backoff: RetryBackoff::default(),
        }
    }
}

impl BrokerConfig {
    pub fn with_default_max_retries(mut self, value: u32) -> Self {
        self.default_max_retries = value;
        self
    }

    pub fn with_default_lease_duration_minutes(mut self, value: f64) -> Self {
        self.default_lease_duration_minutes = value;
        self
    }

    pub fn with_reaper_interval_minutes(mut self, value: f64) -> Self {
        self.reaper_interval_minutes = value;
        self
    }

    pub fn with_session_default_ttl_seconds(mut self, value: u64) -> Self {
        self.session_default_ttl_seconds = value;
        self
    }

    pub fn with_storage_lock_timeout_millis(mut self, value: u64) -> Self {
        self.storage_lock_timeout_millis = value;
        self
    }

    pub fn with_concurrent_fetch_retry_backoff(mut self, value: RetryBackoff) -> Self {
        self.concurrent_fetch_retry_backoff = value;
        self
    }

    pub fn lease_duration(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.default_lease_duration_minutes * 60_000.0) as i64)
    }

    pub fn session_default_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_default_ttl_seconds as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.default_max_retries, 3);
        assert_eq!(config.session_default_ttl_seconds, 3_600);
    }

    #[test]
    fn builder_methods_override_fields() {
        let config = BrokerConfig::default()
            .with_default_max_retries(7)
            .with_reaper_interval_minutes(0.5);
        assert_eq!(config.default_max_retries, 7);
        assert_eq!(config.reaper_interval_minutes, 0.5);
    }

    #[test]
    fn backoff_delay_grows_then_caps() {
        let backoff = RetryBackoff::default();
        assert_eq!(backoff.delay_for_attempt(0).as_millis(), 10);
        assert_eq!(backoff.delay_for_attempt(1).as_millis(), 20);
        assert_eq!(backoff.delay_for_attempt(20).as_millis(), 500);
    }
}
