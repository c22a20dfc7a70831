/// Configuration for the delivery engine.
///
/// All fields have defaults. `DeliveryConfig::new()` additionally reads the
/// `MTS_*` environment variables; chained setters override both:
///
/// ```rust
/// use std::time::Duration;
/// use mts_protocol::DeliveryConfig;
///
/// let config = DeliveryConfig::new()
///     .pool_size(8)
///     .max_queue_bytes(64 * 1024 * 1024)
///     .stuck_threshold(Duration::from_secs(30));
/// ```
use std::str::FromStr;
use std::time::Duration;

const MIB: usize = 1024 * 1024;

pub const ENV_POOL_SIZE: &str = "MTS_POOL_SIZE";
pub const ENV_DELIVERY_SLOW_MS: &str = "MTS_DELIVERY_SLOW_MS";
pub const ENV_DELIVERY_VERY_SLOW_MS: &str = "MTS_DELIVERY_VERY_SLOW_MS";
pub const ENV_DELIVERY_STUCK_MS: &str = "MTS_DELIVERY_STUCK_MS";
pub const ENV_STUCK_CHECK_MS: &str = "MTS_STUCK_CHECK_MS";
pub const ENV_QUEUE_WARNING_BYTES: &str = "MTS_QUEUE_WARNING_BYTES";
pub const ENV_QUEUE_MAX_BYTES: &str = "MTS_QUEUE_MAX_BYTES";
pub const ENV_QUEUE_SLEEP_FACTOR: &str = "MTS_QUEUE_SLEEP_FACTOR";
pub const ENV_MAX_RESOLUTION_ATTEMPTS: &str = "MTS_MAX_RESOLUTION_ATTEMPTS";
pub const ENV_RESOLUTION_RETRY_MS: &str = "MTS_RESOLUTION_RETRY_MS";
pub const ENV_MULTIPLE_DELIVERY: &str = "MTS_MULTIPLE_DELIVERY";
pub const ENV_LOCATION_CACHE_SIZE: &str = "MTS_LOCATION_CACHE_SIZE";

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Number of deliverer workers.
    pub(crate) pool_size: usize,
    /// Deliveries slower than this (per message) are logged as slow.
    pub(crate) slow_threshold: Duration,
    /// Deliveries slower than this (per message) are logged as very slow.
    pub(crate) very_slow_threshold: Duration,
    /// A worker busy on one delivery for longer than this is stuck.
    pub(crate) stuck_threshold: Duration,
    /// How often the watchdog looks for stuck workers.
    pub(crate) stuck_check_interval: Duration,
    /// Queued bytes above which a warning is logged (and throttling starts).
    pub(crate) warning_queue_bytes: usize,
    /// Queued bytes above which new messages are rejected.
    pub(crate) max_queue_bytes: usize,
    /// Milliseconds of caller sleep per MiB queued above the warning size.
    /// Zero or negative disables throttling.
    pub(crate) sleep_time_factor: f64,
    /// Location resolution attempts before giving up with `NotFound`.
    pub(crate) max_resolution_attempts: u32,
    /// Pause between two resolution attempts.
    pub(crate) resolution_retry_delay: Duration,
    /// Coalesce queued messages for the same receiver into one delivery.
    pub(crate) multiple_delivery: bool,
    /// Capacity of the slice location cache (0 disables it).
    pub(crate) location_cache_size: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            pool_size: 5,
            slow_threshold: Duration::from_millis(1000),
            very_slow_threshold: Duration::from_millis(10_000),
            stuck_threshold: Duration::from_millis(60_000),
            stuck_check_interval: Duration::from_millis(10_000),
            warning_queue_bytes: 10 * MIB,
            max_queue_bytes: 100 * MIB,
            sleep_time_factor: 0.0,
            max_resolution_attempts: 5,
            resolution_retry_delay: Duration::from_millis(100),
            multiple_delivery: true,
            location_cache_size: 1000,
        }
    }
}

impl DeliveryConfig {
    /// Defaults, overridden by any `MTS_*` environment variable that is set.
    pub fn new() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults, overridden by whatever `lookup` returns for the `MTS_*` keys.
    ///
    /// Values that fail to parse are ignored with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let ms = |key: &str, into: &mut Duration| {
            if let Some(v) = parse::<u64>(&lookup, key) {
                *into = Duration::from_millis(v);
            }
        };

        if let Some(v) = parse(&lookup, ENV_POOL_SIZE) {
            config.pool_size = v;
        }
        ms(ENV_DELIVERY_SLOW_MS, &mut config.slow_threshold);
        ms(ENV_DELIVERY_VERY_SLOW_MS, &mut config.very_slow_threshold);
        ms(ENV_DELIVERY_STUCK_MS, &mut config.stuck_threshold);
        ms(ENV_STUCK_CHECK_MS, &mut config.stuck_check_interval);
        if let Some(v) = parse(&lookup, ENV_QUEUE_WARNING_BYTES) {
            config.warning_queue_bytes = v;
        }
        if let Some(v) = parse(&lookup, ENV_QUEUE_MAX_BYTES) {
            config.max_queue_bytes = v;
        }
        if let Some(v) = parse(&lookup, ENV_QUEUE_SLEEP_FACTOR) {
            config.sleep_time_factor = v;
        }
        if let Some(v) = parse(&lookup, ENV_MAX_RESOLUTION_ATTEMPTS) {
            config.max_resolution_attempts = v;
        }
        ms(ENV_RESOLUTION_RETRY_MS, &mut config.resolution_retry_delay);
        if let Some(v) = parse(&lookup, ENV_MULTIPLE_DELIVERY) {
            config.multiple_delivery = v;
        }
        if let Some(v) = parse(&lookup, ENV_LOCATION_CACHE_SIZE) {
            config.location_cache_size = v;
        }
        config
    }

    /// Number of deliverer workers (at least 1).
    pub fn pool_size(mut self, workers: usize) -> Self {
        self.pool_size = workers.max(1);
        self
    }

    pub fn slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    pub fn very_slow_threshold(mut self, threshold: Duration) -> Self {
        self.very_slow_threshold = threshold;
        self
    }

    pub fn stuck_threshold(mut self, threshold: Duration) -> Self {
        self.stuck_threshold = threshold;
        self
    }

    pub fn stuck_check_interval(mut self, interval: Duration) -> Self {
        self.stuck_check_interval = interval;
        self
    }

    pub fn warning_queue_bytes(mut self, bytes: usize) -> Self {
        self.warning_queue_bytes = bytes;
        self
    }

    pub fn max_queue_bytes(mut self, bytes: usize) -> Self {
        self.max_queue_bytes = bytes;
        self
    }

    pub fn sleep_time_factor(mut self, factor: f64) -> Self {
        self.sleep_time_factor = factor;
        self
    }

    /// Resolution attempts before `NotFound` is final (at least 1).
    pub fn max_resolution_attempts(mut self, attempts: u32) -> Self {
        self.max_resolution_attempts = attempts.max(1);
        self
    }

    pub fn resolution_retry_delay(mut self, delay: Duration) -> Self {
        self.resolution_retry_delay = delay;
        self
    }

    pub fn multiple_delivery(mut self, enabled: bool) -> Self {
        self.multiple_delivery = enabled;
        self
    }

    pub fn location_cache_size(mut self, entries: usize) -> Self {
        self.location_cache_size = entries;
        self
    }

    pub fn workers(&self) -> usize {
        self.pool_size
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_resolution_attempts
    }

    /// Queue thresholds as consumed by the outbound queue.
    pub fn queue_limits(&self) -> QueueLimits {
        QueueLimits {
            warning_bytes: self.warning_queue_bytes,
            max_bytes: self.max_queue_bytes,
            sleep_time_factor: self.sleep_time_factor,
        }
    }
}

/// The three outbound queue thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueLimits {
    pub warning_bytes: usize,
    pub max_bytes: usize,
    pub sleep_time_factor: f64,
}

impl Default for QueueLimits {
    fn default() -> Self {
        DeliveryConfig::default().queue_limits()
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("config: ignoring unparsable {key}={raw:?}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(pairs: &[(&str, &str)]) -> DeliveryConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DeliveryConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults() {
        let c = DeliveryConfig::default();
        assert_eq!(c.pool_size, 5);
        assert_eq!(c.max_queue_bytes, 100 * MIB);
        assert!(c.multiple_delivery);
        assert_eq!(c.sleep_time_factor, 0.0);
    }

    #[test]
    fn lookup_overrides() {
        let c = from_map(&[
            (ENV_POOL_SIZE, "9"),
            (ENV_DELIVERY_STUCK_MS, "1500"),
            (ENV_QUEUE_MAX_BYTES, "4096"),
            (ENV_QUEUE_SLEEP_FACTOR, "2.5"),
            (ENV_MULTIPLE_DELIVERY, "false"),
            (ENV_MAX_RESOLUTION_ATTEMPTS, "2"),
        ]);
        assert_eq!(c.pool_size, 9);
        assert_eq!(c.stuck_threshold, Duration::from_millis(1500));
        assert_eq!(c.max_queue_bytes, 4096);
        assert_eq!(c.sleep_time_factor, 2.5);
        assert!(!c.multiple_delivery);
        assert_eq!(c.max_resolution_attempts, 2);
    }

    #[test]
    fn unparsable_values_keep_defaults() {
        let c = from_map(&[(ENV_POOL_SIZE, "many"), (ENV_MULTIPLE_DELIVERY, "yes")]);
        assert_eq!(c.pool_size, 5);
        assert!(c.multiple_delivery);
    }

    #[test]
    fn builder_clamps() {
        let c = DeliveryConfig::default().pool_size(0).max_resolution_attempts(0);
        assert_eq!(c.pool_size, 1);
        assert_eq!(c.max_resolution_attempts, 1);
    }

    #[test]
    fn queue_limits_mirror_config() {
        let c = DeliveryConfig::default()
            .warning_queue_bytes(10)
            .max_queue_bytes(20)
            .sleep_time_factor(1.0);
        assert_eq!(
            c.queue_limits(),
            QueueLimits {
                warning_bytes: 10,
                max_bytes: 20,
                sleep_time_factor: 1.0
            }
        );
    }
}
