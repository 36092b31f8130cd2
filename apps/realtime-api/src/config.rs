/// Realtime API configuration, loaded from environment variables.
///
/// All pipeline knobs are optional: an invalid or missing value falls back to
/// its default, and every value is clamped to its documented minimum. The
/// resolved values are logged once at startup so operators can see what the
/// process is actually running with.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Capacity of the message distribution queue (min 1).
    pub message_distribution_queue_size: usize,
    /// Capacity of the reaction distribution queue (min 1).
    pub reaction_distribution_queue_size: usize,
    /// Capacity of the message write-back buffer (min 1).
    pub message_writeback_queue_size: usize,
    /// Capacity of the reaction write-back buffer (min 1).
    pub reaction_writeback_queue_size: usize,
    /// Message write-back flush interval in milliseconds (min 500).
    pub message_writeback_interval_ms: u64,
    /// Reaction write-back flush interval in milliseconds (min 500).
    pub reaction_writeback_interval_ms: u64,
}

const DEFAULT_DISTRIBUTION_QUEUE_SIZE: usize = 5;
const DEFAULT_WRITEBACK_QUEUE_SIZE: usize = 100;
const DEFAULT_WRITEBACK_INTERVAL_MS: u64 = 5000;
const MIN_WRITEBACK_INTERVAL_MS: u64 = 500;

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4003),
            message_distribution_queue_size: clamped_usize(
                std::env::var("MESSAGE_DISTRIBUTION_QUEUE_SIZE").ok().as_deref(),
                DEFAULT_DISTRIBUTION_QUEUE_SIZE,
                1,
            ),
            reaction_distribution_queue_size: clamped_usize(
                std::env::var("REACTION_DISTRIBUTION_QUEUE_SIZE").ok().as_deref(),
                DEFAULT_DISTRIBUTION_QUEUE_SIZE,
                1,
            ),
            message_writeback_queue_size: clamped_usize(
                std::env::var("MESSAGE_WRITEBACK_QUEUE_SIZE").ok().as_deref(),
                DEFAULT_WRITEBACK_QUEUE_SIZE,
                1,
            ),
            reaction_writeback_queue_size: clamped_usize(
                std::env::var("REACTION_WRITEBACK_QUEUE_SIZE").ok().as_deref(),
                DEFAULT_WRITEBACK_QUEUE_SIZE,
                1,
            ),
            message_writeback_interval_ms: clamped_u64(
                std::env::var("MESSAGE_WRITEBACK_INTERVAL").ok().as_deref(),
                DEFAULT_WRITEBACK_INTERVAL_MS,
                MIN_WRITEBACK_INTERVAL_MS,
            ),
            reaction_writeback_interval_ms: clamped_u64(
                std::env::var("REACTION_WRITEBACK_INTERVAL").ok().as_deref(),
                DEFAULT_WRITEBACK_INTERVAL_MS,
                MIN_WRITEBACK_INTERVAL_MS,
            ),
        }
    }

    /// Log the resolved pipeline configuration. Called once at startup.
    pub fn log_resolved(&self) {
        tracing::info!(
            message_distribution_queue_size = self.message_distribution_queue_size,
            reaction_distribution_queue_size = self.reaction_distribution_queue_size,
            message_writeback_queue_size = self.message_writeback_queue_size,
            reaction_writeback_queue_size = self.reaction_writeback_queue_size,
            message_writeback_interval_ms = self.message_writeback_interval_ms,
            reaction_writeback_interval_ms = self.reaction_writeback_interval_ms,
            "pipeline configuration resolved"
        );
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4003,
            message_distribution_queue_size: DEFAULT_DISTRIBUTION_QUEUE_SIZE,
            reaction_distribution_queue_size: DEFAULT_DISTRIBUTION_QUEUE_SIZE,
            message_writeback_queue_size: DEFAULT_WRITEBACK_QUEUE_SIZE,
            reaction_writeback_queue_size: DEFAULT_WRITEBACK_QUEUE_SIZE,
            message_writeback_interval_ms: DEFAULT_WRITEBACK_INTERVAL_MS,
            reaction_writeback_interval_ms: DEFAULT_WRITEBACK_INTERVAL_MS,
        }
    }
}

fn clamped_usize(raw: Option<&str>, default: usize, min: usize) -> usize {
    raw.and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
        .max(min)
}

fn clamped_u64(raw: Option<&str>, default: u64, min: u64) -> u64 {
    raw.and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
        .max(min)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_value_falls_back_to_default() {
        assert_eq!(clamped_usize(None, 5, 1), 5);
        assert_eq!(clamped_u64(None, 5000, 500), 5000);
    }

    #[test]
    fn garbage_value_falls_back_to_default() {
        assert_eq!(clamped_usize(Some("not-a-number"), 5, 1), 5);
        assert_eq!(clamped_u64(Some(""), 5000, 500), 5000);
    }

    #[test]
    fn values_are_clamped_to_minimum() {
        assert_eq!(clamped_usize(Some("0"), 5, 1), 1);
        assert_eq!(clamped_u64(Some("100"), 5000, 500), 500);
    }

    #[test]
    fn valid_value_is_used() {
        assert_eq!(clamped_usize(Some("12"), 5, 1), 12);
        assert_eq!(clamped_u64(Some("750"), 5000, 500), 750);
    }
}
