//! Transfer tunables shared by sender and receiver engines.

use std::time::Duration;

/// Default chunk size in bytes (128 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;

/// Default number of chunks per batch.
pub const DEFAULT_BATCH_SIZE: usize = 5;

/// Default number of retries for a rejected batch.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Knobs that shape a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunables {
    /// Largest chunk payload in bytes.
    pub chunk_size: usize,
    /// Chunks per batch.
    pub batch_size: usize,
    /// Resends of one batch before the transfer fails.
    pub max_retries: u32,
    /// Bound on every pull-signal and chunk-ack wait.
    pub wait_timeout: Duration,
    /// A receiving transfer with no activity for this long is failed.
    pub inactivity_timeout: Duration,
    /// Retry `n` waits `retry_base_delay * n`.
    pub retry_base_delay: Duration,
    /// How long a finished sender keeps its routing entry before releasing it.
    pub release_grace: Duration,
    /// Period of the receiver's inactivity check.
    pub idle_check_interval: Duration,
}

impl Tunables {
    /// Bytes covered by one full batch.
    pub fn batch_bytes(&self) -> u64 {
        (self.chunk_size as u64).saturating_mul(self.batch_size as u64)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_base_delay.saturating_mul(attempt)
    }
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            wait_timeout: Duration::from_millis(30_000),
            inactivity_timeout: Duration::from_millis(300_000),
            retry_base_delay: Duration::from_millis(1_000),
            release_grace: Duration::from_millis(5_000),
            idle_check_interval: Duration::from_millis(5_000),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let t = Tunables::default();
        assert_eq!(t.chunk_size, 131_072);
        assert_eq!(t.batch_size, 5);
        assert_eq!(t.max_retries, 3);
        assert_eq!(t.batch_bytes(), 655_360);
    }

    #[test]
    fn retry_delay_is_linear() {
        let t = Tunables::default();
        assert_eq!(t.retry_delay(1), Duration::from_secs(1));
        assert_eq!(t.retry_delay(3), Duration::from_secs(3));
    }
}
