//! CLI command implementations.

pub mod code;
pub mod receive;
pub mod send;

use std::time::Duration;

/// Bound on create-session and join-session round trips.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Integer percentage of `done` out of `total`; an empty file is 100%.
pub fn percent(done: u64, total: u64) -> u64 {
    if total == 0 {
        100
    } else {
        done.saturating_mul(100) / total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_handles_empty_and_partial() {
        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(524_288, 1_048_576), 50);
        assert_eq!(percent(1_048_576, 1_048_576), 100);
    }
}
