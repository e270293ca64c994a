//! Control-plane tunables

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Runtime configuration for all control-plane components
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Prefix length of the block each site gets from its exit node's range
    pub site_block_size: u8,
    /// Session lifetime; renewal kicks in once half of it has elapsed
    pub session_ttl: Duration,
    /// How often the offline sweep runs
    pub sweep_interval: Duration,
    /// Remote exit nodes without a heartbeat for this long are demoted
    pub exit_node_offline_after: Duration,
    /// Olm clients without a heartbeat for this long are demoted
    pub client_offline_after: Duration,
    /// Sites whose last bandwidth report is older than this are considered idle
    pub site_bandwidth_stale_after: Duration,
    /// Timeout for direct HTTP calls to exit nodes
    pub exit_node_request_timeout: Duration,
    /// Retry bounds for deadlocks and serialization failures
    pub retry: RetryPolicy,
    /// Attempts at allocating a site subnet before giving up on unique conflicts
    pub allocation_attempts: u32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            site_block_size: 30,
            session_ttl: Duration::from_secs(30 * 24 * 60 * 60),
            sweep_interval: Duration::from_secs(30),
            exit_node_offline_after: Duration::from_secs(120),
            client_offline_after: Duration::from_secs(120),
            site_bandwidth_stale_after: Duration::from_secs(60),
            exit_node_request_timeout: Duration::from_secs(8),
            retry: RetryPolicy::default(),
            allocation_attempts: 3,
        }
    }
}

/// Longest duration used in timestamp arithmetic, about a century
pub const MAX_DURATION: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Convert a std duration into a chrono one for timestamp arithmetic
///
/// Clamped to [`MAX_DURATION`] so adding it to a current timestamp cannot overflow.
pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration.min(MAX_DURATION)).unwrap_or(chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_chrono_duration_is_clamped() {
        let huge = chrono_duration(Duration::MAX);
        assert_eq!(huge, chrono::Duration::from_std(MAX_DURATION).unwrap());

        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert!(now.checked_add_signed(huge).is_some());
        assert!(now.checked_sub_signed(huge).is_some());
    }

    #[test]
    fn test_chrono_duration_keeps_small_values() {
        assert_eq!(
            chrono_duration(Duration::from_secs(90)),
            chrono::Duration::seconds(90)
        );
    }
}
