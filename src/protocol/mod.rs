//! The announce/query gossip protocols, their backing tables, and the
//! timer-driven loop that orchestrates them.

use std::time::Duration;

pub mod announce_loop;
pub mod enode_certificate;
pub mod endpoint_table;
pub mod errors;
pub mod gossip_cache;
pub mod query_protocol;
pub mod version_protocol;
pub mod version_table;

pub use errors::ProtocolError;

/// Membership recheck cadence.
pub const MEMBERSHIP_TICK: Duration = Duration::from_secs(5);
/// Full version-table dump cadence.
pub const VERSION_SHARE_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Attempt-a-version-bump cadence.
pub const VERSION_BUMP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Prune-against-active-set cadence.
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(10 * 60);
/// Query-build cadence while announcing.
pub const QUERY_INTERVAL: Duration = Duration::from_secs(6 * 60);
/// Delay before the first query build after becoming an active announcer.
pub const INITIAL_QUERY_DELAY: Duration = Duration::from_secs(60);
/// Retry timer, strictly longer than the regossip cooldown so retries aren't
/// swallowed by a recipient's own dedup.
pub const QUERY_RETRY_TIMER: Duration = Duration::from_secs(5 * 60 + 30);
/// Minimum interval between regossips of the same source address, per
/// message class.
pub const REGOSSIP_COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// Per-recipient query backoff: `min(2^min(attempts,5) * 5, 160)` minutes.
/// The cap falls out of the formula once `attempts >= 5` (`2^5 * 5 == 160`).
pub fn query_backoff(attempts: u32) -> Duration {
    let exp = attempts.min(5);
    let minutes = 5u64 * 2u64.pow(exp);
    Duration::from_secs(minutes * 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_160_minutes() {
        assert_eq!(query_backoff(0), Duration::from_secs(5 * 60));
        assert_eq!(query_backoff(4), Duration::from_secs(80 * 60));
        assert_eq!(query_backoff(5), Duration::from_secs(160 * 60));
        assert_eq!(query_backoff(50), Duration::from_secs(160 * 60));
    }
}
