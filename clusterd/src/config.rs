use std::time::Duration;

use tracing::{info, warn};
use typed_builder::TypedBuilder;

/// Timing and behavior of the consensus engine
#[derive(TypedBuilder, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaftConfig {
    /// Follower becomes a candidate after not hearing from a leader this long
    #[builder(default = RaftConfig::DEFAULT_ELECTION_TIMEOUT)]
    pub election_timeout: Duration,

    /// How often the leader pings its followers
    #[builder(default = RaftConfig::DEFAULT_PING_INTERVAL)]
    pub ping_interval: Duration,

    #[builder(default = RaftConfig::DEFAULT_MIN_PING_INTERVAL)]
    pub min_ping_interval: Duration,

    /// Pause before retrying an election that could not reach a quorum
    #[builder(default = RaftConfig::DEFAULT_ELECTION_RETRY_DELAY)]
    pub election_retry_delay: Duration,

    /// Bound on waiting for a single peer reply
    #[builder(default = RaftConfig::DEFAULT_RPC_TIMEOUT)]
    pub rpc_timeout: Duration,

    #[builder(default = RaftConfig::DEFAULT_CONNECT_TIMEOUT)]
    pub connect_timeout: Duration,

    /// How often the connection keeper retries broken peer connections
    #[builder(default = RaftConfig::DEFAULT_RECONNECT_INTERVAL)]
    pub reconnect_interval: Duration,

    /// Disabled nodes reply "unwilling" and never start elections
    #[builder(default = true)]
    pub enabled: bool,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RaftConfig {
    pub const DEFAULT_ELECTION_TIMEOUT: Duration = Duration::from_millis(3000);
    pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(1000);
    pub const DEFAULT_MIN_PING_INTERVAL: Duration = Duration::from_millis(50);
    pub const DEFAULT_ELECTION_RETRY_DELAY: Duration = Duration::from_millis(1000);
    pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(1);
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
    pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(3);

    /// `election_timeout / ping_interval` must be above this (in tenths)
    const MIN_TIMEOUT_RATIO_TENTHS: u128 = 21;

    /// Fix up timing values that can't work together
    ///
    /// * `ping_interval` is floored to `min_ping_interval`,
    /// * if `election_timeout` is not comfortably larger than two ping
    ///   intervals, `ping_interval` is multiplied by 3.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        let min_ping_interval = self.min_ping_interval.max(Duration::from_millis(1));
        if self.ping_interval < min_ping_interval {
            warn!(
                ping_interval_ms = self.ping_interval.as_millis(),
                min_ping_interval_ms = min_ping_interval.as_millis(),
                "ping interval below minimum, raising it"
            );
            self.ping_interval = min_ping_interval;
        }

        if self.election_timeout.as_millis() * 10
            <= self.ping_interval.as_millis() * Self::MIN_TIMEOUT_RATIO_TENTHS
        {
            self.ping_interval *= 3;
            warn!(
                election_timeout_ms = self.election_timeout.as_millis(),
                ping_interval_ms = self.ping_interval.as_millis(),
                "election timeout must be more than 2x the ping interval, adjusted ping interval"
            );
        }

        info!(
            election_timeout_ms = self.election_timeout.as_millis(),
            ping_interval_ms = self.ping_interval.as_millis(),
            "Raft timing"
        );

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn sane_values_are_kept() {
        let config = RaftConfig::builder()
            .election_timeout(ms(150))
            .ping_interval(ms(50))
            .build()
            .normalized();
        assert_eq!(config.election_timeout, ms(150));
        assert_eq!(config.ping_interval, ms(50));
    }

    #[test]
    fn ping_interval_is_floored() {
        let config = RaftConfig::builder()
            .election_timeout(ms(1000))
            .ping_interval(ms(10))
            .min_ping_interval(ms(100))
            .build()
            .normalized();
        assert_eq!(config.ping_interval, ms(100));
    }

    #[test]
    fn low_ratio_triples_ping_interval() {
        let config = RaftConfig::builder()
            .election_timeout(ms(210))
            .ping_interval(ms(100))
            .build()
            .normalized();
        assert_eq!(config.election_timeout, ms(210));
        assert_eq!(config.ping_interval, ms(300));

        let config = RaftConfig::builder()
            .election_timeout(ms(220))
            .ping_interval(ms(100))
            .build()
            .normalized();
        assert_eq!(config.ping_interval, ms(100));
    }
}
