//! Agent configuration.

use std::time::Duration;

/// Default heartbeat window.
pub const DEFAULT_BEAT: Duration = Duration::from_millis(100);
/// Default lease term as a multiple of the heartbeat window.
pub const DEFAULT_LEASE_BEATS: u32 = 10;
/// Default additive grace applied to foreign lease expirations.
pub const DEFAULT_MAX_CLOCK_SKEW: Duration = Duration::from_secs(1);
/// Default depth of the accepted-leader history ring.
pub const DEFAULT_HISTORY_COUNT: usize = 100;

/// Configuration for one membership agent, set once at construction.
#[derive(Clone, Debug)]
pub struct MembershipConfig {
    /// Heartbeat window: how long each round waits for pongs.
    pub beat_duration: Duration,
    /// How long an accepted leader remains leader without re-election.
    pub lease_duration: Duration,
    /// Additive grace applied to foreign lease expirations, absorbing
    /// bounded clock skew between agents.
    pub max_clock_skew: Duration,
    /// Depth of the accepted-leader history ring. Zero falls back to the
    /// default of 100.
    pub history_count: usize,
    /// Operator-assigned leadership priority for this agent. Lower is
    /// stronger.
    pub my_rank: i32,
    /// Address of the message bus.
    pub bus_url: String,
    /// Observe-only mode for tests: subscriptions drop all traffic.
    pub deaf: bool,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        MembershipConfig {
            beat_duration: DEFAULT_BEAT,
            lease_duration: DEFAULT_BEAT * DEFAULT_LEASE_BEATS,
            max_clock_skew: DEFAULT_MAX_CLOCK_SKEW,
            history_count: DEFAULT_HISTORY_COUNT,
            my_rank: 0,
            bus_url: String::new(),
            deaf: false,
        }
    }
}

impl MembershipConfig {
    /// Replace degenerate values with their defaults.
    pub(crate) fn normalized(mut self) -> Self {
        if self.beat_duration.is_zero() {
            self.beat_duration = DEFAULT_BEAT;
        }
        if self.lease_duration.is_zero() {
            self.lease_duration = self.beat_duration * DEFAULT_LEASE_BEATS;
        }
        if self.history_count == 0 {
            self.history_count = DEFAULT_HISTORY_COUNT;
        }
        self
    }
}
