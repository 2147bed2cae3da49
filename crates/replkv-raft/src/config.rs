//! Raft configuration (timeouts, limits, tuning parameters).

use std::time::Duration;

/// Raft configuration.
///
/// Controls election timeouts, heartbeat intervals, snapshot triggers, and other tuning parameters.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Numeric node id used in WAL observability events (default: 0).
    pub node_tag: u32,

    /// Heartbeat interval (leader → followers).
    ///
    /// Leader sends AppendEntries (heartbeat or real entries) at this interval.
    /// Must be < election_timeout_min to prevent spurious elections.
    ///
    /// Default: 150ms
    pub heartbeat_interval: Duration,

    /// Minimum election timeout (follower → candidate).
    ///
    /// If follower doesn't hear from leader within this duration, it starts election.
    /// Randomized between [min, max] to prevent split votes.
    ///
    /// Default: 300ms
    pub election_timeout_min: Duration,

    /// Maximum election timeout.
    ///
    /// Also the window in which a leader must hear from a quorum, or step down.
    ///
    /// Default: 600ms
    pub election_timeout_max: Duration,

    /// Per-RPC deadline for RequestVote, AppendEntries and InstallSnapshot.
    ///
    /// Default: 100ms
    pub rpc_timeout: Duration,

    /// Maximum number of entries per AppendEntries RPC.
    ///
    /// Default: 1000 entries
    pub max_entries_per_append: usize,

    /// Snapshot trigger: applied entries since the last snapshot.
    ///
    /// Default: 8192 entries
    pub snapshot_threshold: u64,

    /// Entries kept in the log behind a snapshot so that slightly lagging
    /// followers can catch up without a snapshot transfer.
    ///
    /// Default: 1024 entries
    pub trailing_logs: u64,

    /// Snapshots kept on disk.
    ///
    /// Default: 1
    pub snapshot_retain: usize,

    /// Commit timeout (how long a write waits to be applied).
    ///
    /// Default: 5000ms
    pub commit_timeout: Duration,

    /// Maximum entries applied to the state machine per batch.
    ///
    /// Default: 256 commands
    pub apply_batch_size: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_tag: 0,
            heartbeat_interval: Duration::from_millis(150),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(600),
            rpc_timeout: Duration::from_millis(100),

            max_entries_per_append: 1000,

            snapshot_threshold: 8192,
            trailing_logs: 1024,
            snapshot_retain: 1,

            commit_timeout: Duration::from_millis(5000),
            apply_batch_size: 256,
        }
    }
}

impl RaftConfig {
    /// Validate configuration (ensure invariants hold).
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(format!(
                "heartbeat_interval ({:?}) must be < election_timeout_min ({:?})",
                self.heartbeat_interval, self.election_timeout_min
            ));
        }

        if self.election_timeout_min >= self.election_timeout_max {
            return Err(format!(
                "election_timeout_min ({:?}) must be < election_timeout_max ({:?})",
                self.election_timeout_min, self.election_timeout_max
            ));
        }

        if self.rpc_timeout.is_zero() || self.rpc_timeout >= self.election_timeout_min {
            return Err(format!(
                "rpc_timeout ({:?}) must be > 0 and < election_timeout_min ({:?})",
                self.rpc_timeout, self.election_timeout_min
            ));
        }

        if self.max_entries_per_append == 0 {
            return Err("max_entries_per_append must be > 0".to_string());
        }

        if self.snapshot_threshold == 0 {
            return Err("snapshot_threshold must be > 0".to_string());
        }

        if self.snapshot_retain == 0 {
            return Err("snapshot_retain must be >= 1".to_string());
        }

        if self.apply_batch_size == 0 {
            return Err("apply_batch_size must be > 0".to_string());
        }

        Ok(())
    }

    /// Get randomized election timeout.
    ///
    /// Returns a random duration between [election_timeout_min, election_timeout_max].
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        let random_ms = rand::thread_rng().gen_range(min_ms..=max_ms);
        Duration::from_millis(random_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = RaftConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_heartbeat_too_long() {
        let mut config = RaftConfig::default();
        config.heartbeat_interval = Duration::from_millis(400);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_election_timeout_range() {
        let mut config = RaftConfig::default();
        config.election_timeout_min = Duration::from_millis(700);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_rpc_timeout() {
        let mut config = RaftConfig::default();
        config.rpc_timeout = Duration::from_millis(300);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_limits_rejected() {
        let mut config = RaftConfig::default();
        config.snapshot_retain = 0;
        assert!(config.validate().is_err());

        let mut config = RaftConfig::default();
        config.max_entries_per_append = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_random_election_timeout_in_range() {
        let config = RaftConfig::default();
        for _ in 0..100 {
            let timeout = config.random_election_timeout();
            assert!(timeout >= config.election_timeout_min);
            assert!(timeout <= config.election_timeout_max);
        }
    }
}
