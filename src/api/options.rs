use std::convert::TryFrom;
use std::num::NonZeroUsize;
use tokio::time::Duration;

/// Tuning knobs for a node. Every field is optional; unset fields take the defaults below.
#[derive(Clone, Debug, Default)]
pub struct RaftOptions {
    pub leader_heartbeat_duration: Option<Duration>,
    pub follower_min_timeout: Option<Duration>,
    pub follower_max_timeout: Option<Duration>,
    pub leader_append_entries_timeout: Option<Duration>,
    /// Applied entries between two snapshots.
    pub snapshot_threshold: Option<u64>,
    pub retained_snapshots: Option<usize>,
    pub key_gc_interval: Option<Duration>,
    /// Rotate the at-rest key this often. Unset means rotation only happens on request.
    pub key_rotation_interval: Option<Duration>,
    /// Writes admitted concurrently before new ones are shed with a retry hint.
    pub max_in_flight_writes: Option<usize>,
    pub rate_limit_retry_after: Option<Duration>,
    /// How long a proposer waits for its entry to be applied.
    pub write_apply_timeout: Option<Duration>,
    /// Workers restoring a snapshot. Defaults to the available parallelism.
    pub restore_workers: Option<NonZeroUsize>,
}

#[derive(Clone, Debug)]
pub(super) struct RaftOptionsValidated {
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
    pub leader_append_entries_timeout: Duration,
    pub snapshot_threshold: u64,
    pub retained_snapshots: usize,
    pub key_gc_interval: Duration,
    pub key_rotation_interval: Option<Duration>,
    pub max_in_flight_writes: usize,
    pub rate_limit_retry_after: Duration,
    pub write_apply_timeout: Duration,
    pub restore_workers: NonZeroUsize,
}

impl RaftOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.leader_heartbeat_duration >= self.follower_min_timeout {
            return Err("follower_min_timeout must exceed leader_heartbeat_duration");
        }
        if self.follower_min_timeout >= self.follower_max_timeout {
            return Err("follower_min_timeout must be below follower_max_timeout");
        }
        if self.leader_append_entries_timeout >= self.follower_min_timeout {
            return Err("leader_append_entries_timeout must be below follower_min_timeout");
        }
        if self.snapshot_threshold == 0 {
            return Err("snapshot_threshold must be at least 1");
        }
        if self.retained_snapshots == 0 {
            return Err("retained_snapshots must be at least 1");
        }
        if self.max_in_flight_writes == 0 {
            return Err("max_in_flight_writes must be at least 1");
        }
        if self.key_gc_interval == Duration::from_secs(0) {
            return Err("key_gc_interval must be non-zero");
        }
        if self.key_rotation_interval == Some(Duration::from_secs(0)) {
            return Err("key_rotation_interval must be non-zero");
        }

        Ok(())
    }
}

impl TryFrom<RaftOptions> for RaftOptionsValidated {
    type Error = &'static str;

    fn try_from(options: RaftOptions) -> Result<Self, Self::Error> {
        let values = RaftOptionsValidated {
            leader_heartbeat_duration: options.leader_heartbeat_duration.unwrap_or(Duration::from_millis(100)),
            follower_min_timeout: options.follower_min_timeout.unwrap_or(Duration::from_millis(500)),
            follower_max_timeout: options.follower_max_timeout.unwrap_or(Duration::from_millis(1500)),
            leader_append_entries_timeout: options
                .leader_append_entries_timeout
                .unwrap_or(Duration::from_millis(300)),
            snapshot_threshold: options.snapshot_threshold.unwrap_or(1024),
            retained_snapshots: options.retained_snapshots.unwrap_or(2),
            key_gc_interval: options.key_gc_interval.unwrap_or(Duration::from_secs(60)),
            key_rotation_interval: options.key_rotation_interval,
            max_in_flight_writes: options.max_in_flight_writes.unwrap_or(256),
            rate_limit_retry_after: options.rate_limit_retry_after.unwrap_or(Duration::from_millis(500)),
            write_apply_timeout: options.write_apply_timeout.unwrap_or(Duration::from_secs(5)),
            restore_workers: options.restore_workers.unwrap_or_else(crate::snapshot::default_workers),
        };

        values.validate()?;
        Ok(values)
    }
}
