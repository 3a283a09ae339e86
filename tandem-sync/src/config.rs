//! Room tuning knobs.

use std::time::Duration;

use crate::record::Schema;

/// How long a socket may stay open without sending its handshake.
pub const SESSION_START_WAIT_TIME: Duration = Duration::from_secs(10);
/// How long a connected session may go without any inbound traffic.
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(20);
/// Grace period during which a dropped session can be resumed.
pub const SESSION_REMOVAL_WAIT_TIME: Duration = Duration::from_secs(10);
/// One frame at 60fps.
pub const DATA_MESSAGE_DEBOUNCE: Duration = Duration::from_millis(16);

/// Per-room configuration.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Record types and accepted client schema versions
    pub schema: Schema,
    pub session_start_timeout: Duration,
    pub idle_timeout: Duration,
    pub removal_grace: Duration,
    /// Quiet period that closes a debounce window
    pub debounce_interval: Duration,
    /// Upper bound on how long a debounce window may be extended
    pub max_batch_delay: Duration,
    /// Outstanding data messages per session before it is dropped as too slow
    pub max_outstanding_messages: usize,
    /// Live (not awaiting removal) sessions per room
    pub max_sessions: usize,
    /// Tombstones kept for incremental catch-up
    pub max_tombstones: usize,
    /// Extra tombstones dropped per prune so pruning is not per-delete
    pub tombstone_prune_buffer: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            schema: Schema::default(),
            session_start_timeout: SESSION_START_WAIT_TIME,
            idle_timeout: SESSION_IDLE_TIMEOUT,
            removal_grace: SESSION_REMOVAL_WAIT_TIME,
            debounce_interval: DATA_MESSAGE_DEBOUNCE,
            max_batch_delay: DATA_MESSAGE_DEBOUNCE * 4,
            max_outstanding_messages: 512,
            max_sessions: 100,
            max_tombstones: 3000,
            tombstone_prune_buffer: 300,
        }
    }
}

impl RoomConfig {
    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }
}
