//! Per-connection session state machine.
//!
//! ```text
//!  socket open                 Connect accepted              close / idle / slow
//! ─────────────► AwaitingConnectMessage ──────────► Connected ─────────────────► AwaitingRemoval
//!                     │ start timeout / close                                         │ grace elapsed
//!                     ▼                                                               ▼
//!                 discarded                                                        removed
//! ```
//!
//! Each state is its own struct and transitions consume the source state,
//! so a session can never move backwards. A reconnect under the same key
//! creates a new session that inherits the presence id of the old one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::RoomConfig;
use crate::diff::Patch;
use crate::protocol::DataMessage;
use crate::record::{RecordId, SchemaDescriptor};
use crate::socket::RoomSocket;
use serde_json::Value;

/// What a resumed session carries over from the one it replaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resume {
    pub presence_id: Option<RecordId>,
}

/// Socket open, handshake not yet received.
pub struct AwaitingConnect {
    pub socket: Arc<dyn RoomSocket>,
    pub started_at: Instant,
    pub resume: Option<Resume>,
}

impl AwaitingConnect {
    /// Handshake accepted; the session is now caught up to `clock`.
    pub fn accept(self, schema: SchemaDescriptor, clock: u64, now: Instant) -> Connected {
        Connected {
            socket: self.socket,
            schema,
            last_interaction: now,
            debounce_deadline: None,
            window_opened_at: now,
            outstanding: Vec::new(),
            last_sent_clock: clock,
        }
    }
}

/// The outstanding queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOverflow;

/// Handshake done, exchanging pushes and patches.
pub struct Connected {
    pub socket: Arc<dyn RoomSocket>,
    /// Schema the client reported at handshake.
    pub schema: SchemaDescriptor,
    pub last_interaction: Instant,
    /// When the open debounce window closes; `None` when no window is open.
    debounce_deadline: Option<Instant>,
    window_opened_at: Instant,
    outstanding: Vec<DataMessage>,
    /// Clock of the newest data handed to this session.
    last_sent_clock: u64,
}

impl Connected {
    pub fn touch(&mut self, now: Instant) {
        self.last_interaction = now;
    }

    pub fn last_sent_clock(&self) -> u64 {
        self.last_sent_clock
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn debounce_deadline(&self) -> Option<Instant> {
        self.debounce_deadline
    }

    /// Build the next patch for this session, starting at its last clock.
    pub fn patch_to(&self, to_clock: u64, changes: crate::diff::RecordsDiff) -> Patch {
        Patch::new(self.last_sent_clock, to_clock, changes)
    }

    /// Queue a data message.
    ///
    /// Outside a debounce window the message is returned for immediate
    /// sending and a window opens. Inside a window it is held back and the
    /// window is extended, never past `max_batch_delay` from its opening.
    pub fn enqueue(
        &mut self,
        msg: DataMessage,
        now: Instant,
        config: &RoomConfig,
    ) -> Result<Option<Vec<DataMessage>>, QueueOverflow> {
        match &msg {
            DataMessage::Patch(patch) => self.last_sent_clock = patch.to_clock,
            DataMessage::PushResult(result) => self.last_sent_clock = result.clock,
        }

        if self.debounce_deadline.is_none() {
            self.window_opened_at = now;
            self.debounce_deadline = Some(now + config.debounce_interval);
            return Ok(Some(vec![msg]));
        }

        if self.outstanding.len() >= config.max_outstanding_messages {
            return Err(QueueOverflow);
        }
        self.outstanding.push(msg);
        let extended = now + config.debounce_interval;
        let cap = self.window_opened_at + config.max_batch_delay;
        self.debounce_deadline = Some(extended.min(cap));
        Ok(None)
    }

    /// Close the debounce window if it is due.
    ///
    /// Returns the coalesced batch when anything was held back; in that case
    /// a fresh window opens so the next message is batched as well.
    pub fn flush_due(&mut self, now: Instant, debounce: Duration) -> Option<Vec<DataMessage>> {
        match self.debounce_deadline {
            Some(deadline) if deadline <= now => {}
            _ => return None,
        }
        if self.outstanding.is_empty() {
            self.debounce_deadline = None;
            return None;
        }
        self.window_opened_at = now;
        self.debounce_deadline = Some(now + debounce);
        Some(coalesce(std::mem::take(&mut self.outstanding)))
    }

    /// Drop the connection. Pending outbound work is discarded.
    pub fn cancel(self, now: Instant) -> AwaitingRemoval {
        self.socket.close();
        AwaitingRemoval {
            cancelled_at: now,
        }
    }
}

/// Merge runs of adjacent patches into single patches.
pub fn coalesce(messages: Vec<DataMessage>) -> Vec<DataMessage> {
    let mut out: Vec<DataMessage> = Vec::with_capacity(messages.len());
    for msg in messages {
        match (out.last_mut(), msg) {
            (Some(DataMessage::Patch(prev)), DataMessage::Patch(next)) => prev.absorb(next),
            (_, msg) => out.push(msg),
        }
    }
    out
}

/// Connection lost; waiting to see if the client comes back.
pub struct AwaitingRemoval {
    pub cancelled_at: Instant,
}

pub enum SessionState {
    AwaitingConnectMessage(AwaitingConnect),
    Connected(Connected),
    AwaitingRemoval(AwaitingRemoval),
}

/// Timer that has run out for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// No handshake within the start timeout.
    StartTimeout,
    /// Connected but silent for the idle timeout.
    Idle,
    /// Removal grace period elapsed.
    RemovalGrace,
}

pub struct Session {
    pub key: String,
    /// Id of this session's presence record, known once connected (or
    /// inherited on resume).
    pub presence_id: Option<RecordId>,
    /// Opaque data the host attached when the socket opened, e.g. the
    /// remote address or an authenticated user. Kept across resumes.
    pub meta: Value,
    pub state: SessionState,
}

impl Session {
    /// A session for a freshly opened socket.
    pub fn awaiting(
        key: impl Into<String>,
        socket: Arc<dyn RoomSocket>,
        now: Instant,
        resume: Option<Resume>,
    ) -> Self {
        Self {
            key: key.into(),
            presence_id: resume.as_ref().and_then(|r| r.presence_id.clone()),
            meta: Value::Null,
            state: SessionState::AwaitingConnectMessage(AwaitingConnect {
                socket,
                started_at: now,
                resume,
            }),
        }
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = meta;
        self
    }

    /// The resume this session would hand to a socket replacing it.
    ///
    /// A session still waiting for its handshake passes on whatever it
    /// inherited itself; it was never live, so it is not a predecessor.
    pub fn resume_for_successor(&self) -> Option<Resume> {
        match &self.state {
            SessionState::AwaitingConnectMessage(waiting) => waiting.resume.clone(),
            SessionState::Connected(_) | SessionState::AwaitingRemoval(_) => Some(Resume {
                presence_id: self.presence_id.clone(),
            }),
        }
    }

    pub fn state_name(&self) -> &'static str {
        match self.state {
            SessionState::AwaitingConnectMessage(_) => "awaiting-connect-message",
            SessionState::Connected(_) => "connected",
            SessionState::AwaitingRemoval(_) => "awaiting-removal",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, SessionState::Connected(_))
    }

    pub fn is_awaiting_removal(&self) -> bool {
        matches!(self.state, SessionState::AwaitingRemoval(_))
    }

    pub fn connected(&self) -> Option<&Connected> {
        match &self.state {
            SessionState::Connected(connected) => Some(connected),
            _ => None,
        }
    }

    pub fn connected_mut(&mut self) -> Option<&mut Connected> {
        match &mut self.state {
            SessionState::Connected(connected) => Some(connected),
            _ => None,
        }
    }

    /// The live socket, if the session still has one.
    pub fn socket(&self) -> Option<&Arc<dyn RoomSocket>> {
        match &self.state {
            SessionState::AwaitingConnectMessage(waiting) => Some(&waiting.socket),
            SessionState::Connected(connected) => Some(&connected.socket),
            SessionState::AwaitingRemoval(_) => None,
        }
    }

    /// Whether a removed-in-waiting session can still be resumed at `now`.
    pub fn resumable(&self, now: Instant, config: &RoomConfig) -> bool {
        match &self.state {
            SessionState::AwaitingRemoval(removal) => {
                now.saturating_duration_since(removal.cancelled_at) < config.removal_grace
            }
            _ => false,
        }
    }

    /// Which timer, if any, has run out.
    pub fn expiry(&self, now: Instant, config: &RoomConfig) -> Option<Expiry> {
        let (since, limit, expiry) = match &self.state {
            SessionState::AwaitingConnectMessage(waiting) => {
                (waiting.started_at, config.session_start_timeout, Expiry::StartTimeout)
            }
            SessionState::Connected(connected) => {
                (connected.last_interaction, config.idle_timeout, Expiry::Idle)
            }
            SessionState::AwaitingRemoval(removal) => {
                (removal.cancelled_at, config.removal_grace, Expiry::RemovalGrace)
            }
        };
        (now.saturating_duration_since(since) >= limit).then_some(expiry)
    }

    /// Connected → AwaitingRemoval; any other state is returned unchanged.
    pub fn cancel(self, now: Instant) -> Self {
        match self.state {
            SessionState::Connected(connected) => Self {
                state: SessionState::AwaitingRemoval(connected.cancel(now)),
                ..self
            },
            state => Self { state, ..self },
        }
    }
}
