//! A room: the single authority for one shared document.
//!
//! ```text
//!   socket A ──┐                        ┌──► session A  (PushResult)
//!              ├─► Room ─► RecordStore ─┤
//!   socket B ──┘    │                   └──► session B  (Patch, debounced)
//!                   └─ presence records (not durable)
//! ```
//!
//! The room is a plain synchronous state machine. Callers serialize access
//! (see [`RoomRegistry`](crate::registry::RoomRegistry)), so every accepted
//! push is applied and clock-stamped strictly one at a time. Outbound data
//! never blocks this path: it is queued per session and flushed on `tick`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use serde_json::Value;
use thiserror::Error;

use crate::config::RoomConfig;
use crate::diff::{Patch, RecordsDiff};
use crate::protocol::{
    ClientMessage, ConnectAccepted, ConnectRequest, DataMessage, Hydration, Mutation, ProtocolError,
    Push, PushResult, RejectReason, RejectedMutation, ServerMessage,
};
use crate::record::{Record, RecordId, ValidationError, PRESENCE_TYPE};
use crate::session::{Expiry, QueueOverflow, Resume, Session, SessionState};
use crate::socket::{RoomSocket, SocketError};
use crate::store::{ApplyOutcome, RecordStore, RoomSnapshot};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("connection rejected: {0}")]
    Rejected(#[from] RejectReason),
}

/// Why a connected session moved to awaiting-removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCause {
    SocketClosed,
    IdleTimeout,
    /// Outstanding queue overflowed or the socket could not keep up.
    SlowConsumer,
}

/// Why a session left the room for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    StartTimeout,
    ClosedBeforeConnect,
    RemovalGrace,
    Rejected,
    ProtocolError,
    /// Administrative force-disconnect.
    Kicked,
}

/// Session lifecycle transitions, drained by the host for logging/metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connected { session_key: String, resumed: bool },
    Cancelled { session_key: String, cause: CancelCause },
    Removed { session_key: String, cause: RemovalCause },
}

fn send_message(socket: &dyn RoomSocket, msg: &ServerMessage) -> Result<(), SocketError> {
    match msg.encode() {
        Ok(frame) => socket.send(frame),
        Err(e) => {
            log::error!("Failed to encode outbound message: {e}");
            Ok(())
        }
    }
}

pub struct Room {
    document_id: String,
    config: RoomConfig,
    store: RecordStore,
    /// Presence records, keyed by presence id.
    presence: BTreeMap<RecordId, Record>,
    sessions: HashMap<String, Session>,
    /// Keys removed administratively; they may not reconnect.
    forbidden: HashSet<String>,
    events: Vec<LifecycleEvent>,
}

impl Room {
    pub fn new(document_id: impl Into<String>, config: RoomConfig) -> Self {
        let store = RecordStore::new(config.max_tombstones, config.tombstone_prune_buffer);
        Self::with_store(document_id.into(), config, store)
    }

    /// Recreate a room from the durable state of a previous lifetime.
    pub fn from_snapshot(document_id: impl Into<String>, config: RoomConfig, snapshot: RoomSnapshot) -> Self {
        let store = RecordStore::from_snapshot(snapshot, config.max_tombstones, config.tombstone_prune_buffer);
        Self::with_store(document_id.into(), config, store)
    }

    fn with_store(document_id: String, config: RoomConfig, store: RecordStore) -> Self {
        Self {
            document_id,
            config,
            store,
            presence: BTreeMap::new(),
            sessions: HashMap::new(),
            forbidden: HashSet::new(),
            events: Vec::new(),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    pub fn clock(&self) -> u64 {
        self.store.clock()
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn record(&self, id: &RecordId) -> Option<&Record> {
        self.store.get(id)
    }

    pub fn presence_record(&self, id: &RecordId) -> Option<&Record> {
        self.presence.get(id)
    }

    pub fn presence_count(&self) -> usize {
        self.presence.len()
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        self.store.snapshot()
    }

    /// All sessions, including those awaiting removal.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn connected_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_connected()).count()
    }

    /// No sessions left at all; the registry may destroy the room.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn session_state(&self, session_key: &str) -> Option<&'static str> {
        self.sessions.get(session_key).map(Session::state_name)
    }

    pub fn session(&self, session_key: &str) -> Option<&Session> {
        self.sessions.get(session_key)
    }

    pub fn take_events(&mut self) -> Vec<LifecycleEvent> {
        std::mem::take(&mut self.events)
    }

    // ─── Transport entry points ──────────────────────────────────

    /// A socket opened for `session_key`.
    ///
    /// If the key still has a session (live, or awaiting removal within its
    /// grace period) the new one replaces it and keeps its presence id.
    pub fn handle_new_session(&mut self, session_key: &str, socket: Arc<dyn RoomSocket>, now: Instant) {
        self.handle_new_session_with_meta(session_key, socket, Value::Null, now);
    }

    /// Like [`Room::handle_new_session`], attaching host data to the session.
    ///
    /// A null `meta` keeps whatever the replaced session carried.
    pub fn handle_new_session_with_meta(
        &mut self,
        session_key: &str,
        socket: Arc<dyn RoomSocket>,
        meta: Value,
        now: Instant,
    ) {
        let expired = self
            .sessions
            .get(session_key)
            .is_some_and(|s| s.is_awaiting_removal() && !s.resumable(now, &self.config));
        if expired {
            self.remove_entirely(session_key, now, RemovalCause::RemovalGrace);
        }
        let (resume, inherited_meta) = match self.sessions.get(session_key) {
            Some(existing) => {
                if let Some(old) = existing.socket() {
                    old.close();
                }
                log::debug!(
                    "Session {session_key} in room {} reopened from {}",
                    self.document_id,
                    existing.state_name()
                );
                (existing.resume_for_successor(), existing.meta.clone())
            }
            None => (None, Value::Null),
        };
        let meta = if meta.is_null() { inherited_meta } else { meta };
        log::debug!("Socket {} opened for session {session_key}", socket.id());
        self.sessions.insert(
            session_key.to_string(),
            Session::awaiting(session_key, socket, now, resume).with_meta(meta),
        );
    }

    /// Host data attached to `session_key`, `Value::Null` when none was given.
    pub fn session_meta(&self, session_key: &str) -> Option<&Value> {
        self.sessions.get(session_key).map(|s| &s.meta)
    }

    /// An inbound frame from `session_key`'s socket.
    ///
    /// Protocol errors terminate only this session; the error is returned
    /// for the host's logs.
    pub fn handle_message(&mut self, session_key: &str, bytes: &[u8], now: Instant) -> Result<(), RoomError> {
        match self.sessions.get(session_key) {
            None => return Err(ProtocolError::UnknownSession(session_key.to_string()).into()),
            Some(session) if session.is_awaiting_removal() => {
                log::trace!("Dropping frame for session {session_key} awaiting removal");
                return Ok(());
            }
            Some(_) => {}
        }

        let message = match ClientMessage::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                self.terminate(session_key, &e, now);
                return Err(e.into());
            }
        };
        log::trace!("{} from session {session_key}", message.kind());

        if let Some(connected) = self.sessions.get_mut(session_key).and_then(|s| s.connected_mut()) {
            connected.touch(now);
        }

        let result = match message {
            ClientMessage::Connect(request) => self.connect(session_key, request, now).map(|_| ()),
            ClientMessage::Push(push) => self.receive_push(session_key, push, now).map(|_| ()),
            ClientMessage::Ping => {
                self.pong(session_key, now);
                Ok(())
            }
        };
        if let Err(RoomError::Protocol(err)) = &result {
            self.terminate(session_key, err, now);
        }
        result
    }

    /// The transport for `socket_id` closed. Ignored if that socket no
    /// longer owns the session (it was replaced by a reconnect).
    pub fn handle_close(&mut self, session_key: &str, socket_id: uuid::Uuid, now: Instant) {
        let Some(session) = self.sessions.get(session_key) else {
            return;
        };
        if !session.socket().is_some_and(|s| s.id() == socket_id) {
            log::debug!("Ignoring close of stale socket {socket_id} for session {session_key}");
            return;
        }
        if session.is_connected() {
            self.cancel_session(session_key, CancelCause::SocketClosed, now);
        } else {
            self.remove_entirely(session_key, now, RemovalCause::ClosedBeforeConnect);
        }
    }

    /// Periodic sweep: expire timers and flush due debounce windows.
    pub fn tick(&mut self, now: Instant) -> Vec<LifecycleEvent> {
        let expired: Vec<(String, Expiry)> = self
            .sessions
            .iter()
            .filter_map(|(key, s)| s.expiry(now, &self.config).map(|e| (key.clone(), e)))
            .collect();
        for (key, expiry) in expired {
            match expiry {
                Expiry::StartTimeout => {
                    self.remove_entirely(&key, now, RemovalCause::StartTimeout);
                }
                Expiry::Idle => self.cancel_session(&key, CancelCause::IdleTimeout, now),
                Expiry::RemovalGrace => {
                    self.remove_entirely(&key, now, RemovalCause::RemovalGrace);
                }
            }
        }

        let connected: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_connected())
            .map(|(key, _)| key.clone())
            .collect();
        for key in connected {
            let Some(session) = self.sessions.get_mut(&key).and_then(|s| s.connected_mut()) else {
                continue;
            };
            if let Some(batch) = session.flush_due(now, self.config.debounce_interval) {
                let socket = session.socket.clone();
                self.send_frame(&key, &socket, ServerMessage::Data(batch), now);
            }
        }

        self.take_events()
    }

    /// Administrative force-disconnect. The key may not reconnect to this
    /// room instance.
    pub fn remove_session(&mut self, session_key: &str, now: Instant) -> bool {
        self.forbidden.insert(session_key.to_string());
        self.remove_entirely(session_key, now, RemovalCause::Kicked)
    }

    // ─── Handshake ───────────────────────────────────────────────

    /// Validate a handshake and move the session to connected.
    ///
    /// On rejection the client gets `RejectConnect` and the session is
    /// dropped without ever being registered as connected.
    pub fn connect(
        &mut self,
        session_key: &str,
        request: ConnectRequest,
        now: Instant,
    ) -> Result<ConnectAccepted, RoomError> {
        if request.session_key != session_key {
            return Err(ProtocolError::SessionKeyMismatch {
                expected: session_key.to_string(),
                got: request.session_key,
            }
            .into());
        }
        let session = self
            .sessions
            .remove(session_key)
            .ok_or_else(|| ProtocolError::UnknownSession(session_key.to_string()))?;
        let Session {
            key,
            presence_id: inherited,
            meta,
            state,
        } = session;
        let waiting = match state {
            SessionState::AwaitingConnectMessage(waiting) => waiting,
            state => {
                let session = Session {
                    key,
                    presence_id: inherited,
                    meta,
                    state,
                };
                let err = ProtocolError::UnexpectedMessage {
                    message: "connect",
                    state: session.state_name(),
                };
                self.sessions.insert(session_key.to_string(), session);
                return Err(err.into());
            }
        };

        if let Err(reason) = self.admit(session_key, &request) {
            // Best effort; the socket is closed either way.
            let _ = send_message(waiting.socket.as_ref(), &ServerMessage::RejectConnect { reason });
            waiting.socket.close();
            if let Some(old) = &inherited {
                self.drop_presence(old, now);
            }
            log::warn!("Rejected session {session_key} in room {}: {reason}", self.document_id);
            self.events.push(LifecycleEvent::Removed {
                session_key: key,
                cause: RemovalCause::Rejected,
            });
            return Err(reason.into());
        }

        let presence_id = RecordId::new(request.presence_id.clone());
        if let Err(err) = self.check_presence_id(session_key, &presence_id) {
            let _ = send_message(
                waiting.socket.as_ref(),
                &ServerMessage::Error {
                    message: err.to_string(),
                },
            );
            waiting.socket.close();
            if let Some(old) = &inherited {
                self.drop_presence(old, now);
            }
            log::warn!("Session {session_key} sent an invalid handshake: {err}");
            self.events.push(LifecycleEvent::Removed {
                session_key: key,
                cause: RemovalCause::ProtocolError,
            });
            return Err(err.into());
        }

        let resumed = waiting.resume.is_some();
        if let Some(old) = inherited.filter(|old| *old != presence_id) {
            self.drop_presence(&old, now);
        }

        let clock = self.store.clock();
        let accepted = ConnectAccepted {
            clock,
            schema_version: self.config.schema.version,
            resumed,
            hydration: self.hydration_for(resumed, request.last_known_clock, &presence_id),
        };
        let connected = waiting.accept(request.schema, clock, now);
        let socket = connected.socket.clone();
        self.sessions.insert(
            key.clone(),
            Session {
                key,
                presence_id: Some(presence_id),
                meta,
                state: SessionState::Connected(connected),
            },
        );
        log::info!(
            "Session {session_key} connected to room {} at clock {clock} ({}{})",
            self.document_id,
            match &accepted.hydration {
                Hydration::Snapshot { .. } => "snapshot",
                Hydration::Incremental(_) => "incremental",
            },
            if resumed { ", resumed" } else { "" }
        );
        self.events.push(LifecycleEvent::Connected {
            session_key: session_key.to_string(),
            resumed,
        });

        self.send_frame(session_key, &socket, ServerMessage::Connected(accepted.clone()), now);
        Ok(accepted)
    }

    fn admit(&self, session_key: &str, request: &ConnectRequest) -> Result<(), RejectReason> {
        if self.forbidden.contains(session_key) {
            return Err(RejectReason::Forbidden);
        }
        self.config
            .schema
            .check_client(&request.schema)
            .map_err(RejectReason::SchemaMismatch)?;
        let live = self
            .sessions
            .iter()
            .filter(|(key, s)| key.as_str() != session_key && s.is_connected())
            .count();
        if live >= self.config.max_sessions {
            return Err(RejectReason::RoomFull);
        }
        Ok(())
    }

    fn check_presence_id(&self, session_key: &str, presence_id: &RecordId) -> Result<(), ProtocolError> {
        let invalid = |reason| ProtocolError::InvalidPresenceId {
            presence_id: presence_id.to_string(),
            reason,
        };
        if presence_id.as_str().is_empty() {
            return Err(invalid("empty"));
        }
        if self.store.get(presence_id).is_some() {
            return Err(invalid("collides with a document record"));
        }
        let taken = self
            .sessions
            .iter()
            .any(|(key, s)| key.as_str() != session_key && s.presence_id.as_ref() == Some(presence_id));
        if taken {
            return Err(invalid("owned by another session"));
        }
        Ok(())
    }

    fn is_presence_id(&self, id: &RecordId) -> bool {
        self.presence.contains_key(id)
            || self
                .sessions
                .values()
                .any(|s| s.presence_id.as_ref() == Some(id))
    }

    /// Full snapshot unless a resumed session's clock is inside the
    /// catch-up window. Other sessions' presence is always sent in full.
    fn hydration_for(&self, resumed: bool, last_known_clock: Option<u64>, own_presence: &RecordId) -> Hydration {
        let presence = self
            .presence
            .values()
            .filter(|r| &r.id != own_presence)
            .cloned();
        let since = last_known_clock.filter(|clock| resumed && self.store.can_catch_up(*clock));
        match since {
            Some(since) => {
                let mut changes = self.store.changes_since(since);
                for record in presence {
                    changes.put(record);
                }
                Hydration::Incremental(Patch::new(since, self.store.clock(), changes))
            }
            None => Hydration::Snapshot {
                records: self.store.records().values().cloned().chain(presence).collect(),
            },
        }
    }

    // ─── Pushes ──────────────────────────────────────────────────

    /// Apply a client's push and fan the effective changes out to every
    /// other connected session.
    pub fn receive_push(&mut self, session_key: &str, push: Push, now: Instant) -> Result<PushResult, RoomError> {
        if push.session_key != session_key {
            return Err(ProtocolError::SessionKeyMismatch {
                expected: session_key.to_string(),
                got: push.session_key,
            }
            .into());
        }
        let presence_id = match self.sessions.get_mut(session_key) {
            None => return Err(ProtocolError::UnknownSession(session_key.to_string()).into()),
            Some(session) => {
                let state = session.state_name();
                match session.connected_mut() {
                    Some(connected) => connected.touch(now),
                    None => {
                        return Err(ProtocolError::UnexpectedMessage {
                            message: "push",
                            state,
                        }
                        .into())
                    }
                }
                session.presence_id.clone()
            }
        };

        // Presence ids and document ids share one namespace on every replica.
        let (reserved, mutations): (Vec<Mutation>, Vec<Mutation>) = push
            .mutations
            .into_iter()
            .partition(|m| self.is_presence_id(&m.record_id));
        let mut rejected: Vec<RejectedMutation> = reserved
            .into_iter()
            .map(|m| RejectedMutation {
                current: if presence_id.as_ref() == Some(&m.record_id) {
                    None
                } else {
                    self.presence.get(&m.record_id).cloned()
                },
                reason: ValidationError::ReservedId(m.record_id.to_string()),
                record_id: m.record_id,
            })
            .collect();
        let ApplyOutcome {
            mut diff,
            rejected: invalid,
            ..
        } = self.store.apply(&self.config.schema, mutations);
        rejected.extend(invalid);

        if let (Some(content), Some(presence_id)) = (push.presence, presence_id) {
            match self.config.schema.validate_presence(&content) {
                Err(reason) => rejected.push(RejectedMutation {
                    current: self.presence.get(&presence_id).cloned(),
                    record_id: presence_id,
                    reason,
                }),
                Ok(()) => {
                    let unchanged = self
                        .presence
                        .get(&presence_id)
                        .is_some_and(|r| r.content == content);
                    if !unchanged {
                        let clock = if diff.is_empty() {
                            self.store.advance()
                        } else {
                            self.store.clock()
                        };
                        let record = Record::new(presence_id.clone(), PRESENCE_TYPE, content, clock);
                        self.presence.insert(presence_id, record.clone());
                        diff.put(record);
                    }
                }
            }
        }

        let clock = self.store.clock();
        if !rejected.is_empty() {
            log::warn!(
                "Room {} dropped {} invalid mutation(s) from session {session_key}",
                self.document_id,
                rejected.len()
            );
        }
        log::debug!(
            "Push {} from {session_key} applied {} change(s) at clock {clock}",
            push.push_id,
            diff.len()
        );

        let result = PushResult {
            push_id: push.push_id,
            clock,
            rejected,
        };
        self.send_data(session_key, DataMessage::PushResult(result.clone()), now);
        if !diff.is_empty() {
            self.broadcast(diff, clock, Some(session_key), now);
        }
        Ok(result)
    }

    // ─── Outbound ────────────────────────────────────────────────

    fn broadcast(&mut self, changes: RecordsDiff, clock: u64, except: Option<&str>, now: Instant) {
        let targets: Vec<String> = self
            .sessions
            .iter()
            .filter(|(key, s)| s.is_connected() && Some(key.as_str()) != except)
            .map(|(key, _)| key.clone())
            .collect();
        for key in targets {
            let Some(connected) = self.sessions.get(&key).and_then(|s| s.connected()) else {
                continue;
            };
            let patch = connected.patch_to(clock, changes.clone());
            self.send_data(&key, DataMessage::Patch(patch), now);
        }
    }

    fn send_data(&mut self, session_key: &str, msg: DataMessage, now: Instant) {
        let Some(connected) = self.sessions.get_mut(session_key).and_then(|s| s.connected_mut()) else {
            return;
        };
        match connected.enqueue(msg, now, &self.config) {
            Ok(Some(batch)) => {
                let socket = connected.socket.clone();
                self.send_frame(session_key, &socket, ServerMessage::Data(batch), now);
            }
            Ok(None) => {}
            Err(QueueOverflow) => {
                log::warn!(
                    "Session {session_key} exceeded {} outstanding messages",
                    self.config.max_outstanding_messages
                );
                self.cancel_session(session_key, CancelCause::SlowConsumer, now);
            }
        }
    }

    fn send_frame(&mut self, session_key: &str, socket: &Arc<dyn RoomSocket>, msg: ServerMessage, now: Instant) {
        match send_message(socket.as_ref(), &msg) {
            Ok(()) => {}
            Err(SocketError::Full) => self.cancel_session(session_key, CancelCause::SlowConsumer, now),
            Err(SocketError::Closed) => self.cancel_session(session_key, CancelCause::SocketClosed, now),
        }
    }

    fn pong(&mut self, session_key: &str, now: Instant) {
        if let Some(socket) = self.sessions.get(session_key).and_then(|s| s.socket().cloned()) {
            self.send_frame(session_key, &socket, ServerMessage::Pong, now);
        }
    }

    // ─── Removal ─────────────────────────────────────────────────

    fn cancel_session(&mut self, session_key: &str, cause: CancelCause, now: Instant) {
        let Some(session) = self.sessions.remove(session_key) else {
            return;
        };
        let was_connected = session.is_connected();
        self.sessions.insert(session_key.to_string(), session.cancel(now));
        if was_connected {
            log::info!(
                "Session {session_key} in room {} awaiting removal ({cause:?})",
                self.document_id
            );
            self.events.push(LifecycleEvent::Cancelled {
                session_key: session_key.to_string(),
                cause,
            });
        }
    }

    fn remove_entirely(&mut self, session_key: &str, now: Instant, cause: RemovalCause) -> bool {
        let Some(session) = self.sessions.remove(session_key) else {
            return false;
        };
        if let Some(socket) = session.socket() {
            socket.close();
        }
        if let Some(presence_id) = &session.presence_id {
            self.drop_presence(presence_id, now);
        }
        log::info!(
            "Session {session_key} removed from room {} ({cause:?})",
            self.document_id
        );
        self.events.push(LifecycleEvent::Removed {
            session_key: session_key.to_string(),
            cause,
        });
        true
    }

    fn terminate(&mut self, session_key: &str, err: &ProtocolError, now: Instant) {
        let Some(socket) = self.sessions.get(session_key).and_then(|s| s.socket().cloned()) else {
            return;
        };
        log::warn!("Protocol error from session {session_key}: {err}");
        let _ = send_message(
            socket.as_ref(),
            &ServerMessage::Error {
                message: err.to_string(),
            },
        );
        self.remove_entirely(session_key, now, RemovalCause::ProtocolError);
    }

    /// Delete a presence record and tell everyone else it is gone.
    fn drop_presence(&mut self, presence_id: &RecordId, now: Instant) {
        if self.presence.remove(presence_id).is_none() {
            return;
        }
        let clock = self.store.advance();
        let mut diff = RecordsDiff::new();
        diff.remove(presence_id.clone());
        self.broadcast(diff, clock, None, now);
    }
}
