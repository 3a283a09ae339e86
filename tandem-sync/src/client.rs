//! WebSocket sync client for a room.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect with catch-up)
//! - Optimistic local pushes, settled by the room's `PushResult`
//! - Presence updates
//! - A local [`ReplicaStore`] kept in step with the room
//!
//! Pushes made while disconnected stay pending and are replayed, in order,
//! once the next handshake is accepted.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::diff::ReplicaStore;
use crate::protocol::{
    ClientMessage, ConnectRequest, DataMessage, Hydration, Mutation, ProtocolError, Push, PushResult,
    RejectReason, ServerMessage,
};
use crate::record::{Record, RecordContent, RecordId, Schema, SchemaDescriptor};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Handshake accepted and the replica hydrated
    Connected { clock: u64, resumed: bool },
    /// Handshake refused; the socket will close
    Rejected(RejectReason),
    /// Changes from other sessions applied to the replica
    RemoteChanges { clock: u64, changed: usize },
    /// One of our pushes was committed
    PushSettled {
        push_id: u64,
        clock: u64,
        rejected: Vec<RecordId>,
    },
    Pong,
    /// The room dropped us for a protocol violation
    ServerError(String),
    /// Connection lost
    Disconnected,
}

/// Replica plus the pushes the room has not yet acknowledged.
struct ClientShared {
    session_key: String,
    replica: ReplicaStore,
    /// Ordered by push id, which is also send order.
    pending: BTreeMap<u64, Vec<Mutation>>,
    next_push_id: u64,
    /// Whether the replica has ever been hydrated.
    synced: bool,
}

impl ClientShared {
    fn new(session_key: String) -> Self {
        Self {
            session_key,
            replica: ReplicaStore::new(),
            pending: BTreeMap::new(),
            next_push_id: 1,
            synced: false,
        }
    }

    fn last_known_clock(&self) -> Option<u64> {
        self.synced.then_some(self.replica.clock())
    }

    fn reapply_pending(&mut self) {
        for mutations in self.pending.values() {
            self.replica.apply_local(mutations);
        }
    }

    fn pending_pushes(&self) -> Vec<ClientMessage> {
        self.pending
            .iter()
            .map(|(push_id, mutations)| {
                ClientMessage::Push(Push {
                    session_key: self.session_key.clone(),
                    push_id: *push_id,
                    mutations: mutations.clone(),
                    presence: None,
                })
            })
            .collect()
    }

    fn settle(&mut self, result: PushResult) -> SyncEvent {
        let mutations = self.pending.remove(&result.push_id).unwrap_or_default();
        let rejected: Vec<RecordId> = result.rejected.iter().map(|r| r.record_id.clone()).collect();
        let accepted = mutations
            .into_iter()
            .map(|m| m.record_id)
            .filter(|id| !rejected.contains(id));
        let restored = result.rejected.into_iter().map(|r| (r.record_id, r.current));
        self.replica.commit_local(result.clock, accepted, restored);
        SyncEvent::PushSettled {
            push_id: result.push_id,
            clock: result.clock,
            rejected,
        }
    }

    /// Fold one server message into the replica.
    ///
    /// Returns the events to emit and any frames to send back.
    fn handle(&mut self, msg: ServerMessage) -> (Vec<SyncEvent>, Vec<ClientMessage>) {
        match msg {
            ServerMessage::Connected(accepted) => {
                match accepted.hydration {
                    Hydration::Snapshot { records } => self.replica.hydrate(accepted.clock, records),
                    Hydration::Incremental(patch) => {
                        if let Err(e) = self.replica.catch_up(&patch) {
                            log::warn!("Catch-up patch did not apply: {e}");
                        }
                    }
                }
                self.synced = true;
                self.reapply_pending();
                let event = SyncEvent::Connected {
                    clock: accepted.clock,
                    resumed: accepted.resumed,
                };
                (vec![event], self.pending_pushes())
            }
            ServerMessage::RejectConnect { reason } => (vec![SyncEvent::Rejected(reason)], Vec::new()),
            ServerMessage::Data(batch) => {
                let mut events = Vec::new();
                for data in batch {
                    match data {
                        DataMessage::Patch(patch) => match self.replica.apply_patch(&patch) {
                            Ok(true) => {
                                self.reapply_pending();
                                events.push(SyncEvent::RemoteChanges {
                                    clock: patch.to_clock,
                                    changed: patch.changes.len(),
                                });
                            }
                            Ok(false) => {}
                            Err(e) => log::warn!("Dropping patch: {e}"),
                        },
                        DataMessage::PushResult(result) => events.push(self.settle(result)),
                    }
                }
                (events, Vec::new())
            }
            ServerMessage::Pong => (vec![SyncEvent::Pong], Vec::new()),
            ServerMessage::Error { message } => (vec![SyncEvent::ServerError(message)], Vec::new()),
        }
    }
}

/// The sync client.
///
/// Manages a WebSocket connection to one room and mirrors the room's
/// records in a local replica.
pub struct SyncClient {
    /// Server URL, e.g. `ws://127.0.0.1:9090`
    server_url: String,

    /// Document (room) we're editing
    document_id: String,

    /// Id of our presence record
    presence_id: String,

    /// Schema reported at handshake
    schema: SchemaDescriptor,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Bumped on every connect so a stale reader cannot touch `state`
    generation: Arc<AtomicU64>,

    /// Replica and pending pushes, shared with the reader task
    shared: Arc<Mutex<ClientShared>>,

    /// Channel to send frames to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by connection task)
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    /// Create a new sync client.
    pub fn new(
        server_url: impl Into<String>,
        document_id: impl Into<String>,
        session_key: impl Into<String>,
        schema: &Schema,
    ) -> Self {
        let session_key = session_key.into();
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            document_id: document_id.into(),
            presence_id: format!("presence:{session_key}"),
            schema: schema.descriptor(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            generation: Arc::new(AtomicU64::new(0)),
            shared: Arc::new(Mutex::new(ClientShared::new(session_key))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the room and send the handshake.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages. The
    /// replica is hydrated when [`SyncEvent::Connected`] arrives.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let (session_key, last_known_clock) = {
            let shared = self.shared.lock().await;
            (shared.session_key.clone(), shared.last_known_clock())
        };
        let url = format!("{}/{}?sessionKey={}", self.server_url, self.document_id, session_key);
        let (ws_stream, _) = match tokio_tungstenite::connect_async(&url).await {
            Ok(connected) => connected,
            Err(e) => {
                log::warn!("Failed to connect to {url}: {e}");
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let hello = ClientMessage::Connect(ConnectRequest {
            session_key,
            presence_id: self.presence_id.clone(),
            schema: self.schema.clone(),
            last_known_clock,
        });
        out_tx
            .send(hello.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        // Reader task: fold server messages into the replica
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let current = self.generation.clone();
        let shared = self.shared.clone();
        // Weak, so dropping `outgoing_tx` still ends the writer.
        let reply_tx = out_tx.downgrade();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let msg = match ServerMessage::decode(&bytes) {
                            Ok(msg) => msg,
                            Err(e) => {
                                log::warn!("Undecodable frame from server: {e}");
                                continue;
                            }
                        };
                        let handshake = matches!(msg, ServerMessage::Connected(_));
                        // Replies go out under the lock so replayed pushes
                        // stay ahead of new ones.
                        let events = {
                            let mut shared = shared.lock().await;
                            let (events, replies) = shared.handle(msg);
                            if let Some(reply_tx) = reply_tx.upgrade() {
                                for reply in replies {
                                    if let Ok(encoded) = reply.encode() {
                                        let _ = reply_tx.send(encoded).await;
                                    }
                                }
                            }
                            if handshake && current.load(Ordering::SeqCst) == generation {
                                *state.write().await = ConnectionState::Connected;
                            }
                            events
                        };
                        for event in events {
                            let _ = event_tx.send(event).await;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            if current.load(Ordering::SeqCst) == generation {
                *state.write().await = ConnectionState::Disconnected;
            }
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        self.outgoing_tx = Some(out_tx);
        Ok(())
    }

    /// Drop the connection. Pending pushes are kept for the next connect.
    pub async fn disconnect(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    async fn send(&self, msg: &ClientMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        if let Some(ref tx) = self.outgoing_tx {
            tx.send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }
        Ok(())
    }

    /// Apply mutations locally and push them to the room.
    ///
    /// If disconnected, the push stays pending and is sent on reconnect.
    pub async fn push(&self, mutations: Vec<Mutation>) -> Result<u64, ProtocolError> {
        let mut shared = self.shared.lock().await;
        let push_id = shared.next_push_id;
        shared.next_push_id += 1;
        shared.replica.apply_local(&mutations);
        shared.pending.insert(push_id, mutations.clone());
        if *self.state.read().await == ConnectionState::Connected {
            let msg = ClientMessage::Push(Push {
                session_key: shared.session_key.clone(),
                push_id,
                mutations,
                presence: None,
            });
            self.send(&msg).await?;
        }
        Ok(push_id)
    }

    /// Publish our presence. Dropped silently while offline.
    pub async fn set_presence(&self, presence: impl Into<RecordContent>) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Ok(());
        }
        let msg = {
            let mut shared = self.shared.lock().await;
            let push_id = shared.next_push_id;
            shared.next_push_id += 1;
            Push {
                session_key: shared.session_key.clone(),
                push_id,
                mutations: Vec::new(),
                presence: Some(presence.into()),
            }
        };
        self.send(&ClientMessage::Push(msg)).await
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Ping).await
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// A copy of the local replica.
    pub async fn replica(&self) -> ReplicaStore {
        self.shared.lock().await.replica.clone()
    }

    pub async fn record(&self, id: &RecordId) -> Option<Record> {
        self.shared.lock().await.replica.get(id).cloned()
    }

    /// Replica clock.
    pub async fn clock(&self) -> u64 {
        self.shared.lock().await.replica.clock()
    }

    /// Pushes not yet acknowledged by the room.
    pub async fn pending_len(&self) -> usize {
        self.shared.lock().await.pending.len()
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn presence_id(&self) -> &str {
        &self.presence_id
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{Patch, RecordsDiff};
    use crate::protocol::{ConnectAccepted, RejectedMutation};
    use crate::record::ValidationError;
    use serde_json::json;

    fn client() -> SyncClient {
        SyncClient::new("ws://localhost:9090", "doc", "alice", &Schema::default())
    }

    fn connected(records: Vec<Record>, clock: u64) -> ServerMessage {
        ServerMessage::Connected(ConnectAccepted {
            clock,
            schema_version: 1,
            resumed: false,
            hydration: Hydration::Snapshot { records },
        })
    }

    #[test]
    fn test_client_creation() {
        let client = client();
        assert_eq!(client.document_id(), "doc");
        assert_eq!(client.presence_id(), "presence:alice");
        assert_eq!(client.server_url(), "ws://localhost:9090");
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = client();
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.clock().await, 0);
        assert_eq!(client.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_push_offline_stays_pending() {
        let client = client();
        let first = client
            .push(vec![Mutation::upsert("n1", "note", json!({ "t": 1 }))])
            .await
            .unwrap();
        let second = client.push(vec![Mutation::delete("n1")]).await.unwrap();
        assert_eq!((first, second), (1, 2));
        assert_eq!(client.pending_len().await, 2);
        assert!(client.record(&"n1".into()).await.is_none());
    }

    #[tokio::test]
    async fn test_set_presence_offline_noop() {
        let client = client();
        client.set_presence(json!({ "cursor": [0, 0] })).await.unwrap();
        assert_eq!(client.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = client();
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[test]
    fn test_snapshot_then_replay_pending() {
        let mut shared = ClientShared::new("alice".into());
        shared.pending.insert(1, vec![Mutation::upsert("mine", "note", json!({}))]);
        assert_eq!(shared.last_known_clock(), None);

        let theirs = Record::new("theirs", "note", json!({ "t": 1 }), 4);
        let (events, replies) = shared.handle(connected(vec![theirs], 4));
        assert_eq!(events, vec![SyncEvent::Connected { clock: 4, resumed: false }]);
        assert_eq!(replies.len(), 1);
        assert!(shared.replica.get(&"mine".into()).is_some());
        assert!(shared.replica.get(&"theirs".into()).is_some());
        assert_eq!(shared.last_known_clock(), Some(4));
    }

    #[test]
    fn test_patch_keeps_pending_value_on_top() {
        let mut shared = ClientShared::new("alice".into());
        shared.handle(connected(Vec::new(), 0));
        shared.pending.insert(1, vec![Mutation::upsert("n1", "note", json!({ "v": "mine" }))]);
        shared.reapply_pending();

        let mut changes = RecordsDiff::new();
        changes.put(Record::new("n1", "note", json!({ "v": "theirs" }), 1));
        let (events, _) = shared.handle(ServerMessage::Data(vec![DataMessage::Patch(Patch::new(0, 1, changes))]));
        assert_eq!(events, vec![SyncEvent::RemoteChanges { clock: 1, changed: 1 }]);
        assert_eq!(
            shared.replica.get(&"n1".into()).unwrap().content.get("v"),
            Some(&json!("mine"))
        );
    }

    #[test]
    fn test_rejected_mutation_restores_room_value() {
        let mut shared = ClientShared::new("alice".into());
        let original = Record::new("n1", "note", json!({ "v": 1 }), 2);
        shared.handle(connected(vec![original.clone()], 2));
        shared.pending.insert(7, vec![Mutation::upsert("n1", "note", json!({ "v": 2 }))]);
        shared.reapply_pending();

        let (events, _) = shared.handle(ServerMessage::Data(vec![DataMessage::PushResult(PushResult {
            push_id: 7,
            clock: 2,
            rejected: vec![RejectedMutation {
                record_id: "n1".into(),
                reason: ValidationError::NotAnObject,
                current: Some(original.clone()),
            }],
        })]));
        assert_eq!(
            events,
            vec![SyncEvent::PushSettled {
                push_id: 7,
                clock: 2,
                rejected: vec!["n1".into()],
            }]
        );
        assert_eq!(shared.replica.get(&"n1".into()), Some(&original));
        assert!(shared.pending.is_empty());
    }
}
