//! Room registry: routes document ids to live rooms.
//!
//! ```text
//!   doc id ──► RwLock<HashMap> ──► Arc<Mutex<Room>>
//!                   │
//!                   └─ create: load snapshot │ destroy (empty): save snapshot
//! ```
//!
//! Rooms are created on first connection and destroyed once their last
//! session is gone. The map lock is held while a session is registered so a
//! room cannot be destroyed between lookup and registration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Instant;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use crate::config::RoomConfig;
use crate::room::{LifecycleEvent, Room};
use crate::socket::RoomSocket;
use crate::store::RoomSnapshot;

/// Durable home for room snapshots between room lifetimes.
pub trait SnapshotStore: Send + Sync {
    fn load(&self, document_id: &str) -> Option<RoomSnapshot>;
    fn save(&self, document_id: &str, snapshot: RoomSnapshot);
}

/// Keeps snapshots for the life of the process.
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: StdMutex<HashMap<String, RoomSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self, document_id: &str) -> Option<RoomSnapshot> {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(document_id)
            .cloned()
    }

    fn save(&self, document_id: &str, snapshot: RoomSnapshot) {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(document_id.to_string(), snapshot);
    }
}

pub type SharedRoom = Arc<Mutex<Room>>;

pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, SharedRoom>>,
    config: RoomConfig,
    snapshots: Arc<dyn SnapshotStore>,
}

impl RoomRegistry {
    pub fn new(config: RoomConfig) -> Self {
        Self::with_snapshot_store(config, Arc::new(MemorySnapshotStore::new()))
    }

    pub fn with_snapshot_store(config: RoomConfig, snapshots: Arc<dyn SnapshotStore>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            config,
            snapshots,
        }
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    fn create_room(&self, document_id: &str) -> Room {
        match self.snapshots.load(document_id) {
            Some(snapshot) => {
                log::info!(
                    "Restoring room {document_id} at clock {} ({} records)",
                    snapshot.clock,
                    snapshot.records.len()
                );
                Room::from_snapshot(document_id, self.config.clone(), snapshot)
            }
            None => {
                log::info!("Creating room {document_id}");
                Room::new(document_id, self.config.clone())
            }
        }
    }

    /// Get or create the room for a document.
    pub async fn get_or_create(&self, document_id: &str) -> SharedRoom {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(document_id) {
                return room.clone();
            }
        }

        // Slow path: write lock, double-check
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(document_id) {
            return room.clone();
        }
        let room = Arc::new(Mutex::new(self.create_room(document_id)));
        rooms.insert(document_id.to_string(), room.clone());
        room
    }

    pub async fn get(&self, document_id: &str) -> Option<SharedRoom> {
        self.rooms.read().await.get(document_id).cloned()
    }

    /// Register a freshly opened socket with its document's room, creating
    /// the room if needed. `meta` is attached to the session as-is.
    pub async fn open_session(
        &self,
        document_id: &str,
        session_key: &str,
        socket: Arc<dyn RoomSocket>,
        meta: Value,
        now: Instant,
    ) -> SharedRoom {
        loop {
            let room = self.get_or_create(document_id).await;
            let rooms = self.rooms.read().await;
            // Destroyed between the two locks; go round again.
            if !rooms.get(document_id).is_some_and(|r| Arc::ptr_eq(r, &room)) {
                continue;
            }
            room.lock()
                .await
                .handle_new_session_with_meta(session_key, socket.clone(), meta.clone(), now);
            drop(rooms);
            return room;
        }
    }

    /// Destroy a room with no sessions left, saving its snapshot first.
    pub async fn remove_if_empty(&self, document_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(document_id) else {
            return false;
        };
        let snapshot = {
            let room = room.lock().await;
            if !room.is_empty() {
                return false;
            }
            room.snapshot()
        };
        rooms.remove(document_id);
        log::info!(
            "Room {document_id} removed (empty), saved snapshot at clock {}",
            snapshot.clock
        );
        self.snapshots.save(document_id, snapshot);
        true
    }

    /// Tick every room, then destroy the ones left empty.
    pub async fn tick_all(&self, now: Instant) -> Vec<(String, LifecycleEvent)> {
        let rooms: Vec<(String, SharedRoom)> = self
            .rooms
            .read()
            .await
            .iter()
            .map(|(id, room)| (id.clone(), room.clone()))
            .collect();

        let mut events = Vec::new();
        let mut emptied = Vec::new();
        for (document_id, room) in rooms {
            let mut room = room.lock().await;
            events.extend(room.tick(now).into_iter().map(|e| (document_id.clone(), e)));
            if room.is_empty() {
                emptied.push(document_id);
            }
        }
        for document_id in emptied {
            self.remove_if_empty(&document_id).await;
        }
        events
    }

    /// Administrative force-disconnect of one session.
    pub async fn remove_session(&self, document_id: &str, session_key: &str, now: Instant) -> bool {
        match self.get(document_id).await {
            Some(room) => room.lock().await.remove_session(session_key, now),
            None => false,
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClientMessage, ConnectRequest, Mutation, Push};
    use crate::record::Schema;
    use crate::socket::MemorySocket;
    use serde_json::json;
    use std::time::Duration;

    fn connect_frame(key: &str) -> Vec<u8> {
        ClientMessage::Connect(ConnectRequest {
            session_key: key.into(),
            presence_id: format!("presence:{key}"),
            schema: Schema::default().descriptor(),
            last_known_clock: None,
        })
        .encode()
        .unwrap()
    }

    #[tokio::test]
    async fn test_get_or_create_same_room() {
        let registry = RoomRegistry::new(RoomConfig::default());
        let room1 = registry.get_or_create("doc").await;
        let room2 = registry.get_or_create("doc").await;
        assert!(Arc::ptr_eq(&room1, &room2));
        assert_eq!(registry.room_count().await, 1);

        registry.get_or_create("other").await;
        let mut docs = registry.active_documents().await;
        docs.sort();
        assert_eq!(docs, vec!["doc".to_string(), "other".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_if_empty() {
        let registry = RoomRegistry::new(RoomConfig::default());
        let now = Instant::now();
        let socket = MemorySocket::new();
        let room = registry
            .open_session("doc", "a", socket.clone(), json!({ "remote_addr": "10.0.0.7:5000" }), now)
            .await;
        assert_eq!(
            room.lock().await.session_meta("a"),
            Some(&json!({ "remote_addr": "10.0.0.7:5000" }))
        );

        assert!(!registry.remove_if_empty("doc").await);
        room.lock().await.handle_close("a", socket.id(), now);
        assert!(registry.remove_if_empty("doc").await);
        assert_eq!(registry.room_count().await, 0);
        assert!(!registry.remove_if_empty("doc").await);
    }

    #[tokio::test]
    async fn test_snapshot_survives_room_lifetime() {
        let store = Arc::new(MemorySnapshotStore::new());
        let config = RoomConfig::default().with_schema(
            Schema::new(1).with_type(crate::record::RecordType::document("note")),
        );
        let registry = RoomRegistry::with_snapshot_store(config, store.clone());
        let now = Instant::now();

        let socket = MemorySocket::new();
        let room = registry
            .open_session("doc", "a", socket.clone(), Value::Null, now)
            .await;
        {
            let mut room = room.lock().await;
            room.handle_message("a", &connect_frame("a"), now).unwrap();
            let push = ClientMessage::Push(Push {
                session_key: "a".into(),
                push_id: 1,
                mutations: vec![Mutation::upsert("n1", "note", json!({ "text": "hi" }))],
                presence: None,
            });
            room.handle_message("a", &push.encode().unwrap(), now).unwrap();
            room.handle_close("a", socket.id(), now);
        }

        // Still inside the grace period.
        registry.tick_all(now + Duration::from_secs(1)).await;
        assert_eq!(registry.room_count().await, 1);

        let events = registry.tick_all(now + Duration::from_secs(11)).await;
        assert_eq!(events.len(), 1);
        assert_eq!(registry.room_count().await, 0);
        assert_eq!(store.len(), 1);

        let room = registry.get_or_create("doc").await;
        let room = room.lock().await;
        assert_eq!(room.clock(), 1);
        assert!(room.record(&"n1".into()).is_some());
    }
}
