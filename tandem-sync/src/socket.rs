//! Transport seam between a room and its connections.
//!
//! The room only needs ordered, reliable delivery per session and a way to
//! hang up. Sends must never block: a transport that cannot take a frame
//! right now reports [`SocketError::Full`] and the room treats the session
//! as too slow.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::protocol::{ProtocolError, ServerMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SocketError {
    #[error("socket closed")]
    Closed,
    #[error("socket send buffer full")]
    Full,
}

/// Outbound half of one connection, as seen by a room.
pub trait RoomSocket: Send + Sync {
    /// Identity of this particular connection. A reconnect under the same
    /// session key gets a new id.
    fn id(&self) -> Uuid;

    /// Queue one encoded frame without blocking.
    fn send(&self, frame: Vec<u8>) -> Result<(), SocketError>;

    /// Hang up. Further sends fail with [`SocketError::Closed`].
    fn close(&self);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Socket backed by a bounded tokio channel; a writer task drains the
/// receiver into the real connection. Dropping the sender on `close` ends
/// the writer's `recv` loop.
pub struct ChannelSocket {
    id: Uuid,
    tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl ChannelSocket {
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let socket = Arc::new(Self {
            id: Uuid::new_v4(),
            tx: Mutex::new(Some(tx)),
        });
        (socket, rx)
    }
}

impl RoomSocket for ChannelSocket {
    fn id(&self) -> Uuid {
        self.id
    }

    fn send(&self, frame: Vec<u8>) -> Result<(), SocketError> {
        match lock(&self.tx).as_ref() {
            Some(tx) => tx.try_send(frame).map_err(|e| match e {
                TrySendError::Full(_) => SocketError::Full,
                TrySendError::Closed(_) => SocketError::Closed,
            }),
            None => Err(SocketError::Closed),
        }
    }

    fn close(&self) {
        lock(&self.tx).take();
    }
}

/// In-process socket that records every frame. Used to drive rooms without
/// a network, e.g. in tests and benchmarks.
pub struct MemorySocket {
    id: Uuid,
    frames: Mutex<Vec<Vec<u8>>>,
    closed: AtomicBool,
    /// Pending-frame limit before reporting `Full`.
    capacity: Option<usize>,
}

impl MemorySocket {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            frames: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            capacity: None,
        })
    }

    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            frames: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            capacity: Some(capacity),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn frame_count(&self) -> usize {
        lock(&self.frames).len()
    }

    /// Drain and decode all frames received so far.
    pub fn take_messages(&self) -> Result<Vec<ServerMessage>, ProtocolError> {
        let frames = std::mem::take(&mut *lock(&self.frames));
        frames.iter().map(|f| ServerMessage::decode(f)).collect()
    }
}

impl RoomSocket for MemorySocket {
    fn id(&self) -> Uuid {
        self.id
    }

    fn send(&self, frame: Vec<u8>) -> Result<(), SocketError> {
        if self.is_closed() {
            return Err(SocketError::Closed);
        }
        let mut frames = lock(&self.frames);
        if self.capacity.is_some_and(|cap| frames.len() >= cap) {
            return Err(SocketError::Full);
        }
        frames.push(frame);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_socket_delivers_in_order() {
        let (socket, mut rx) = ChannelSocket::new(4);
        socket.send(vec![1]).unwrap();
        socket.send(vec![2]).unwrap();
        assert_eq!(rx.recv().await, Some(vec![1]));
        assert_eq!(rx.recv().await, Some(vec![2]));
    }

    #[tokio::test]
    async fn test_channel_socket_reports_full() {
        let (socket, _rx) = ChannelSocket::new(1);
        socket.send(vec![1]).unwrap();
        assert_eq!(socket.send(vec![2]), Err(SocketError::Full));
    }

    #[tokio::test]
    async fn test_channel_socket_close_ends_receiver() {
        let (socket, mut rx) = ChannelSocket::new(4);
        socket.send(vec![1]).unwrap();
        socket.close();
        assert_eq!(socket.send(vec![2]), Err(SocketError::Closed));
        assert_eq!(rx.recv().await, Some(vec![1]));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_channel_socket_dropped_receiver() {
        let (socket, rx) = ChannelSocket::new(4);
        drop(rx);
        assert_eq!(socket.send(vec![1]), Err(SocketError::Closed));
    }

    #[test]
    fn test_memory_socket_records_and_decodes() {
        let socket = MemorySocket::new();
        socket.send(ServerMessage::Pong.encode().unwrap()).unwrap();
        assert_eq!(socket.frame_count(), 1);
        assert_eq!(socket.take_messages().unwrap(), vec![ServerMessage::Pong]);
        assert_eq!(socket.frame_count(), 0);
    }

    #[test]
    fn test_memory_socket_capacity_and_close() {
        let socket = MemorySocket::with_capacity(1);
        socket.send(vec![0]).unwrap();
        assert_eq!(socket.send(vec![0]), Err(SocketError::Full));
        socket.close();
        assert!(socket.is_closed());
        assert_eq!(socket.send(vec![0]), Err(SocketError::Closed));
    }

    #[test]
    fn test_ids_are_distinct() {
        assert_ne!(MemorySocket::new().id(), MemorySocket::new().id());
    }
}
