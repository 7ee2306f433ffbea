//! Revocable write handle for one live chat connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Utf8Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use trackspace_core::{ConnectionId, HubError};

struct ConnectionState {
    id: ConnectionId,
    /// Display name resolved by the upstream authenticator, if any.
    identity: Option<String>,
    connected_at: Instant,
    /// Last inbound frame of any kind.
    last_seen: Mutex<Instant>,
    dropped_messages: AtomicU64,
    /// Cancelled once the connection is torn down, from either side.
    closer: CancellationToken,
}

/// What the registry stores for a connection.
///
/// Cloning is cheap; every clone refers to the same connection. Writes go
/// through a bounded channel drained by the connection's writer task, so
/// sending never blocks the dispatcher.
#[derive(Clone)]
pub struct ConnectionHandle {
    state: Arc<ConnectionState>,
    tx: mpsc::Sender<Utf8Bytes>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, identity: Option<String>, tx: mpsc::Sender<Utf8Bytes>) -> Self {
        let now = Instant::now();
        Self {
            state: Arc::new(ConnectionState {
                id,
                identity,
                connected_at: now,
                last_seen: Mutex::new(now),
                dropped_messages: AtomicU64::new(0),
                closer: CancellationToken::new(),
            }),
            tx,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.state.id
    }

    pub fn identity(&self) -> Option<&str> {
        self.state.identity.as_deref()
    }

    /// Queue one serialized frame for the writer.
    ///
    /// A full buffer means the peer is not keeping up and is treated the same
    /// as a closed one: the write failed.
    pub fn send(&self, frame: Utf8Bytes) -> Result<(), HubError> {
        if self.is_closed() {
            return Err(HubError::Write("connection closed".into()));
        }
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let _ = self.state.dropped_messages.fetch_add(1, Ordering::Relaxed);
                Err(HubError::Write("send queue full".into()))
            }
            Err(TrySendError::Closed(_)) => {
                let _ = self.state.dropped_messages.fetch_add(1, Ordering::Relaxed);
                Err(HubError::Write("writer gone".into()))
            }
        }
    }

    /// Total frames that could not be queued.
    pub fn drop_count(&self) -> u64 {
        self.state.dropped_messages.load(Ordering::Relaxed)
    }

    /// Record inbound activity.
    pub fn mark_alive(&self) {
        *self.state.last_seen.lock() = Instant::now();
    }

    /// Time since the last inbound frame (or since connecting).
    pub fn last_seen_elapsed(&self) -> Duration {
        self.state.last_seen.lock().elapsed()
    }

    pub fn age(&self) -> Duration {
        self.state.connected_at.elapsed()
    }

    /// Tear the connection down. Idempotent.
    pub fn close(&self) {
        self.state.closer.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.state.closer.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.state.closer.cancelled()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.state.id)
            .field("identity", &self.state.identity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_connection(capacity: usize) -> (ConnectionHandle, mpsc::Receiver<Utf8Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        (ConnectionHandle::new(ConnectionId::from_raw("conn_1"), None, tx), rx)
    }

    #[tokio::test]
    async fn send_message_success() {
        let (conn, mut rx) = make_connection(8);
        conn.send("hello".into()).unwrap();
        assert_eq!(rx.recv().await.unwrap().as_str(), "hello");
    }

    #[tokio::test]
    async fn send_to_full_channel_fails() {
        let (conn, _rx) = make_connection(1);
        conn.send("msg1".into()).unwrap();
        let err = conn.send("msg2".into()).unwrap_err();
        assert!(matches!(err, HubError::Write(_)));
        assert_eq!(conn.drop_count(), 1);
    }

    #[tokio::test]
    async fn send_to_closed_channel_fails() {
        let (conn, rx) = make_connection(8);
        drop(rx);
        assert!(conn.send("x".into()).is_err());
        assert_eq!(conn.drop_count(), 1);
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (conn, _rx) = make_connection(8);
        conn.close();
        assert!(conn.send("x".into()).is_err());
    }

    #[test]
    fn identity_is_exposed() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = ConnectionHandle::new(ConnectionId::new(), Some("alice".into()), tx);
        assert_eq!(conn.identity(), Some("alice"));
    }

    #[test]
    fn clones_share_close_state() {
        let (conn, _rx) = make_connection(1);
        let other = conn.clone();
        assert!(!other.is_closed());
        conn.close();
        conn.close();
        assert!(other.is_closed());
    }

    #[tokio::test]
    async fn closed_future_resolves_after_close() {
        let (conn, _rx) = make_connection(1);
        let waiter = conn.clone();
        let task = tokio::spawn(async move { waiter.closed().await });
        conn.close();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn mark_alive_resets_elapsed() {
        let (conn, _rx) = make_connection(1);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(conn.last_seen_elapsed() >= Duration::from_secs(5));
        conn.mark_alive();
        assert!(conn.last_seen_elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn debug_shows_id() {
        let (conn, _rx) = make_connection(1);
        assert!(format!("{conn:?}").contains("conn_1"));
    }
}
