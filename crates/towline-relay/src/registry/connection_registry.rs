//! Connection Registry implementation.
//!
//! Tracks live connections for fan-out: which connections belong to
//! which user, and which belong to the admin pool. The registry owns
//! only the membership relation and each connection's outbound queue
//! sender; it never owns the transport itself.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::types::{ChatMessage, Envelope};

/// Opaque identifier for one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a fresh connection id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which membership set a connection belongs to.
///
/// A connection is never in both: a user connection belongs to exactly
/// one per-user set, an admin connection to the single admin pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Customer connection, owned by the given user identity.
    User(i64),
    /// Support operator connection.
    Admin,
}

/// A message queued for delivery to one connection.
///
/// The JSON payload is serialized once per publish and shared between
/// recipients; each connection's writer task puts it on the wire.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Serialized `{"type":"message","data":{...}}` envelope.
    pub payload: Arc<str>,
}

impl OutboundMessage {
    /// Serialize a persisted message into its push envelope.
    pub fn from_message(message: ChatMessage) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_string(&Envelope::message(message))?;
        Ok(Self {
            payload: payload.into(),
        })
    }

    /// Parse the payload back into JSON. Test helper, mostly.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

/// Connection state stored in the registry.
#[derive(Debug)]
struct ConnectionEntry {
    kind: ConnectionKind,
    sender: mpsc::Sender<OutboundMessage>,
}

/// Result of attempting to send a message to a connection.
#[derive(Debug)]
pub enum SendResult {
    /// Message was successfully queued for delivery.
    Sent,
    /// The connection is no longer registered.
    NotRegistered,
    /// The connection's queue is full (backpressure); delivery dropped.
    QueueFull,
    /// The connection's queue is closed; the entry has been removed.
    QueueClosed,
}

/// Registry for tracking live chat connections.
///
/// Thread-safe; uses DashMap for concurrent access without an explicit
/// lock. Shard locks are held only for in-memory set mutation and
/// snapshots, never across a network send.
///
/// ## Usage
///
/// ```ignore
/// let registry = ConnectionRegistry::new();
///
/// // When a user connection authenticates:
/// let (tx, rx) = mpsc::channel(256);
/// let conn_id = registry.register_user(42, tx);
///
/// // Fan-out iterates a snapshot, not the live map:
/// for (id, sender) in registry.snapshot_for_user(42) { /* send */ }
///
/// // On any exit path:
/// registry.unregister(conn_id);
/// ```
pub struct ConnectionRegistry {
    /// All live connections keyed by id; the entry records which set
    /// the connection belongs to, so `unregister` needs no caller hint.
    connections: DashMap<ConnectionId, ConnectionEntry>,
}

impl ConnectionRegistry {
    /// Create a new connection registry.
    pub fn new() -> Self {
        info!("Creating connection registry");
        Self {
            connections: DashMap::new(),
        }
    }

    /// Register a user connection under its resolved identity.
    ///
    /// Returns the id used for later `unregister` and snapshots.
    #[instrument(skip(self, sender))]
    pub fn register_user(&self, user_id: i64, sender: mpsc::Sender<OutboundMessage>) -> ConnectionId {
        let conn_id = ConnectionId::new();
        self.connections.insert(
            conn_id,
            ConnectionEntry {
                kind: ConnectionKind::User(user_id),
                sender,
            },
        );
        debug!(conn_id = %conn_id, "Registered user connection");
        conn_id
    }

    /// Register an admin connection in the global admin set.
    #[instrument(skip(self, sender))]
    pub fn register_admin(&self, sender: mpsc::Sender<OutboundMessage>) -> ConnectionId {
        let conn_id = ConnectionId::new();
        self.connections.insert(
            conn_id,
            ConnectionEntry {
                kind: ConnectionKind::Admin,
                sender,
            },
        );
        debug!(conn_id = %conn_id, "Registered admin connection");
        conn_id
    }

    /// Unregister a connection, whatever set it is in.
    ///
    /// Membership kind is determined by lookup, so a single teardown
    /// call is correct for both connection kinds. Idempotent: removing
    /// an unknown id is a no-op, which lets every exit path call this
    /// without coordination.
    #[instrument(skip(self))]
    pub fn unregister(&self, conn_id: ConnectionId) -> Option<ConnectionKind> {
        match self.connections.remove(&conn_id) {
            Some((_, entry)) => {
                debug!(conn_id = %conn_id, kind = ?entry.kind, "Unregistered connection");
                Some(entry.kind)
            }
            None => {
                debug!(conn_id = %conn_id, "Connection was not registered");
                None
            }
        }
    }

    /// Check if a connection is currently registered.
    pub fn is_registered(&self, conn_id: ConnectionId) -> bool {
        self.connections.contains_key(&conn_id)
    }

    /// Get the number of live connections (both kinds).
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Snapshot the current set of connections for a user.
    ///
    /// Returns cloned senders so the caller iterates and sends without
    /// touching the registry again; a slow recipient cannot block
    /// registration of unrelated connections.
    pub fn snapshot_for_user(&self, user_id: i64) -> Vec<(ConnectionId, mpsc::Sender<OutboundMessage>)> {
        self.connections
            .iter()
            .filter(|entry| entry.value().kind == ConnectionKind::User(user_id))
            .map(|entry| (*entry.key(), entry.value().sender.clone()))
            .collect()
    }

    /// Snapshot the current admin set.
    pub fn snapshot_admins(&self) -> Vec<(ConnectionId, mpsc::Sender<OutboundMessage>)> {
        self.connections
            .iter()
            .filter(|entry| entry.value().kind == ConnectionKind::Admin)
            .map(|entry| (*entry.key(), entry.value().sender.clone()))
            .collect()
    }

    /// Send a message to one registered connection.
    ///
    /// A closed queue means the connection's writer task is gone; the
    /// stale entry is removed immediately so later publishes stop
    /// attempting delivery to it.
    pub fn send_to(&self, conn_id: ConnectionId, message: OutboundMessage) -> SendResult {
        let sender = match self.connections.get(&conn_id) {
            Some(entry) => entry.value().sender.clone(),
            None => {
                debug!(conn_id = %conn_id, "Recipient not registered");
                return SendResult::NotRegistered;
            }
        };

        match sender.try_send(message) {
            Ok(()) => SendResult::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn_id = %conn_id, "Outbound queue full, dropping delivery");
                SendResult::QueueFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(conn_id = %conn_id, "Outbound queue closed, removing stale entry");
                self.connections.remove(&conn_id);
                SendResult::QueueClosed
            }
        }
    }

    /// Remove all connections whose queues are closed.
    ///
    /// Normally teardown unregisters eagerly; this exists as a safety
    /// net callable from a maintenance task.
    pub fn cleanup_stale(&self) -> usize {
        let stale: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| entry.value().sender.is_closed())
            .map(|entry| *entry.key())
            .collect();

        let mut removed = 0;
        for conn_id in stale {
            if self.connections.remove(&conn_id).is_some() {
                debug!(conn_id = %conn_id, "Removed stale connection");
                removed += 1;
            }
        }

        if removed > 0 {
            info!(count = removed, "Cleaned up stale connections");
        }

        removed
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connection_count", &self.connections.len())
            .finish()
    }
}

/// Scoped registration that unregisters on drop.
///
/// Connection tasks hold one of these for the lifetime of the socket so
/// that teardown reaches the registry on every exit path, including
/// panics unwinding through the task.
pub struct RegistrationGuard {
    registry: Arc<ConnectionRegistry>,
    conn_id: ConnectionId,
}

impl RegistrationGuard {
    /// Wrap an already-registered connection.
    pub fn new(registry: Arc<ConnectionRegistry>, conn_id: ConnectionId) -> Self {
        Self { registry, conn_id }
    }

    /// The guarded connection's id.
    pub fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.unregister(self.conn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageSender;

    fn test_message(user_id: i64, text: &str) -> OutboundMessage {
        OutboundMessage::from_message(ChatMessage {
            id: 1,
            user_id,
            sender: MessageSender::User,
            text: text.to_string(),
            created_at: chrono::Utc::now(),
            meta: None,
        })
        .unwrap()
    }

    #[test]
    fn test_registry_creation() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn test_register_user_connection() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(16);

        let conn_id = registry.register_user(42, tx);

        assert!(registry.is_registered(conn_id));
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.snapshot_for_user(42).len(), 1);
        assert!(registry.snapshot_for_user(7).is_empty());
        assert!(registry.snapshot_admins().is_empty());
    }

    #[test]
    fn test_register_admin_connection() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(16);

        let conn_id = registry.register_admin(tx);

        assert!(registry.is_registered(conn_id));
        assert_eq!(registry.snapshot_admins().len(), 1);
        assert!(registry.snapshot_for_user(42).is_empty());
    }

    #[test]
    fn test_unregister_by_lookup() {
        let registry = ConnectionRegistry::new();
        let (user_tx, _user_rx) = mpsc::channel(16);
        let (admin_tx, _admin_rx) = mpsc::channel(16);

        let user_conn = registry.register_user(42, user_tx);
        let admin_conn = registry.register_admin(admin_tx);

        // Same call removes either kind; membership comes from lookup.
        assert_eq!(registry.unregister(user_conn), Some(ConnectionKind::User(42)));
        assert_eq!(registry.unregister(admin_conn), Some(ConnectionKind::Admin));
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(16);

        let conn_id = registry.register_user(42, tx);
        assert!(registry.unregister(conn_id).is_some());
        assert!(registry.unregister(conn_id).is_none());

        // Never-registered id is a no-op too.
        assert!(registry.unregister(ConnectionId::new()).is_none());
    }

    #[test]
    fn test_unregister_does_not_affect_other_connections() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = mpsc::channel(16);
        let (tx2, _rx2) = mpsc::channel(16);

        let conn1 = registry.register_user(42, tx1);
        let conn2 = registry.register_user(42, tx2);

        registry.unregister(conn1);

        let snapshot = registry.snapshot_for_user(42);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, conn2);
    }

    #[test]
    fn test_snapshot_partitions_users() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = mpsc::channel(16);
        let (tx2, _rx2) = mpsc::channel(16);
        let (tx3, _rx3) = mpsc::channel(16);

        registry.register_user(1, tx1);
        registry.register_user(1, tx2);
        registry.register_user(2, tx3);

        assert_eq!(registry.snapshot_for_user(1).len(), 2);
        assert_eq!(registry.snapshot_for_user(2).len(), 1);
        assert!(registry.snapshot_for_user(3).is_empty());
    }

    #[tokio::test]
    async fn test_send_to_registered_connection() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(16);
        let conn_id = registry.register_user(42, tx);

        let result = registry.send_to(conn_id, test_message(42, "hello"));
        assert!(matches!(result, SendResult::Sent));

        let received = rx.recv().await.unwrap();
        let value = received.to_value().unwrap();
        assert_eq!(value["data"]["text"], "hello");
    }

    #[test]
    fn test_send_to_unregistered_connection() {
        let registry = ConnectionRegistry::new();
        let result = registry.send_to(ConnectionId::new(), test_message(42, "hello"));
        assert!(matches!(result, SendResult::NotRegistered));
    }

    #[test]
    fn test_send_to_closed_queue_removes_entry() {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = mpsc::channel(16);
        let conn_id = registry.register_user(42, tx);

        drop(rx);

        let result = registry.send_to(conn_id, test_message(42, "hello"));
        assert!(matches!(result, SendResult::QueueClosed));
        assert!(!registry.is_registered(conn_id));
    }

    #[test]
    fn test_send_to_full_queue() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        let conn_id = registry.register_user(42, tx);

        assert!(matches!(
            registry.send_to(conn_id, test_message(42, "first")),
            SendResult::Sent
        ));
        // Queue full drops the delivery but keeps the registration.
        assert!(matches!(
            registry.send_to(conn_id, test_message(42, "second")),
            SendResult::QueueFull
        ));
        assert!(registry.is_registered(conn_id));
    }

    #[test]
    fn test_cleanup_stale() {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = mpsc::channel(16);
        let conn_id = registry.register_user(42, tx);

        drop(rx);

        assert_eq!(registry.cleanup_stale(), 1);
        assert!(!registry.is_registered(conn_id));
    }

    #[test]
    fn test_registration_guard_unregisters_on_drop() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, _rx) = mpsc::channel(16);
        let conn_id = registry.register_user(42, tx);

        {
            let _guard = RegistrationGuard::new(Arc::clone(&registry), conn_id);
            assert!(registry.is_registered(conn_id));
        }

        assert!(!registry.is_registered(conn_id));
    }

    #[test]
    fn test_registration_guard_tolerates_early_unregister() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, _rx) = mpsc::channel(16);
        let conn_id = registry.register_user(42, tx);

        let guard = RegistrationGuard::new(Arc::clone(&registry), conn_id);
        registry.unregister(conn_id);
        drop(guard); // second unregister is a no-op

        assert_eq!(registry.connection_count(), 0);
    }
}
