//! Client-side view of server write locks.
//!
//! Write locks are advisory and live entirely on the server. The client
//! only remembers which ones it holds, in a [`LockOwnership`] set that the
//! driver replays after a reconnect. Acquisitions are recorded here once
//! they retire. Releases are recorded by the driver when it sees the
//! release complete, so a caller that stops polling cannot leave a stale
//! entry behind. A release cut off by a lost session counts as done: the
//! server drops every lock a session held when it ends.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use tessera_protocol::{EntityIdentity, Message, decode_try_lock_reply};

use crate::{ClientError, Connection, RequestError};

/// The identities whose write lock this client currently holds.
#[derive(Debug, Default)]
pub(crate) struct LockOwnership {
    held: Mutex<HashSet<EntityIdentity>>,
}

impl LockOwnership {
    /// Returns `false` if the identity was already recorded.
    pub(crate) fn insert(&self, identity: EntityIdentity) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identity)
    }

    /// Returns `false` if the identity was not recorded.
    pub(crate) fn remove(&self, identity: &EntityIdentity) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(identity)
    }

    /// Drops `identity` after its release, warning if it was not recorded.
    pub(crate) fn forget(&self, identity: &EntityIdentity) {
        if !self.remove(identity) {
            tracing::warn!(%identity, "released a write lock that was not recorded");
        }
    }

    /// Forgets every lock. Used once the session that held them is gone
    /// for good.
    pub(crate) fn clear(&self) {
        self.held.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub(crate) fn snapshot(&self) -> Vec<EntityIdentity> {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

/// A held write lock.
///
/// Call [`release`](Self::release) on every path. If the guard is dropped
/// instead (an operation future cancelled mid-flight, a panic), the
/// release is sent from a spawned task.
#[must_use = "a write lock is held until released"]
pub(crate) struct WriteLockGuard {
    connection: Connection,
    identity: EntityIdentity,
    released: bool,
}

impl WriteLockGuard {
    fn new(connection: &Connection, identity: &EntityIdentity) -> Self {
        Self {
            connection: connection.clone(),
            identity: identity.clone(),
            released: false,
        }
    }

    /// Releases the lock on the server.
    pub(crate) async fn release(mut self) -> Result<(), ClientError> {
        self.released = true;
        release(&self.connection, &self.identity).await
    }
}

impl Drop for WriteLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let identity = self.identity.clone();
        let connection = self.connection.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(%identity, "write lock guard dropped; releasing in background");
                handle.spawn(async move {
                    if let Err(e) = release(&connection, &identity).await {
                        tracing::warn!(%identity, error = %e, "background lock release failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    %identity,
                    "write lock guard dropped outside a runtime; lock stays held"
                );
            }
        }
    }
}

/// Takes the write lock, waiting for as long as another holder keeps it.
pub(crate) async fn acquire(
    connection: &Connection,
    identity: &EntityIdentity,
) -> Result<WriteLockGuard, ClientError> {
    let message = Message::lock_acquire(identity)
        .map_err(|e| ClientError::unexpected("lock_acquire", identity, e))?;
    exchange(connection, "lock_acquire", identity, message).await?;

    connection.did_acquire_write_lock(identity.clone());
    tracing::debug!(%identity, "write lock acquired");
    Ok(WriteLockGuard::new(connection, identity))
}

/// Takes the write lock only if it is free right now.
pub(crate) async fn try_acquire(
    connection: &Connection,
    identity: &EntityIdentity,
) -> Result<Option<WriteLockGuard>, ClientError> {
    let message = Message::lock_try_acquire(identity)
        .map_err(|e| ClientError::unexpected("lock_try_acquire", identity, e))?;
    let reply = exchange(connection, "lock_try_acquire", identity, message).await?;
    let granted = decode_try_lock_reply(&reply)
        .map_err(|e| ClientError::unexpected("lock_try_acquire", identity, e))?;

    if !granted {
        tracing::debug!(%identity, "write lock busy");
        return Ok(None);
    }
    connection.did_acquire_write_lock(identity.clone());
    tracing::debug!(%identity, "write lock acquired");
    Ok(Some(WriteLockGuard::new(connection, identity)))
}

/// Gives the lock back. The ownership set is updated by the driver.
async fn release(connection: &Connection, identity: &EntityIdentity) -> Result<(), ClientError> {
    let message = Message::lock_release(identity)
        .map_err(|e| ClientError::unexpected("lock_release", identity, e))?;

    match connection.send_message(message).result().await {
        Ok(_) => {
            tracing::debug!(%identity, "write lock released");
            Ok(())
        }
        Err(e @ (RequestError::ConnectionLost | RequestError::Closed)) => {
            tracing::debug!(%identity, reason = %e, "write lock released with its session");
            Ok(())
        }
        Err(e) => Err(ClientError::unexpected("lock_release", identity, e)),
    }
}

/// Sends one lock message and waits for it to retire. Any failure here is
/// unexpected.
async fn exchange(
    connection: &Connection,
    operation: &'static str,
    identity: &EntityIdentity,
    message: Message,
) -> Result<Vec<u8>, ClientError> {
    let mut wait = connection.send_message(message);
    wait.result()
        .await
        .map_err(|e| ClientError::unexpected(operation, identity, e))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tessera_passthrough::PassthroughServer;
    use tessera_protocol::Version;

    use super::*;

    fn widget() -> EntityIdentity {
        EntityIdentity::new("Widget", "w1", Version(1))
    }

    async fn connect(server: &PassthroughServer) -> Connection {
        Connection::builder()
            .connect(server.connector())
            .await
            .expect("should connect")
    }

    #[test]
    fn test_ownership_insert_remove_snapshot() {
        let locks = LockOwnership::default();
        assert!(locks.insert(widget()));
        assert!(!locks.insert(widget()));
        assert_eq!(locks.snapshot(), vec![widget()]);

        assert!(locks.remove(&widget()));
        assert!(!locks.remove(&widget()));
        assert!(locks.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_acquire_records_and_release_forgets() {
        let server = PassthroughServer::start();
        let conn = connect(&server).await;

        let guard = acquire(&conn, &widget()).await.unwrap();
        assert_eq!(conn.held_write_locks(), vec![widget()]);
        assert!(server.lock_holder(widget().key).await.unwrap().is_some());

        guard.release().await.unwrap();
        assert!(conn.held_write_locks().is_empty());
        assert!(server.lock_holder(widget().key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_try_acquire_busy_returns_none_and_records_nothing() {
        let server = PassthroughServer::start();
        server.lock_externally(widget().key).await.unwrap();
        let conn = connect(&server).await;

        let guard = try_acquire(&conn, &widget()).await.unwrap();
        assert!(guard.is_none());
        assert!(conn.held_write_locks().is_empty());
    }

    #[tokio::test]
    async fn test_try_acquire_is_not_reentrant_on_one_connection() {
        let server = PassthroughServer::start();
        let conn = connect(&server).await;

        let first = try_acquire(&conn, &widget()).await.unwrap().expect("free lock");
        assert!(try_acquire(&conn, &widget()).await.unwrap().is_none());
        first.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_not_held_is_unexpected() {
        let server = PassthroughServer::start();
        let conn = connect(&server).await;

        let result = release(&conn, &widget()).await;
        assert!(matches!(
            result,
            Err(ClientError::Unexpected {
                operation: "lock_release",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_in_background() {
        let server = PassthroughServer::start();
        let conn = connect(&server).await;

        let guard = acquire(&conn, &widget()).await.unwrap();
        drop(guard);

        let mut released = false;
        for _ in 0..100 {
            if server.lock_holder(widget().key).await.unwrap().is_none()
                && conn.held_write_locks().is_empty()
            {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(released, "dropped guard should release the lock");
    }
}
