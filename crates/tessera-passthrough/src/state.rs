//! Server-side entity and lock state, with no I/O.
//!
//! [`ServerState`] is a plain struct driven by the server actor: every
//! request goes in through [`ServerState::handle`], and the frames to send
//! back come out as a list of [`Reply`] values. Keeping it synchronous
//! makes the lock and lifecycle rules testable without a runtime.
//!
//! # Write locks
//!
//! One exclusive holder per [`EntityKey`], plus a FIFO of blocked
//! acquirers. Locks are not reentrant: a session that already holds a
//! lock and asks again waits (or is refused, for a try-lock) like anyone
//! else, so two tasks sharing one client connection still exclude each
//! other.

use std::collections::{HashMap, VecDeque};

use tessera_protocol::{
    EntityError, EntityIdentity, EntityKey, EntityType, Message, MessageKind, Outcome,
    ServerFrame, SessionId, TransactionId, Version, encode_try_lock_reply,
};

/// Session id used for locks taken through the server's test hooks.
/// Real sessions are numbered from 1.
pub const EXTERNAL_SESSION: SessionId = SessionId(0);

/// A frame addressed to one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Who receives the frame.
    pub session: SessionId,
    /// The frame itself.
    pub frame: ServerFrame,
}

/// One request as the server saw it, in processing order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedRequest {
    /// The session that sent it.
    pub session: SessionId,
    /// The operation.
    pub kind: MessageKind,
    /// The targeted entity.
    pub identity: EntityIdentity,
}

#[derive(Debug)]
struct StoredEntity {
    version: Version,
    config: Vec<u8>,
}

#[derive(Debug)]
struct LockState {
    holder: SessionId,
    waiters: VecDeque<(SessionId, TransactionId)>,
}

/// All server-side state.
#[derive(Debug, Default)]
pub struct ServerState {
    types: HashMap<EntityType, Version>,
    entities: HashMap<EntityKey, StoredEntity>,
    locks: HashMap<EntityKey, LockState>,
    history: Vec<ProcessedRequest>,
}

impl ServerState {
    /// Creates an empty state with no registered types.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or re-registers) the version this server provides for
    /// an entity type. Unregistered types answer `NotProvided`.
    pub fn register_type(&mut self, entity_type: EntityType, version: Version) {
        self.types.insert(entity_type, version);
    }

    /// Processes one request from `session`.
    ///
    /// Always returns the `Ack` first. A `Complete` follows immediately
    /// unless the request is a blocking lock acquisition that has to wait.
    pub fn handle(
        &mut self,
        session: SessionId,
        transaction: TransactionId,
        message: Message,
    ) -> Vec<Reply> {
        self.history.push(ProcessedRequest {
            session,
            kind: message.kind,
            identity: message.identity.clone(),
        });

        let mut replies = vec![Reply {
            session,
            frame: ServerFrame::Ack { transaction },
        }];
        let key = message.identity.key.clone();

        let result = match message.kind {
            MessageKind::Fetch => self.fetch(&message.identity),
            MessageKind::Create => self.create(&message.identity, message.payload),
            MessageKind::Destroy => self.destroy(&message.identity),
            MessageKind::Reconfigure => self.reconfigure(&message.identity, message.payload),
            MessageKind::LockAcquire => {
                if self.try_lock(&key, session) {
                    Ok(Vec::new())
                } else {
                    tracing::debug!(%key, %session, %transaction, "lock busy, queueing waiter");
                    if let Some(lock) = self.locks.get_mut(&key) {
                        lock.waiters.push_back((session, transaction));
                    }
                    return replies;
                }
            }
            MessageKind::LockTryAcquire => Ok(encode_try_lock_reply(self.try_lock(&key, session))),
            MessageKind::LockRelease => match self.unlock(&key, session) {
                Some(granted) => {
                    replies.extend(granted);
                    Ok(Vec::new())
                }
                None => Err(EntityError::other(
                    &key,
                    format!("write lock not held by {session}"),
                )),
            },
        };

        replies.push(complete(session, transaction, result));
        replies
    }

    /// Forgets a session: drops its queued lock waits and releases every
    /// lock it holds, granting each to the next waiter.
    pub fn drop_session(&mut self, session: SessionId) -> Vec<Reply> {
        for lock in self.locks.values_mut() {
            lock.waiters.retain(|(waiter, _)| *waiter != session);
        }

        let held: Vec<EntityKey> = self
            .locks
            .iter()
            .filter(|(_, lock)| lock.holder == session)
            .map(|(key, _)| key.clone())
            .collect();

        let mut replies = Vec::new();
        for key in held {
            tracing::debug!(%key, %session, "releasing lock of closed session");
            if let Some(granted) = self.unlock(&key, session) {
                replies.extend(granted);
            }
        }
        replies
    }

    /// Takes `key`'s lock on behalf of [`EXTERNAL_SESSION`] if it is free.
    pub fn lock_externally(&mut self, key: &EntityKey) -> bool {
        self.try_lock(key, EXTERNAL_SESSION)
    }

    /// Releases an externally held lock. Returns `None` if the external
    /// session did not hold it.
    pub fn unlock_externally(&mut self, key: &EntityKey) -> Option<Vec<Reply>> {
        self.unlock(key, EXTERNAL_SESSION)
    }

    /// The session currently holding `key`'s write lock.
    pub fn lock_holder(&self, key: &EntityKey) -> Option<SessionId> {
        self.locks.get(key).map(|lock| lock.holder)
    }

    /// Whether an entity exists under `key`.
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entities.contains_key(key)
    }

    /// Every request processed so far, oldest first.
    pub fn history(&self) -> &[ProcessedRequest] {
        &self.history
    }

    // -- Entity lifecycle -------------------------------------------------

    fn fetch(&self, identity: &EntityIdentity) -> Result<Vec<u8>, EntityError> {
        let stored = self
            .entities
            .get(&identity.key)
            .ok_or_else(|| EntityError::not_found(&identity.key))?;
        if stored.version != identity.version {
            return Err(EntityError::version_mismatch(
                &identity.key,
                stored.version,
                identity.version,
            ));
        }
        Ok(stored.config.clone())
    }

    fn create(
        &mut self,
        identity: &EntityIdentity,
        config: Vec<u8>,
    ) -> Result<Vec<u8>, EntityError> {
        let provided = self.provided_version(identity)?;
        if provided != identity.version {
            return Err(EntityError::version_mismatch(
                &identity.key,
                provided,
                identity.version,
            ));
        }
        if self.entities.contains_key(&identity.key) {
            return Err(EntityError::already_exists(&identity.key));
        }

        self.entities.insert(
            identity.key.clone(),
            StoredEntity {
                version: identity.version,
                config,
            },
        );
        tracing::info!(%identity, "entity created");
        Ok(Vec::new())
    }

    fn destroy(&mut self, identity: &EntityIdentity) -> Result<Vec<u8>, EntityError> {
        self.provided_version(identity)?;
        self.entities
            .remove(&identity.key)
            .ok_or_else(|| EntityError::not_found(&identity.key))?;
        tracing::info!(%identity, "entity destroyed");
        Ok(Vec::new())
    }

    fn reconfigure(
        &mut self,
        identity: &EntityIdentity,
        config: Vec<u8>,
    ) -> Result<Vec<u8>, EntityError> {
        self.provided_version(identity)?;
        let stored = self
            .entities
            .get_mut(&identity.key)
            .ok_or_else(|| EntityError::not_found(&identity.key))?;
        if stored.version != identity.version {
            return Err(EntityError::version_mismatch(
                &identity.key,
                stored.version,
                identity.version,
            ));
        }
        tracing::info!(%identity, "entity reconfigured");
        Ok(std::mem::replace(&mut stored.config, config))
    }

    fn provided_version(&self, identity: &EntityIdentity) -> Result<Version, EntityError> {
        self.types
            .get(identity.entity_type())
            .copied()
            .ok_or_else(|| EntityError::not_provided(&identity.key))
    }

    // -- Write locks ------------------------------------------------------

    fn try_lock(&mut self, key: &EntityKey, session: SessionId) -> bool {
        if self.locks.contains_key(key) {
            return false;
        }
        self.locks.insert(
            key.clone(),
            LockState {
                holder: session,
                waiters: VecDeque::new(),
            },
        );
        true
    }

    /// Releases `session`'s hold on `key`. Returns the `Complete` for the
    /// waiter that now owns the lock (if any), or `None` if `session` was
    /// not the holder.
    fn unlock(&mut self, key: &EntityKey, session: SessionId) -> Option<Vec<Reply>> {
        let lock = self.locks.get_mut(key)?;
        if lock.holder != session {
            return None;
        }

        match lock.waiters.pop_front() {
            Some((next, transaction)) => {
                lock.holder = next;
                tracing::debug!(%key, from = %session, to = %next, "lock handed over");
                Some(vec![complete(next, transaction, Ok(Vec::new()))])
            }
            None => {
                self.locks.remove(key);
                Some(Vec::new())
            }
        }
    }
}

fn complete(
    session: SessionId,
    transaction: TransactionId,
    result: Result<Vec<u8>, EntityError>,
) -> Reply {
    Reply {
        session,
        frame: ServerFrame::Complete {
            transaction,
            outcome: Outcome::from(result),
        },
    }
}

#[cfg(test)]
mod tests {
    use tessera_protocol::InstanceId;

    use super::*;

    const S1: SessionId = SessionId(1);
    const S2: SessionId = SessionId(2);

    fn widget(version: u64) -> EntityIdentity {
        EntityIdentity::new("Widget", "w1", Version(version))
    }

    fn state() -> ServerState {
        let mut state = ServerState::new();
        state.register_type(EntityType::new("Widget"), Version(1));
        state
    }

    fn fetch(version: u64) -> Message {
        Message::fetch(&widget(version), InstanceId(1)).unwrap()
    }

    fn create(version: u64, config: &[u8]) -> Message {
        Message::create(&widget(version), config.to_vec()).unwrap()
    }

    fn reconfigure(version: u64, config: &[u8]) -> Message {
        Message::reconfigure(&widget(version), config.to_vec()).unwrap()
    }

    /// Sends one request and returns the outcome of its `Complete`, or
    /// `None` if only the `Ack` came back.
    fn run(
        state: &mut ServerState,
        session: SessionId,
        txn: u64,
        message: Message,
    ) -> Option<Outcome> {
        let replies = state.handle(session, TransactionId(txn), message);
        assert_eq!(
            replies[0].frame,
            ServerFrame::Ack {
                transaction: TransactionId(txn)
            },
            "ack must come first"
        );
        replies.into_iter().skip(1).find_map(|reply| match reply.frame {
            ServerFrame::Complete { transaction, outcome } if transaction == TransactionId(txn) => {
                Some(outcome)
            }
            _ => None,
        })
    }

    fn ok(outcome: Option<Outcome>) -> Vec<u8> {
        outcome
            .expect("should complete")
            .into_result()
            .expect("should succeed")
    }

    fn err(outcome: Option<Outcome>) -> EntityError {
        outcome
            .expect("should complete")
            .into_result()
            .expect_err("should fail")
    }

    // =====================================================================
    // Lifecycle
    // =====================================================================

    #[test]
    fn test_fetch_missing_entity_is_not_found() {
        let mut s = state();
        let e = err(run(&mut s, S1, 1, fetch(1)));
        assert!(matches!(e, EntityError::NotFound { .. }));
    }

    #[test]
    fn test_create_then_fetch_returns_config() {
        let mut s = state();
        ok(run(&mut s, S1, 1, create(1, b"cfg")));

        let config = ok(run(&mut s, S1, 2, fetch(1)));
        assert_eq!(config, b"cfg");
        assert!(s.contains(&widget(1).key));
    }

    #[test]
    fn test_create_twice_is_already_exists() {
        let mut s = state();
        ok(run(&mut s, S1, 1, create(1, b"a")));
        let e = err(run(&mut s, S1, 2, create(1, b"b")));
        assert!(matches!(e, EntityError::AlreadyExists { .. }));
    }

    #[test]
    fn test_create_unregistered_type_is_not_provided() {
        let mut s = ServerState::new();
        let e = err(run(&mut s, S1, 1, create(1, b"a")));
        assert!(matches!(e, EntityError::NotProvided { .. }));
    }

    #[test]
    fn test_create_wrong_version_is_version_mismatch() {
        let mut s = state();
        let e = err(run(&mut s, S1, 1, create(2, b"a")));
        assert_eq!(
            e,
            EntityError::version_mismatch(&widget(1).key, Version(1), Version(2))
        );
    }

    #[test]
    fn test_fetch_wrong_version_is_version_mismatch() {
        let mut s = state();
        ok(run(&mut s, S1, 1, create(1, b"a")));
        let e = err(run(&mut s, S1, 2, fetch(2)));
        assert!(matches!(e, EntityError::VersionMismatch { .. }));
    }

    #[test]
    fn test_destroy_missing_is_not_found_and_unregistered_is_not_provided() {
        let mut s = state();
        let e = err(run(&mut s, S1, 1, Message::destroy(&widget(1)).unwrap()));
        assert!(matches!(e, EntityError::NotFound { .. }));

        let gadget = EntityIdentity::new("Gadget", "g1", Version(1));
        let e = err(run(&mut s, S1, 2, Message::destroy(&gadget).unwrap()));
        assert!(matches!(e, EntityError::NotProvided { .. }));
    }

    #[test]
    fn test_reconfigure_returns_previous_config() {
        let mut s = state();
        ok(run(&mut s, S1, 1, create(1, b"old")));

        let previous = ok(run(&mut s, S1, 2, reconfigure(1, b"new")));
        assert_eq!(previous, b"old");

        let current = ok(run(&mut s, S1, 3, fetch(1)));
        assert_eq!(current, b"new");
    }

    // =====================================================================
    // Locks
    // =====================================================================

    #[test]
    fn test_try_lock_free_then_busy() {
        let mut s = state();
        let granted = ok(run(&mut s, S1, 1, Message::lock_try_acquire(&widget(1)).unwrap()));
        assert_eq!(granted, vec![1]);

        let refused = ok(run(&mut s, S2, 1, Message::lock_try_acquire(&widget(1)).unwrap()));
        assert_eq!(refused, vec![0]);
    }

    #[test]
    fn test_lock_is_not_reentrant() {
        let mut s = state();
        ok(run(&mut s, S1, 1, Message::lock_try_acquire(&widget(1)).unwrap()));
        let again = ok(run(&mut s, S1, 2, Message::lock_try_acquire(&widget(1)).unwrap()));
        assert_eq!(again, vec![0]);
    }

    #[test]
    fn test_blocking_acquire_waits_until_release() {
        let mut s = state();
        ok(run(&mut s, S1, 1, Message::lock_acquire(&widget(1)).unwrap()));

        // S2 only gets an Ack: it is queued behind S1.
        assert!(run(&mut s, S2, 7, Message::lock_acquire(&widget(1)).unwrap()).is_none());

        // S1 releases; the replies include S2's Complete for T-7.
        let replies = s.handle(S1, TransactionId(2), Message::lock_release(&widget(1)).unwrap());
        assert!(replies.contains(&Reply {
            session: S2,
            frame: ServerFrame::Complete {
                transaction: TransactionId(7),
                outcome: Outcome::empty(),
            },
        }));
        assert_eq!(s.lock_holder(&widget(1).key), Some(S2));
    }

    #[test]
    fn test_release_not_held_is_failure() {
        let mut s = state();
        let e = err(run(&mut s, S1, 1, Message::lock_release(&widget(1)).unwrap()));
        assert!(matches!(e, EntityError::Other { .. }));
    }

    #[test]
    fn test_lock_ignores_version() {
        let mut s = state();
        ok(run(&mut s, S1, 1, Message::lock_try_acquire(&widget(1)).unwrap()));
        let other_version = ok(run(&mut s, S2, 1, Message::lock_try_acquire(&widget(2)).unwrap()));
        assert_eq!(other_version, vec![0]);
    }

    #[test]
    fn test_drop_session_hands_lock_to_waiter() {
        let mut s = state();
        ok(run(&mut s, S1, 1, Message::lock_acquire(&widget(1)).unwrap()));
        assert!(run(&mut s, S2, 4, Message::lock_acquire(&widget(1)).unwrap()).is_none());

        let replies = s.drop_session(S1);

        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].session, S2);
        assert_eq!(s.lock_holder(&widget(1).key), Some(S2));
    }

    #[test]
    fn test_drop_session_discards_its_waiters() {
        let mut s = state();
        ok(run(&mut s, S1, 1, Message::lock_acquire(&widget(1)).unwrap()));
        assert!(run(&mut s, S2, 1, Message::lock_acquire(&widget(1)).unwrap()).is_none());

        s.drop_session(S2);
        let replies = s.handle(S1, TransactionId(2), Message::lock_release(&widget(1)).unwrap());

        assert!(replies.iter().all(|r| r.session == S1));
        assert_eq!(s.lock_holder(&widget(1).key), None);
    }

    #[test]
    fn test_external_lock_blocks_try_lock_until_released() {
        let mut s = state();
        assert!(s.lock_externally(&widget(1).key));

        let refused = ok(run(&mut s, S1, 1, Message::lock_try_acquire(&widget(1)).unwrap()));
        assert_eq!(refused, vec![0]);

        assert!(s.unlock_externally(&widget(1).key).is_some());
        let granted = ok(run(&mut s, S1, 2, Message::lock_try_acquire(&widget(1)).unwrap()));
        assert_eq!(granted, vec![1]);
    }

    #[test]
    fn test_history_records_every_request_in_order() {
        let mut s = state();
        run(&mut s, S1, 1, Message::lock_try_acquire(&widget(1)).unwrap());
        run(&mut s, S2, 1, Message::destroy(&widget(1)).unwrap());

        let kinds: Vec<_> = s.history().iter().map(|p| (p.session, p.kind)).collect();
        assert_eq!(
            kinds,
            vec![(S1, MessageKind::LockTryAcquire), (S2, MessageKind::Destroy)]
        );
    }
}
