//! Entity messages and the factory functions that build them.
//!
//! A [`Message`] is an immutable description of one client → server
//! operation. Callers never assemble one by hand: each operation has a
//! factory (`Message::fetch`, `Message::create`, ...) that fills in the
//! kind and validates the fields that operation needs.
//!
//! The factories are pure. The same inputs always produce the same
//! message, and therefore the same encoded bytes.

use serde::{Deserialize, Serialize};

use crate::{EntityIdentity, InstanceId, ProtocolError};

/// What a message asks the server to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum MessageKind {
    /// Look up an existing entity and return its configuration.
    Fetch,
    /// Create a new entity from a serialized configuration.
    Create,
    /// Destroy an existing entity.
    Destroy,
    /// Replace an entity's configuration; the previous one is returned.
    Reconfigure,
    /// Acquire the entity's write lock, waiting until it is granted.
    LockAcquire,
    /// Try to acquire the write lock; answers immediately with one byte.
    LockTryAcquire,
    /// Release a write lock held by this client.
    LockRelease,
}

impl MessageKind {
    /// Returns `true` for the three write-lock operations.
    pub fn is_lock(&self) -> bool {
        matches!(
            self,
            Self::LockAcquire | Self::LockTryAcquire | Self::LockRelease
        )
    }
}

/// One client → server operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The operation.
    pub kind: MessageKind,
    /// The entity the operation targets.
    pub identity: EntityIdentity,
    /// Client instance id; only fetches carry one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<InstanceId>,
    /// Operation-specific opaque bytes (a serialized configuration, or
    /// empty).
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl Message {
    /// Builds a FETCH for `identity`, tagged with the client instance id
    /// the fetched entity will be bound to.
    pub fn fetch(identity: &EntityIdentity, instance: InstanceId) -> Result<Self, ProtocolError> {
        Self::build(MessageKind::Fetch, identity, Some(instance), Vec::new())
    }

    /// Builds a CREATE carrying the serialized configuration.
    pub fn create(identity: &EntityIdentity, config: Vec<u8>) -> Result<Self, ProtocolError> {
        Self::build(MessageKind::Create, identity, None, config)
    }

    /// Builds a DESTROY.
    pub fn destroy(identity: &EntityIdentity) -> Result<Self, ProtocolError> {
        Self::build(MessageKind::Destroy, identity, None, Vec::new())
    }

    /// Builds a RECONFIGURE carrying the new serialized configuration.
    pub fn reconfigure(identity: &EntityIdentity, config: Vec<u8>) -> Result<Self, ProtocolError> {
        Self::build(MessageKind::Reconfigure, identity, None, config)
    }

    /// Builds a blocking write-lock acquisition.
    pub fn lock_acquire(identity: &EntityIdentity) -> Result<Self, ProtocolError> {
        Self::build(MessageKind::LockAcquire, identity, None, Vec::new())
    }

    /// Builds a non-blocking write-lock attempt.
    pub fn lock_try_acquire(identity: &EntityIdentity) -> Result<Self, ProtocolError> {
        Self::build(MessageKind::LockTryAcquire, identity, None, Vec::new())
    }

    /// Builds a write-lock release.
    pub fn lock_release(identity: &EntityIdentity) -> Result<Self, ProtocolError> {
        Self::build(MessageKind::LockRelease, identity, None, Vec::new())
    }

    fn build(
        kind: MessageKind,
        identity: &EntityIdentity,
        instance: Option<InstanceId>,
        payload: Vec<u8>,
    ) -> Result<Self, ProtocolError> {
        if identity.entity_type().as_str().is_empty() {
            return Err(ProtocolError::InvalidMessage(format!(
                "{kind:?} requires an entity type"
            )));
        }
        if identity.name().as_str().is_empty() {
            return Err(ProtocolError::InvalidMessage(format!(
                "{kind:?} on {} requires an entity name",
                identity.entity_type()
            )));
        }
        let needs_payload = matches!(kind, MessageKind::Create | MessageKind::Reconfigure);
        if needs_payload && payload.is_empty() {
            return Err(ProtocolError::InvalidMessage(format!(
                "{kind:?} on {identity} requires a configuration"
            )));
        }

        Ok(Self {
            kind,
            identity: identity.clone(),
            instance,
            payload,
        })
    }
}

/// Reply byte the server sends when a try-lock succeeds.
pub const TRY_LOCK_GRANTED: u8 = 0x01;

/// Reply byte the server sends when a try-lock is refused.
pub const TRY_LOCK_REFUSED: u8 = 0x00;

/// Decodes the one-byte reply to a try-lock.
///
/// `0x00` means refused, anything else means granted.
///
/// # Errors
/// Returns [`ProtocolError::InvalidMessage`] if the reply is not exactly
/// one byte long.
pub fn decode_try_lock_reply(reply: &[u8]) -> Result<bool, ProtocolError> {
    match reply {
        [byte] => Ok(*byte != TRY_LOCK_REFUSED),
        other => Err(ProtocolError::InvalidMessage(format!(
            "try-lock reply must be exactly 1 byte, got {}",
            other.len()
        ))),
    }
}

/// Encodes the one-byte reply to a try-lock.
pub fn encode_try_lock_reply(granted: bool) -> Vec<u8> {
    if granted {
        vec![TRY_LOCK_GRANTED]
    } else {
        vec![TRY_LOCK_REFUSED]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Version;

    fn widget() -> EntityIdentity {
        EntityIdentity::new("Widget", "w1", Version(1))
    }

    #[test]
    fn test_fetch_carries_instance_id_and_empty_payload() {
        let msg = Message::fetch(&widget(), InstanceId(7)).unwrap();

        assert_eq!(msg.kind, MessageKind::Fetch);
        assert_eq!(msg.instance, Some(InstanceId(7)));
        assert!(msg.payload.is_empty());
        assert_eq!(msg.identity, widget());
    }

    #[test]
    fn test_create_without_config_is_rejected() {
        let result = Message::create(&widget(), Vec::new());
        assert!(matches!(result, Err(ProtocolError::InvalidMessage(_))));
    }

    #[test]
    fn test_reconfigure_without_config_is_rejected() {
        let result = Message::reconfigure(&widget(), Vec::new());
        assert!(matches!(result, Err(ProtocolError::InvalidMessage(_))));
    }

    #[test]
    fn test_empty_name_is_rejected_for_every_kind() {
        let nameless = EntityIdentity::new("Widget", "", Version(1));

        assert!(Message::fetch(&nameless, InstanceId(1)).is_err());
        assert!(Message::create(&nameless, vec![1]).is_err());
        assert!(Message::destroy(&nameless).is_err());
        assert!(Message::reconfigure(&nameless, vec![1]).is_err());
        assert!(Message::lock_acquire(&nameless).is_err());
        assert!(Message::lock_try_acquire(&nameless).is_err());
        assert!(Message::lock_release(&nameless).is_err());
    }

    #[test]
    fn test_empty_type_is_rejected() {
        let typeless = EntityIdentity::new("", "w1", Version(1));
        assert!(Message::destroy(&typeless).is_err());
    }

    #[test]
    fn test_factories_are_deterministic() {
        let a = Message::create(&widget(), b"{\"size\":3}".to_vec()).unwrap();
        let b = Message::create(&widget(), b"{\"size\":3}".to_vec()).unwrap();

        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
    }

    #[test]
    fn test_lock_kinds_are_flagged() {
        assert!(MessageKind::LockAcquire.is_lock());
        assert!(MessageKind::LockTryAcquire.is_lock());
        assert!(MessageKind::LockRelease.is_lock());
        assert!(!MessageKind::Create.is_lock());
    }

    #[test]
    fn test_message_without_instance_omits_field() {
        let msg = Message::destroy(&widget()).unwrap();
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["kind"], "Destroy");
        assert!(json.get("instance").is_none());
    }

    #[test]
    fn test_decode_try_lock_reply_values() {
        assert!(decode_try_lock_reply(&[0x01]).unwrap());
        assert!(decode_try_lock_reply(&[0x7f]).unwrap());
        assert!(!decode_try_lock_reply(&[0x00]).unwrap());
    }

    #[test]
    fn test_decode_try_lock_reply_wrong_length_is_invalid() {
        assert!(decode_try_lock_reply(&[]).is_err());
        assert!(decode_try_lock_reply(&[1, 0]).is_err());
    }

    #[test]
    fn test_encode_try_lock_reply_matches_decoder() {
        assert!(decode_try_lock_reply(&encode_try_lock_reply(true)).unwrap());
        assert!(!decode_try_lock_reply(&encode_try_lock_reply(false)).unwrap());
    }
}
