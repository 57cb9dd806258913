//! Identity types shared by the client and the server.
//!
//! Every request on the wire names the entity it targets. An entity is
//! designated by three things: the *type* it belongs to, the *name* of the
//! instance, and the *version* of the type the caller was built against.
//!
//! ```text
//! EntityIdentity
//! ├── EntityKey          ← what the server locks on
//! │   ├── EntityType     "Widget"
//! │   └── EntityName     "w1"
//! └── Version            1
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// The protocol version spoken by this crate. Sent in the `Hello` frame;
/// the server rejects clients that speak anything else.
pub const PROTOCOL_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Entity naming
// ---------------------------------------------------------------------------

/// Identifier of an entity type, e.g. `"Widget"`.
///
/// Newtype over `String` so it can't be confused with an [`EntityName`]
/// in function signatures. `#[serde(transparent)]` keeps the wire form a
/// plain JSON string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(String);

impl EntityType {
    /// Creates a type identifier from anything string-like.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for EntityType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Name of one entity instance within its type, e.g. `"w1"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityName(String);

impl EntityName {
    /// Creates an entity name from anything string-like.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for EntityName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Version of an entity type. Client and server must agree on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub u64);

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Composite identities
// ---------------------------------------------------------------------------

/// A `(type, name)` pair. Write locks are keyed by this: two clients
/// built against different versions still contend for the same lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    /// The entity's type.
    pub entity_type: EntityType,
    /// The entity's instance name.
    pub name: EntityName,
}

impl EntityKey {
    /// Builds a key from a type and a name.
    pub fn new(entity_type: impl Into<EntityType>, name: impl Into<EntityName>) -> Self {
        Self {
            entity_type: entity_type.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.name)
    }
}

/// The full identity triple `(type, name, version)` of one logical
/// server-side entity.
///
/// Immutable once an entity reference is built. The client's lock
/// ownership set is keyed by this, so a reconnect can replay the exact
/// lock request that was originally granted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityIdentity {
    /// Type and name.
    pub key: EntityKey,
    /// The version the client was built against.
    pub version: Version,
}

impl EntityIdentity {
    /// Builds an identity from its three parts.
    pub fn new(
        entity_type: impl Into<EntityType>,
        name: impl Into<EntityName>,
        version: Version,
    ) -> Self {
        Self {
            key: EntityKey::new(entity_type, name),
            version,
        }
    }

    /// The entity's type.
    pub fn entity_type(&self) -> &EntityType {
        &self.key.entity_type
    }

    /// The entity's instance name.
    pub fn name(&self) -> &EntityName {
        &self.key.name
    }
}

impl fmt::Display for EntityIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.key, self.version)
    }
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Client-side instance id. Allocated once per fetch so that several
/// client instances backed by the same server entity can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I-{}", self.0)
    }
}

/// Correlates one request with the server's `Ack` and `Complete` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T-{}", self.0)
    }
}

/// Server-assigned id of one connected channel. A reconnect gets a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_type_serializes_as_plain_string() {
        let json = serde_json::to_string(&EntityType::new("Widget")).unwrap();
        assert_eq!(json, "\"Widget\"");
    }

    #[test]
    fn test_version_serializes_as_plain_number() {
        let json = serde_json::to_string(&Version(3)).unwrap();
        assert_eq!(json, "3");
    }

    #[test]
    fn test_identity_display_includes_all_three_parts() {
        let id = EntityIdentity::new("Widget", "w1", Version(2));
        assert_eq!(id.to_string(), "Widget:w1@v2");
    }

    #[test]
    fn test_identities_with_different_versions_share_a_key() {
        let a = EntityIdentity::new("Widget", "w1", Version(1));
        let b = EntityIdentity::new("Widget", "w1", Version(2));
        assert_ne!(a, b);
        assert_eq!(a.key, b.key);
    }

    #[test]
    fn test_counter_displays() {
        assert_eq!(InstanceId(4).to_string(), "I-4");
        assert_eq!(TransactionId(9).to_string(), "T-9");
        assert_eq!(SessionId(1).to_string(), "S-1");
    }
}
