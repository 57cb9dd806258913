//! Error types for the protocol layer.
//!
//! Two families live here:
//!
//! - [`ProtocolError`]: something went wrong turning values into bytes or
//!   back, or a message broke a protocol rule.
//! - [`EntityError`]: the *server* refused an entity operation. These
//!   travel on the wire inside a `Complete` frame, so they derive serde.

use serde::{Deserialize, Serialize};

use crate::{EntityKey, EntityName, EntityType, Version};

/// Errors that can occur in the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a Rust value into bytes).
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed (turning bytes into a Rust value).
    ///
    /// Common causes: malformed JSON, missing fields, truncated frames.
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The message is invalid at the protocol level: an empty entity
    /// name, a create without a configuration, a try-lock reply that is
    /// not exactly one byte.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

/// A typed failure reported by the server for one entity operation.
///
/// Every variant carries the entity type and name so callers can report
/// precisely which entity was involved. Call sites match only the
/// variants they expect; see the entity reference for the per-operation
/// sets.
///
/// `#[serde(tag = "kind")]` gives internally tagged JSON:
/// `{ "kind": "NotFound", "entity_type": "Widget", "name": "w1" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind")]
pub enum EntityError {
    /// No server-side entity exists with this type and name.
    #[error("entity {entity_type}:{name} not found")]
    NotFound {
        entity_type: EntityType,
        name: EntityName,
    },

    /// A create targeted an entity that already exists (or whose lock is
    /// held by someone else, which the client treats as existence).
    #[error("entity {entity_type}:{name} already exists")]
    AlreadyExists {
        entity_type: EntityType,
        name: EntityName,
    },

    /// Client and server disagree on the entity type's version.
    #[error("entity {entity_type}:{name} version mismatch: expected {expected}, got {actual}")]
    VersionMismatch {
        entity_type: EntityType,
        name: EntityName,
        /// The version the server supports.
        expected: Version,
        /// The version the client asked for.
        actual: Version,
    },

    /// Nobody provides this entity type (no client service registered on
    /// the client, or no server-side provider).
    #[error("entity type {entity_type} not provided (entity {name})")]
    NotProvided {
        entity_type: EntityType,
        name: EntityName,
    },

    /// Any other server-side failure.
    #[error("entity {entity_type}:{name} failed: {reason}")]
    Other {
        entity_type: EntityType,
        name: EntityName,
        reason: String,
    },
}

impl EntityError {
    /// Builds a [`EntityError::NotFound`] for `key`.
    pub fn not_found(key: &EntityKey) -> Self {
        Self::NotFound {
            entity_type: key.entity_type.clone(),
            name: key.name.clone(),
        }
    }

    /// Builds a [`EntityError::AlreadyExists`] for `key`.
    pub fn already_exists(key: &EntityKey) -> Self {
        Self::AlreadyExists {
            entity_type: key.entity_type.clone(),
            name: key.name.clone(),
        }
    }

    /// Builds a [`EntityError::VersionMismatch`] for `key`.
    pub fn version_mismatch(key: &EntityKey, expected: Version, actual: Version) -> Self {
        Self::VersionMismatch {
            entity_type: key.entity_type.clone(),
            name: key.name.clone(),
            expected,
            actual,
        }
    }

    /// Builds a [`EntityError::NotProvided`] for `key`.
    pub fn not_provided(key: &EntityKey) -> Self {
        Self::NotProvided {
            entity_type: key.entity_type.clone(),
            name: key.name.clone(),
        }
    }

    /// Builds a [`EntityError::Other`] for `key`.
    pub fn other(key: &EntityKey, reason: impl Into<String>) -> Self {
        Self::Other {
            entity_type: key.entity_type.clone(),
            name: key.name.clone(),
            reason: reason.into(),
        }
    }

    /// The type of the entity this error is about.
    pub fn entity_type(&self) -> &EntityType {
        match self {
            Self::NotFound { entity_type, .. }
            | Self::AlreadyExists { entity_type, .. }
            | Self::VersionMismatch { entity_type, .. }
            | Self::NotProvided { entity_type, .. }
            | Self::Other { entity_type, .. } => entity_type,
        }
    }

    /// The name of the entity this error is about.
    pub fn name(&self) -> &EntityName {
        match self {
            Self::NotFound { name, .. }
            | Self::AlreadyExists { name, .. }
            | Self::VersionMismatch { name, .. }
            | Self::NotProvided { name, .. }
            | Self::Other { name, .. } => name,
        }
    }
}
