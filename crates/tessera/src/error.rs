//! Error types for the client core.

use std::fmt;

use tessera_protocol::{EntityError, EntityIdentity, ProtocolError};

/// Why a single request did not produce a payload.
///
/// Returned by [`Wait::result`](crate::Wait::result). `Clone` so the
/// cached outcome can be handed out more than once.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// The server refused the operation.
    #[error(transparent)]
    Entity(#[from] EntityError),

    /// The channel dropped after the request was sent and before it
    /// retired. The server may or may not have applied it.
    #[error("connection lost before the request retired")]
    ConnectionLost,

    /// The connection is closed or failed for good; the request was never
    /// (or will never be) answered.
    #[error("connection closed")]
    Closed,
}

/// Top-level error for connection setup and entity operations.
///
/// Each entity operation passes through only the [`EntityError`] kinds
/// its caller can act on. Everything else is folded into
/// [`ClientError::Unexpected`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// An expected, typed refusal from the server.
    #[error(transparent)]
    Entity(#[from] EntityError),

    /// A configuration could not be encoded or decoded, or a message was
    /// malformed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The channel could not be opened or the handshake did not finish.
    #[error("connect failed: {reason}")]
    Connect { reason: String },

    /// The server refused the handshake.
    #[error("server rejected the connection: {reason}")]
    Rejected { reason: String },

    /// A failure the operation has no recovery for.
    #[error("unexpected failure in {operation} on {identity}: {reason}")]
    Unexpected {
        operation: &'static str,
        identity: EntityIdentity,
        reason: String,
    },
}

impl ClientError {
    /// Builds an [`Unexpected`](Self::Unexpected) error and logs it.
    pub(crate) fn unexpected(
        operation: &'static str,
        identity: &EntityIdentity,
        reason: impl fmt::Display,
    ) -> Self {
        let reason = reason.to_string();
        tracing::error!(operation, %identity, %reason, "unexpected entity failure");
        Self::Unexpected {
            operation,
            identity: identity.clone(),
            reason,
        }
    }

    /// The typed server refusal, if this is one.
    pub fn entity_error(&self) -> Option<&EntityError> {
        match self {
            Self::Entity(e) => Some(e),
            _ => None,
        }
    }
}
