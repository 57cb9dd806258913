//! Frames: the top-level units that cross the channel.
//!
//! ```text
//! client                                  server
//!   │ ── Hello { protocol_version } ──────→ │
//!   │ ←───────────── Welcome { session } ── │
//!   │ ── Request { T-1, Message } ────────→ │
//!   │ ←─────────────────────── Ack { T-1 } ─│   ordered
//!   │ ←────────── Complete { T-1, outcome } │   retired
//! ```
//!
//! `Ack` always precedes `Complete` for the same transaction. Acks arrive
//! in request order; completions may not.

use serde::{Deserialize, Serialize};

use crate::{EntityError, Message, SessionId, TransactionId};

/// Everything a client sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// First frame on every (re)connection.
    Hello { protocol_version: u32 },

    /// One entity operation.
    Request {
        transaction: TransactionId,
        message: Message,
    },
}

/// Everything a server sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// Handshake accepted; the channel now belongs to `session`.
    Welcome { session: SessionId },

    /// Handshake refused.
    Rejected { reason: String },

    /// The server has ordered the request. Its result may still be pending.
    Ack { transaction: TransactionId },

    /// The request is finished.
    Complete {
        transaction: TransactionId,
        outcome: Outcome,
    },
}

/// The terminal result of one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Outcome {
    /// The operation succeeded. `payload` is operation specific: a
    /// configuration for fetch/reconfigure, one byte for try-lock, empty
    /// otherwise.
    Success {
        #[serde(default)]
        payload: Vec<u8>,
    },

    /// The server refused the operation.
    Failure { error: EntityError },
}

impl Outcome {
    /// A success with an empty payload.
    pub fn empty() -> Self {
        Self::Success {
            payload: Vec::new(),
        }
    }

    /// Converts into a plain `Result`.
    pub fn into_result(self) -> Result<Vec<u8>, EntityError> {
        match self {
            Self::Success { payload } => Ok(payload),
            Self::Failure { error } => Err(error),
        }
    }
}

impl From<Result<Vec<u8>, EntityError>> for Outcome {
    fn from(result: Result<Vec<u8>, EntityError>) -> Self {
        match result {
            Ok(payload) => Self::Success { payload },
            Err(error) => Self::Failure { error },
        }
    }
}
