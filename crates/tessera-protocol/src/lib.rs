//! Wire protocol for Tessera.
//!
//! This crate defines what a client and a server say to each other about
//! entities:
//!
//! - **Types** ([`EntityIdentity`], [`EntityKey`], [`Version`], ...):
//!   how an entity is named.
//! - **Messages** ([`Message`], [`MessageKind`]): one entity operation,
//!   built by pure factory functions.
//! - **Frames** ([`ClientFrame`], [`ServerFrame`], [`Outcome`]): the
//!   envelopes that actually cross the channel.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): frames to bytes and back.
//! - **Errors** ([`ProtocolError`], [`EntityError`]).
//!
//! # Architecture
//!
//! ```text
//! Transport (bytes) → Protocol (frames) → Client core (waits, entity refs)
//! ```
//!
//! The protocol layer knows nothing about connections or locks held by a
//! particular client; it only knows what the messages look like.

mod codec;
mod error;
mod frame;
mod message;
mod types;

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::{EntityError, ProtocolError};
pub use frame::{ClientFrame, Outcome, ServerFrame};
pub use message::{
    Message, MessageKind, TRY_LOCK_GRANTED, TRY_LOCK_REFUSED, decode_try_lock_reply,
    encode_try_lock_reply,
};
pub use types::{
    EntityIdentity, EntityKey, EntityName, EntityType, InstanceId, PROTOCOL_VERSION, SessionId,
    TransactionId, Version,
};
