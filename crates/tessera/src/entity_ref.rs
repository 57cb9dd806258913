//! Typed references to server-side entities.
//!
//! Every operation follows the same shape:
//!
//! ```text
//! [lock] → send → await retirement → classify → [release lock]
//! ```
//!
//! Classification is per operation: each one lets through only the
//! [`EntityError`] kinds a caller can act on and turns everything else
//! (unexpected refusals, connection loss) into
//! [`ClientError::Unexpected`]. Locks are released on every exit path.

use std::fmt;
use std::sync::Arc;

use tessera_protocol::{EntityError, EntityIdentity, EntityName, Message};

use crate::locks::{self, WriteLockGuard};
use crate::service::{Entity, EntityClientService};
use crate::{ClientError, Connection, RequestError};

/// A reference to the server-side entity of type `E` with configuration
/// `C`. Holds no state between calls and can be shared freely.
pub struct EntityRef<E: Entity, C: Send + Sync + 'static> {
    connection: Connection,
    identity: EntityIdentity,
    service: Option<Arc<dyn EntityClientService<E, Config = C>>>,
}

impl<E, C> EntityRef<E, C>
where
    E: Entity,
    C: Send + Sync + 'static,
{
    pub(crate) fn new(
        connection: Connection,
        identity: EntityIdentity,
        service: Option<Arc<dyn EntityClientService<E, Config = C>>>,
    ) -> Self {
        Self {
            connection,
            identity,
            service,
        }
    }

    pub fn name(&self) -> &EntityName {
        self.identity.name()
    }

    pub fn identity(&self) -> &EntityIdentity {
        &self.identity
    }

    /// Fetches a new client-side instance of the entity.
    ///
    /// # Errors
    /// `NotFound` if no such entity exists, `VersionMismatch` if it exists
    /// at another version. Anything else is `Unexpected`.
    pub async fn fetch_entity(&self) -> Result<E, ClientError> {
        let instance_id = self.connection.new_instance_id();
        let message = Message::fetch(&self.identity, instance_id)?;

        match self.connection.send_message(message).result().await {
            Ok(raw_config) => {
                tracing::debug!(identity = %self.identity, %instance_id, "entity fetched");
                Ok(self.connection.create_entity_instance(
                    self.service.as_deref(),
                    self.identity.clone(),
                    instance_id,
                    raw_config,
                ))
            }
            Err(RequestError::Entity(
                e @ (EntityError::NotFound { .. } | EntityError::VersionMismatch { .. }),
            )) => Err(e.into()),
            Err(e) => Err(self.unexpected("fetch", e)),
        }
    }

    /// Creates the entity with `config`.
    ///
    /// Fails fast with `AlreadyExists`, without sending the create, when
    /// someone else holds the entity's write lock.
    ///
    /// # Errors
    /// `NotProvided` without a client service or when the server does not
    /// provide the type, `AlreadyExists`, `VersionMismatch`.
    pub async fn create(&self, config: &C) -> Result<(), ClientError> {
        let service = self.require_service()?;

        let Some(guard) = locks::try_acquire(&self.connection, &self.identity).await? else {
            tracing::debug!(
                identity = %self.identity,
                "write lock busy, treating entity as existing"
            );
            return Err(EntityError::already_exists(&self.identity.key).into());
        };

        let outcome = self.send_create(service, config).await;
        guard.release().await?;
        outcome
    }

    async fn send_create(
        &self,
        service: &dyn EntityClientService<E, Config = C>,
        config: &C,
    ) -> Result<(), ClientError> {
        let bytes = service.serialize_configuration(config)?;
        let message = Message::create(&self.identity, bytes)?;

        match self.connection.send_message(message).result().await {
            Ok(_) => {
                tracing::info!(identity = %self.identity, "entity created");
                Ok(())
            }
            Err(RequestError::Entity(
                e @ (EntityError::NotProvided { .. }
                | EntityError::AlreadyExists { .. }
                | EntityError::VersionMismatch { .. }),
            )) => Err(e.into()),
            Err(e) => Err(self.unexpected("create", e)),
        }
    }

    /// Replaces the entity's configuration and returns the previous one.
    ///
    /// # Errors
    /// Every refusal from the server is passed through. Only
    /// connection-level failures are `Unexpected`.
    pub async fn reconfigure(&self, config: &C) -> Result<C, ClientError> {
        let service = self.require_service()?;
        let bytes = service.serialize_configuration(config)?;
        let message = Message::reconfigure(&self.identity, bytes)?;

        match self.connection.send_message(message).result().await {
            Ok(previous) => {
                tracing::info!(identity = %self.identity, "entity reconfigured");
                Ok(service.deserialize_configuration(&previous)?)
            }
            Err(RequestError::Entity(e)) => Err(e.into()),
            Err(e) => Err(self.unexpected("reconfigure", e)),
        }
    }

    /// Destroys the entity, waiting for its write lock if necessary.
    ///
    /// # Errors
    /// `NotProvided`, `NotFound`.
    pub async fn destroy(&self) -> Result<(), ClientError> {
        let guard = locks::acquire(&self.connection, &self.identity).await?;
        self.destroy_locked(guard).await
    }

    /// Destroys the entity only if its write lock is free right now.
    ///
    /// Returns `Ok(false)`, without sending the destroy, if the lock is
    /// held elsewhere.
    ///
    /// # Errors
    /// `NotProvided`, `NotFound`.
    pub async fn try_destroy(&self) -> Result<bool, ClientError> {
        let Some(guard) = locks::try_acquire(&self.connection, &self.identity).await? else {
            tracing::debug!(identity = %self.identity, "write lock busy, not destroying");
            return Ok(false);
        };
        self.destroy_locked(guard).await?;
        Ok(true)
    }

    async fn destroy_locked(&self, guard: WriteLockGuard) -> Result<(), ClientError> {
        let outcome = self.send_destroy().await;
        guard.release().await?;
        outcome
    }

    async fn send_destroy(&self) -> Result<(), ClientError> {
        let message = Message::destroy(&self.identity)?;

        match self.connection.send_message(message).result().await {
            Ok(_) => {
                tracing::info!(identity = %self.identity, "entity destroyed");
                Ok(())
            }
            Err(RequestError::Entity(
                e @ (EntityError::NotProvided { .. } | EntityError::NotFound { .. }),
            )) => Err(e.into()),
            Err(e) => Err(self.unexpected("destroy", e)),
        }
    }

    fn require_service(&self) -> Result<&dyn EntityClientService<E, Config = C>, ClientError> {
        self.service
            .as_deref()
            .ok_or_else(|| EntityError::not_provided(&self.identity.key).into())
    }

    fn unexpected(&self, operation: &'static str, error: RequestError) -> ClientError {
        ClientError::unexpected(operation, &self.identity, error)
    }
}

impl<E: Entity, C: Send + Sync + 'static> Clone for EntityRef<E, C> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            identity: self.identity.clone(),
            service: self.service.clone(),
        }
    }
}

impl<E: Entity, C: Send + Sync + 'static> fmt::Debug for EntityRef<E, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRef")
            .field("identity", &self.identity)
            .field("has_service", &self.service.is_some())
            .finish()
    }
}
