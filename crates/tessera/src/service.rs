//! Entity types and their client-side services.
//!
//! An [`Entity`] is the typed client-side object a fetch produces. An
//! [`EntityClientService`] knows how to turn that entity's configuration
//! into bytes and back, and may customise how instances are built.
//! Services are registered per entity type on the connection; references
//! obtained afterwards pick them up automatically.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tessera_protocol::{Codec, EntityIdentity, EntityType, InstanceId, JsonCodec, ProtocolError};

use crate::Connection;

/// A client-side entity type.
pub trait Entity: Send + 'static {
    /// The server-side type name this entity binds to.
    fn entity_type() -> EntityType;

    /// Builds an instance from a fetched endpoint.
    fn from_endpoint(endpoint: EntityEndpoint) -> Self;
}

/// Per-type client support: configuration codec and instance factory.
pub trait EntityClientService<E: Entity>: Send + Sync + 'static {
    /// The configuration type entities of this kind are created with.
    type Config: Send + Sync + 'static;

    /// Encodes a configuration for `Create` / `Reconfigure`.
    fn serialize_configuration(&self, config: &Self::Config) -> Result<Vec<u8>, ProtocolError>;

    /// Decodes a configuration returned by the server.
    fn deserialize_configuration(&self, bytes: &[u8]) -> Result<Self::Config, ProtocolError>;

    /// Builds an entity instance. Defaults to [`Entity::from_endpoint`].
    fn create_entity(&self, endpoint: EntityEndpoint) -> E {
        E::from_endpoint(endpoint)
    }
}

/// Everything a freshly fetched entity instance is bound to.
#[derive(Clone)]
pub struct EntityEndpoint {
    connection: Connection,
    identity: EntityIdentity,
    instance_id: InstanceId,
    raw_config: Vec<u8>,
}

impl EntityEndpoint {
    pub(crate) fn new(
        connection: Connection,
        identity: EntityIdentity,
        instance_id: InstanceId,
        raw_config: Vec<u8>,
    ) -> Self {
        Self {
            connection,
            identity,
            instance_id,
            raw_config,
        }
    }

    /// The connection the entity was fetched through.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn identity(&self) -> &EntityIdentity {
        &self.identity
    }

    /// Unique per fetch on this connection.
    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// The configuration bytes the server returned.
    pub fn raw_config(&self) -> &[u8] {
        &self.raw_config
    }
}

impl fmt::Debug for EntityEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityEndpoint")
            .field("identity", &self.identity)
            .field("instance_id", &self.instance_id)
            .field("raw_config_len", &self.raw_config.len())
            .finish_non_exhaustive()
    }
}

/// A service that encodes any serde configuration as JSON.
pub struct JsonConfigService<C> {
    _config: PhantomData<fn() -> C>,
}

impl<C> JsonConfigService<C> {
    pub fn new() -> Self {
        Self {
            _config: PhantomData,
        }
    }
}

impl<C> Default for JsonConfigService<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for JsonConfigService<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonConfigService")
    }
}

impl<E, C> EntityClientService<E> for JsonConfigService<C>
where
    E: Entity,
    C: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Config = C;

    fn serialize_configuration(&self, config: &C) -> Result<Vec<u8>, ProtocolError> {
        JsonCodec.encode(config)
    }

    fn deserialize_configuration(&self, bytes: &[u8]) -> Result<C, ProtocolError> {
        JsonCodec.decode(bytes)
    }
}

/// Services keyed by entity type, with the concrete service type erased.
#[derive(Default)]
pub(crate) struct ServiceRegistry {
    services: RwLock<HashMap<EntityType, Box<dyn Any + Send + Sync>>>,
}

impl ServiceRegistry {
    /// Registers `service` for `E`, replacing any previous one.
    pub(crate) fn insert<E, C>(&self, service: Arc<dyn EntityClientService<E, Config = C>>)
    where
        E: Entity,
        C: Send + Sync + 'static,
    {
        let entity_type = E::entity_type();
        let replaced = self
            .services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entity_type.clone(), Box::new(service))
            .is_some();
        tracing::debug!(%entity_type, replaced, "client service registered");
    }

    /// The service for `E` with configuration type `C`, if registered.
    pub(crate) fn get<E, C>(&self) -> Option<Arc<dyn EntityClientService<E, Config = C>>>
    where
        E: Entity,
        C: Send + Sync + 'static,
    {
        let entity_type = E::entity_type();
        let services = self.services.read().unwrap_or_else(PoisonError::into_inner);
        let entry = services.get(&entity_type)?;
        match entry.downcast_ref::<Arc<dyn EntityClientService<E, Config = C>>>() {
            Some(service) => Some(Arc::clone(service)),
            None => {
                tracing::warn!(
                    %entity_type,
                    "registered service has a different configuration type"
                );
                None
            }
        }
    }
}
