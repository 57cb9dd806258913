//! The shared client connection handle and its builder.
//!
//! A [`Connection`] is a cheap-to-clone handle. Every clone feeds the same
//! outbound queue, which one driver task (see `driver.rs`) drains in FIFO
//! order onto the transport channel. The handle itself never touches the
//! network: [`Connection::send_message`] enqueues and returns a [`Wait`]
//! immediately.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tessera_protocol::{
    EntityIdentity, EntityKey, EntityName, InstanceId, Message, SessionId, Version,
};
use tessera_transport::Connector;
use tokio::sync::{mpsc, watch};

use crate::driver::{self, Driver, Outbound};
use crate::locks::LockOwnership;
use crate::service::{Entity, EntityClientService, EntityEndpoint, ServiceRegistry};
use crate::{ClientError, ConnectionConfig, EntityRef, Wait};

/// Lifecycle of a connection as seen by its users.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// The channel is up and requests flow.
    Connected { session: SessionId },
    /// The channel dropped; re-dialing. Queued requests wait.
    Reconnecting { attempt: u32 },
    /// Recovery failed. Every request fails with `RequestError::Closed`.
    Failed { reason: String },
    /// Closed on purpose.
    Closed,
}

impl ConnectionState {
    /// `Failed` and `Closed` never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Closed)
    }
}

/// State shared between every handle and the driver.
pub(crate) struct Shared {
    next_instance: AtomicU64,
    pub(crate) locks: LockOwnership,
    services: ServiceRegistry,
    state: watch::Receiver<ConnectionState>,
    pub(crate) config: ConnectionConfig,
}

/// Handle to one multiplexed connection.
///
/// Clone it freely; all clones share one channel, one lock ownership set
/// and one instance id counter. The connection closes when
/// [`close`](Self::close) is called or the last handle is dropped.
#[derive(Clone)]
pub struct Connection {
    outbound: mpsc::UnboundedSender<Outbound>,
    shared: Arc<Shared>,
}

impl Connection {
    /// Starts configuring a new connection.
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    /// Allocates the next instance id. Ids start at 1 and are never
    /// reused on this connection.
    pub fn new_instance_id(&self) -> InstanceId {
        InstanceId(self.shared.next_instance.fetch_add(1, Ordering::Relaxed))
    }

    /// Queues `message` and returns its [`Wait`] without blocking.
    ///
    /// Messages reach the wire in the order they were queued, across all
    /// clones of this handle. On a closed or failed connection the `Wait`
    /// resolves to `RequestError::Closed`.
    pub fn send_message(&self, message: Message) -> Wait {
        let (wait, completion) = Wait::new();
        if self
            .outbound
            .send(Outbound::Request {
                message,
                completion,
            })
            .is_err()
        {
            tracing::debug!("request dropped: connection driver has stopped");
        }
        wait
    }

    /// Builds a typed entity instance bound to this connection. Uses the
    /// service's factory when there is one. No network traffic.
    pub fn create_entity_instance<E, C>(
        &self,
        service: Option<&dyn EntityClientService<E, Config = C>>,
        identity: EntityIdentity,
        instance_id: InstanceId,
        raw_config: Vec<u8>,
    ) -> E
    where
        E: Entity,
        C: Send + Sync + 'static,
    {
        let endpoint = EntityEndpoint::new(self.clone(), identity, instance_id, raw_config);
        match service {
            Some(service) => service.create_entity(endpoint),
            None => E::from_endpoint(endpoint),
        }
    }

    /// Records that this client now holds `identity`'s write lock.
    pub fn did_acquire_write_lock(&self, identity: EntityIdentity) {
        if !self.shared.locks.insert(identity.clone()) {
            tracing::warn!(%identity, "write lock recorded twice");
        }
    }

    /// Records that this client no longer holds `identity`'s write lock.
    ///
    /// The driver does this itself when a release it sent completes.
    pub fn did_release_write_lock(&self, identity: &EntityIdentity) {
        self.shared.locks.forget(identity);
    }

    /// A snapshot of the write locks this client holds.
    pub fn held_write_locks(&self) -> Vec<EntityIdentity> {
        self.shared.locks.snapshot()
    }

    /// A reference to the server-side entity `E` named `name` at `version`.
    ///
    /// Picks up the client service registered for `E` (if its
    /// configuration type is `C`). Nothing is sent until an operation is
    /// called on the reference.
    pub fn get_entity_ref<E, C>(
        &self,
        version: Version,
        name: impl Into<EntityName>,
    ) -> EntityRef<E, C>
    where
        E: Entity,
        C: Send + Sync + 'static,
    {
        let identity = EntityIdentity {
            key: EntityKey {
                entity_type: E::entity_type(),
                name: name.into(),
            },
            version,
        };
        EntityRef::new(self.clone(), identity, self.shared.services.get::<E, C>())
    }

    /// Registers (or replaces) the client service for `E`.
    pub fn register_service<E, S>(&self, service: S)
    where
        E: Entity,
        S: EntityClientService<E>,
    {
        self.shared
            .services
            .insert::<E, S::Config>(Arc::new(service));
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    /// The server session, while connected.
    pub fn session(&self) -> Option<SessionId> {
        match self.state() {
            ConnectionState::Connected { session } => Some(session),
            _ => None,
        }
    }

    /// Suspends until the state satisfies `predicate` and returns it.
    ///
    /// If the driver has stopped, returns the final state whether or not
    /// it matches.
    pub async fn wait_for_state(
        &self,
        mut predicate: impl FnMut(&ConnectionState) -> bool,
    ) -> ConnectionState {
        let mut state = self.shared.state.clone();
        let matched = state.wait_for(|s| predicate(s)).await.map(|s| s.clone());
        matched.unwrap_or_else(|_| self.state())
    }

    /// Closes the connection after every request queued so far has been
    /// written. In-flight requests fail with `RequestError::Closed`.
    pub async fn close(&self) {
        let _ = self.outbound.send(Outbound::Shutdown);
        self.wait_for_state(ConnectionState::is_terminal).await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Builder for a [`Connection`].
///
/// # Example
///
/// ```rust,ignore
/// use tessera::prelude::*;
///
/// let conn = Connection::builder()
///     .config(ConnectionConfig::default())
///     .service::<Widget, _>(JsonConfigService::<WidgetConfig>::new())
///     .connect(WebSocketConnector::new("ws://127.0.0.1:9410"))
///     .await?;
/// ```
pub struct ConnectionBuilder {
    config: ConnectionConfig,
    services: ServiceRegistry,
}

impl ConnectionBuilder {
    /// Creates a builder with default settings and no services.
    pub fn new() -> Self {
        Self {
            config: ConnectionConfig::default(),
            services: ServiceRegistry::default(),
        }
    }

    /// Sets the connection configuration.
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers the client service for entity type `E`.
    pub fn service<E, S>(self, service: S) -> Self
    where
        E: Entity,
        S: EntityClientService<E>,
    {
        self.services.insert::<E, S::Config>(Arc::new(service));
        self
    }

    /// Dials the server, performs the handshake and starts the driver.
    ///
    /// `connector` is kept for reconnection.
    ///
    /// # Errors
    /// `ClientError::Connect` if the channel cannot be opened or the
    /// handshake times out, `ClientError::Rejected` if the server refuses.
    pub async fn connect<K: Connector>(self, connector: K) -> Result<Connection, ClientError> {
        let config = self.config.validated();
        let (channel, session) = driver::establish(&connector, &config).await?;
        tracing::info!(%session, "connected");

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected { session });
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            next_instance: AtomicU64::new(1),
            locks: LockOwnership::default(),
            services: self.services,
            state: state_rx,
            config,
        });

        let driver = Driver::new(
            connector,
            channel,
            session,
            Arc::clone(&shared),
            state_tx,
            outbound_rx,
        );
        tokio::spawn(driver.run());

        Ok(Connection {
            outbound: outbound_tx,
            shared,
        })
    }
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
