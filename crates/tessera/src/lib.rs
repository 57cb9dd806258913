//! # Tessera
//!
//! Client for server-side entities shared over one multiplexed connection.
//!
//! An application opens a [`Connection`], obtains an [`EntityRef`] for a
//! named entity, and calls lifecycle operations on it: fetch, create,
//! reconfigure, destroy. Many tasks share one connection; every request
//! is queued, written in order, and completed through its own [`Wait`].
//! Mutating operations take the entity's server-side write lock and give
//! it back on every exit path. If the channel drops, the connection
//! re-dials and takes back the locks it held before anything else is
//! sent.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tessera::prelude::*;
//! # use serde::{Deserialize, Serialize};
//! # #[derive(Serialize, Deserialize)]
//! # struct WidgetConfig { color: String }
//! # struct Widget(EntityEndpoint);
//! # impl Entity for Widget {
//! #     fn entity_type() -> EntityType { EntityType::new("Widget") }
//! #     fn from_endpoint(endpoint: EntityEndpoint) -> Self { Widget(endpoint) }
//! # }
//!
//! # async fn run() -> Result<(), ClientError> {
//! let conn = Connection::builder()
//!     .service::<Widget, _>(JsonConfigService::<WidgetConfig>::new())
//!     .connect(WebSocketConnector::new("ws://127.0.0.1:9410"))
//!     .await?;
//!
//! let widget = conn.get_entity_ref::<Widget, WidgetConfig>(Version(1), "w1");
//! widget.create(&WidgetConfig { color: "red".into() }).await?;
//! let instance = widget.fetch_entity().await?;
//! # let _ = instance;
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;
mod driver;
mod entity_ref;
mod error;
mod locks;
mod service;
mod wait;

pub use config::{ConnectionConfig, ReconnectPolicy};
pub use connection::{Connection, ConnectionBuilder, ConnectionState};
pub use entity_ref::EntityRef;
pub use error::{ClientError, RequestError};
pub use service::{Entity, EntityClientService, EntityEndpoint, JsonConfigService};
pub use wait::Wait;

pub use tessera_protocol::{
    EntityError, EntityIdentity, EntityKey, EntityName, EntityType, InstanceId, Message,
    MessageKind, ProtocolError, SessionId, Version,
};

/// Everything an application usually needs.
pub mod prelude {
    pub use crate::{
        ClientError, Connection, ConnectionConfig, ConnectionState, Entity, EntityClientService,
        EntityEndpoint, EntityError, EntityIdentity, EntityRef, EntityType, JsonConfigService,
        ReconnectPolicy, RequestError, Version, Wait,
    };
    #[cfg(feature = "websocket")]
    pub use tessera_transport::WebSocketConnector;
    pub use tessera_transport::Connector;
}
