//! In-process entity server for Tessera clients.
//!
//! [`PassthroughServer`] implements the server half of the protocol
//! (handshake, ordering, entity lifecycle and write locks) inside the
//! test process. Clients reach it through [`PassthroughConnector`], which
//! hands out [`MemoryConnection`](tessera_transport::MemoryConnection)s,
//! so no sockets are involved.
//!
//! Besides serving requests it exposes hooks tests need: kill sessions to
//! simulate a dropped connection, refuse new sessions, take locks from
//! outside any session, and inspect the order in which requests were
//! processed.
//!
//! ```rust,no_run
//! # async fn demo() -> Result<(), tessera_passthrough::PassthroughError> {
//! use tessera_passthrough::PassthroughServer;
//! use tessera_protocol::Version;
//!
//! let server = PassthroughServer::start();
//! server.register_entity_type("Widget", Version(1)).await?;
//! let connector = server.connector();
//! # let _ = connector;
//! # Ok(())
//! # }
//! ```

mod error;
mod server;
mod state;

pub use error::PassthroughError;
pub use server::{PassthroughConnector, PassthroughServer};
pub use state::{EXTERNAL_SESSION, ProcessedRequest, Reply, ServerState};
