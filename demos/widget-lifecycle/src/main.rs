//! Widget lifecycle demo.
//!
//! Starts an in-process passthrough server, connects two clients to it and
//! walks one entity through its whole life: create, fetch, a contested
//! create, reconfigure, a dropped connection with lock recovery, and
//! destroy.
//!
//! Run with `RUST_LOG=info cargo run -p widget-lifecycle` (or `debug` to
//! see every request).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tessera::prelude::*;
use tessera_passthrough::PassthroughServer;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WidgetConfig {
    color: String,
    size: u32,
}

/// Client-side view of a widget: the config it was fetched with.
#[derive(Debug)]
struct Widget {
    endpoint: EntityEndpoint,
}

impl Widget {
    fn config(&self) -> Result<WidgetConfig, serde_json::Error> {
        serde_json::from_slice(self.endpoint.raw_config())
    }
}

impl Entity for Widget {
    fn entity_type() -> EntityType {
        EntityType::new("Widget")
    }

    fn from_endpoint(endpoint: EntityEndpoint) -> Self {
        Self { endpoint }
    }
}

async fn connect(server: &PassthroughServer) -> Result<Connection, ClientError> {
    Connection::builder()
        .config(ConnectionConfig {
            reconnect: ReconnectPolicy {
                initial_backoff: Duration::from_millis(20),
                ..ReconnectPolicy::default()
            },
            ..ConnectionConfig::default()
        })
        .service::<Widget, _>(JsonConfigService::<WidgetConfig>::new())
        .connect(server.connector())
        .await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let server = PassthroughServer::start();
    server.register_entity_type("Widget", Version(1)).await?;

    let alice = connect(&server).await?;
    let bob = connect(&server).await?;
    tracing::info!(alice = ?alice.session(), bob = ?bob.session(), "clients connected");

    let w1 = alice.get_entity_ref::<Widget, WidgetConfig>(Version(1), "w1");
    w1.create(&WidgetConfig {
        color: "red".into(),
        size: 3,
    })
    .await?;

    let fetched = bob
        .get_entity_ref::<Widget, WidgetConfig>(Version(1), "w1")
        .fetch_entity()
        .await?;
    tracing::info!(
        instance = %fetched.endpoint.instance_id(),
        config = ?fetched.config()?,
        "bob fetched w1"
    );

    match bob
        .get_entity_ref::<Widget, WidgetConfig>(Version(1), "w1")
        .create(&WidgetConfig {
            color: "green".into(),
            size: 1,
        })
        .await
    {
        Err(ClientError::Entity(e @ EntityError::AlreadyExists { .. })) => {
            tracing::info!(error = %e, "bob's create refused as expected");
        }
        other => tracing::warn!(result = ?other, "bob's create did not fail as expected"),
    }

    let previous = w1
        .reconfigure(&WidgetConfig {
            color: "blue".into(),
            size: 5,
        })
        .await?;
    tracing::info!(?previous, "alice reconfigured w1");

    // Drop every session. Both clients reconnect on their own; any locks
    // they held are taken back before their next request goes out.
    let before = alice.session();
    let killed = server.kill_all_sessions().await?;
    tracing::info!(killed, "server dropped all sessions");
    alice
        .wait_for_state(|s| match s {
            ConnectionState::Connected { session } => Some(*session) != before,
            other => other.is_terminal(),
        })
        .await;
    tracing::info!(state = ?alice.state(), "alice after reconnect");

    if w1.try_destroy().await? {
        tracing::info!("alice destroyed w1");
    }
    match w1.fetch_entity().await {
        Err(ClientError::Entity(EntityError::NotFound { .. })) => {
            tracing::info!("w1 is gone");
        }
        other => tracing::warn!(result = ?other, "w1 still fetchable"),
    }

    alice.close().await;
    bob.close().await;
    Ok(())
}
