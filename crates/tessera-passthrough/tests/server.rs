//! Wire-level tests for the passthrough server.
//!
//! These speak raw frames over the memory connection the connector hands
//! out, without the client core, so they pin down exactly what the
//! server sends.

use std::time::Duration;

use tessera_passthrough::{PassthroughError, PassthroughServer};
use tessera_protocol::{
    ClientFrame, Codec, EntityIdentity, InstanceId, JsonCodec, Message, MessageKind, Outcome,
    PROTOCOL_VERSION, ServerFrame, SessionId, TransactionId, Version,
};
use tessera_transport::{Connection, Connector, MemoryConnection};

const TIMEOUT: Duration = Duration::from_secs(2);

async fn send(conn: &MemoryConnection, frame: &ClientFrame) {
    let bytes = JsonCodec.encode(frame).expect("should encode");
    conn.send(&bytes).await.expect("send should succeed");
}

async fn recv(conn: &MemoryConnection) -> Option<ServerFrame> {
    let bytes = tokio::time::timeout(TIMEOUT, conn.recv())
        .await
        .expect("server should answer in time")
        .expect("recv should not error")?;
    Some(JsonCodec.decode(&bytes).expect("should decode"))
}

async fn greet(conn: &MemoryConnection) -> SessionId {
    send(
        conn,
        &ClientFrame::Hello {
            protocol_version: PROTOCOL_VERSION,
        },
    )
    .await;
    match recv(conn).await {
        Some(ServerFrame::Welcome { session }) => session,
        other => panic!("expected Welcome, got {other:?}"),
    }
}

fn widget() -> EntityIdentity {
    EntityIdentity::new("Widget", "w1", Version(1))
}

async fn request(conn: &MemoryConnection, txn: u64, message: Message) {
    send(
        conn,
        &ClientFrame::Request {
            transaction: TransactionId(txn),
            message,
        },
    )
    .await;
}

#[tokio::test]
async fn test_handshake_assigns_increasing_sessions() {
    let server = PassthroughServer::start();
    let connector = server.connector();

    let a = connector.connect().await.unwrap();
    let b = connector.connect().await.unwrap();

    let sa = greet(&a).await;
    let sb = greet(&b).await;
    assert!(sb > sa);
    assert_eq!(server.sessions().await.unwrap(), vec![sa, sb]);
}

#[tokio::test]
async fn test_handshake_wrong_version_is_rejected_and_closed() {
    let server = PassthroughServer::start();
    let conn = server.connector().connect().await.unwrap();

    send(
        &conn,
        &ClientFrame::Hello {
            protocol_version: PROTOCOL_VERSION + 1,
        },
    )
    .await;

    assert!(matches!(recv(&conn).await, Some(ServerFrame::Rejected { .. })));
    assert_eq!(recv(&conn).await, None);
}

#[tokio::test]
async fn test_request_is_acked_then_completed() {
    let server = PassthroughServer::start();
    server.register_entity_type("Widget", Version(1)).await.unwrap();
    let conn = server.connector().connect().await.unwrap();
    greet(&conn).await;

    request(&conn, 1, Message::create(&widget(), b"{}".to_vec()).unwrap()).await;

    assert_eq!(
        recv(&conn).await,
        Some(ServerFrame::Ack {
            transaction: TransactionId(1)
        })
    );
    assert_eq!(
        recv(&conn).await,
        Some(ServerFrame::Complete {
            transaction: TransactionId(1),
            outcome: Outcome::empty(),
        })
    );
    assert!(server.contains_entity(widget().key).await.unwrap());
}

#[tokio::test]
async fn test_request_before_handshake_fails() {
    let server = PassthroughServer::start();
    let conn = server.connector().connect().await.unwrap();

    request(&conn, 1, Message::fetch(&widget(), InstanceId(1)).unwrap()).await;

    assert!(matches!(recv(&conn).await, Some(ServerFrame::Ack { .. })));
    assert!(matches!(
        recv(&conn).await,
        Some(ServerFrame::Complete {
            outcome: Outcome::Failure { .. },
            ..
        })
    ));
    assert!(server.history().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_kill_session_closes_channel_and_releases_locks() {
    let server = PassthroughServer::start();
    let conn = server.connector().connect().await.unwrap();
    let session = greet(&conn).await;

    request(&conn, 1, Message::lock_acquire(&widget()).unwrap()).await;
    assert!(matches!(recv(&conn).await, Some(ServerFrame::Ack { .. })));
    assert!(matches!(recv(&conn).await, Some(ServerFrame::Complete { .. })));
    assert_eq!(server.lock_holder(widget().key).await.unwrap(), Some(session));

    assert!(server.kill_session(session).await.unwrap());

    assert_eq!(recv(&conn).await, None);
    assert_eq!(server.lock_holder(widget().key).await.unwrap(), None);
    assert!(server.sessions().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_kill_hands_lock_to_blocked_session() {
    let server = PassthroughServer::start();
    let connector = server.connector();
    let a = connector.connect().await.unwrap();
    let b = connector.connect().await.unwrap();
    let sa = greet(&a).await;
    let sb = greet(&b).await;

    request(&a, 1, Message::lock_acquire(&widget()).unwrap()).await;
    recv(&a).await;
    recv(&a).await;

    request(&b, 1, Message::lock_acquire(&widget()).unwrap()).await;
    assert!(matches!(recv(&b).await, Some(ServerFrame::Ack { .. })));

    server.kill_session(sa).await.unwrap();

    assert_eq!(
        recv(&b).await,
        Some(ServerFrame::Complete {
            transaction: TransactionId(1),
            outcome: Outcome::empty(),
        })
    );
    assert_eq!(server.lock_holder(widget().key).await.unwrap(), Some(sb));
}

#[tokio::test]
async fn test_client_close_releases_locks() {
    let server = PassthroughServer::start();
    let conn = server.connector().connect().await.unwrap();
    greet(&conn).await;

    request(&conn, 1, Message::lock_try_acquire(&widget()).unwrap()).await;
    recv(&conn).await;
    recv(&conn).await;

    conn.close().await.unwrap();
    drop(conn);

    // The actor notices the close asynchronously.
    let mut released = false;
    for _ in 0..50 {
        if server.lock_holder(widget().key).await.unwrap().is_none() {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(released, "lock should be released after client close");
}

#[tokio::test]
async fn test_not_accepting_refuses_connections() {
    let server = PassthroughServer::start();
    server.set_accepting(false).await.unwrap();

    let result = server.connector().connect().await;
    assert!(matches!(result, Err(PassthroughError::Refused)));

    server.set_accepting(true).await.unwrap();
    assert!(server.connector().connect().await.is_ok());
}

#[tokio::test]
async fn test_external_lock_refuses_try_lock() {
    let server = PassthroughServer::start();
    assert!(server.lock_externally(widget().key).await.unwrap());
    let conn = server.connector().connect().await.unwrap();
    greet(&conn).await;

    request(&conn, 1, Message::lock_try_acquire(&widget()).unwrap()).await;
    recv(&conn).await;
    assert_eq!(
        recv(&conn).await,
        Some(ServerFrame::Complete {
            transaction: TransactionId(1),
            outcome: Outcome::Success { payload: vec![0] },
        })
    );

    assert!(server.unlock_externally(widget().key).await.unwrap());
    assert!(!server.unlock_externally(widget().key).await.unwrap());
}

#[tokio::test]
async fn test_history_tracks_session_and_kind() {
    let server = PassthroughServer::start();
    server.register_entity_type("Widget", Version(1)).await.unwrap();
    let conn = server.connector().connect().await.unwrap();
    let session = greet(&conn).await;

    request(&conn, 1, Message::fetch(&widget(), InstanceId(9)).unwrap()).await;
    recv(&conn).await;
    recv(&conn).await;

    let history = server.history().await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].session, session);
    assert_eq!(history[0].kind, MessageKind::Fetch);
    assert_eq!(history[0].identity, widget());
}
