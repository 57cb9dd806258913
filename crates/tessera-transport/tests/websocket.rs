//! Integration tests for the WebSocket connector.
//!
//! These spin up a bare `tokio-tungstenite` server on an OS-assigned port
//! and dial it with [`WebSocketConnector`], so real bytes cross a real
//! socket.

#[cfg(feature = "websocket")]
mod websocket {
    use futures_util::{SinkExt, StreamExt};
    use tessera_transport::{Connection, Connector, TransportError, WebSocketConnector};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    /// Binds a listener on a random port and returns it with its address.
    async fn listen() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("should bind");
        let addr = listener.local_addr().expect("should have addr").to_string();
        (listener, addr)
    }

    #[tokio::test]
    async fn test_websocket_connect_and_send_receive() {
        let (listener, addr) = listen().await;

        // Server side: accept one client, echo one message, then say hi.
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("should accept");
            let mut ws = tokio_tungstenite::accept_async(stream)
                .await
                .expect("should upgrade");

            let msg = ws.next().await.unwrap().unwrap();
            assert_eq!(msg.into_data().as_ref(), b"hello from client");

            ws.send(Message::Binary(b"hello from server".to_vec().into()))
                .await
                .unwrap();
            ws
        });

        let connector = WebSocketConnector::new(format!("ws://{addr}"));
        let conn = connector.connect().await.expect("should connect");
        assert!(conn.id().into_inner() > 0);

        conn.send(b"hello from client").await.expect("send should succeed");

        let received = conn
            .recv()
            .await
            .expect("recv should succeed")
            .expect("should have data");
        assert_eq!(received, b"hello from server");

        conn.close().await.expect("close should succeed");
        let _ = server.await;
    }

    #[tokio::test]
    async fn test_websocket_recv_returns_none_on_server_close() {
        let (listener, addr) = listen().await;

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Close(None)).await.unwrap();
        });

        let conn = WebSocketConnector::new(format!("ws://{addr}"))
            .connect()
            .await
            .expect("should connect");

        let result = conn.recv().await.expect("recv should not error");
        assert!(result.is_none(), "should return None on server close");
    }

    #[tokio::test]
    async fn test_websocket_connect_to_closed_port_fails() {
        let (listener, addr) = listen().await;
        drop(listener);

        let result = WebSocketConnector::new(format!("ws://{addr}"))
            .connect()
            .await;
        assert!(matches!(result, Err(TransportError::ConnectFailed(_))));
    }
}
