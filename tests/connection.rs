use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use ws_endpoint::{Message, WebSocketClient, WebSocketConnection, WebSocketError, WebSocketServer};

const WAIT: Duration = Duration::from_secs(5);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Binds a fresh loopback listener and serves it with the given handler.
async fn spawn_server<H, Fut>(handler: H) -> SocketAddr
where
    H: Fn(WebSocketConnection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind((IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let server = WebSocketServer::new(handler, addr.ip(), addr.port());
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    addr
}

async fn connect(addr: SocketAddr) -> WebSocketConnection {
    WebSocketClient::new("127.0.0.1", addr.port(), "/", false)
        .connect()
        .await
        .unwrap()
}

/// Performs a raw opening handshake for tests that need wire-level control.
async fn raw_handshake(stream: &mut TcpStream) {
    let request = concat!(
        "GET / HTTP/1.1\r\n",
        "Host: localhost\r\n",
        "Upgrade: websocket\r\n",
        "Connection: Upgrade\r\n",
        "Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n",
        "Sec-WebSocket-Version: 13\r\n",
        "\r\n",
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    assert!(head.starts_with(b"HTTP/1.1 101"));
}

/// Builds a masked client-to-server frame with a payload under 126 bytes.
fn masked_frame(opcode: u8, fin: bool, payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() <= 125);
    let key = [0x11, 0x22, 0x33, 0x44];
    let mut frame = vec![opcode | ((fin as u8) << 7), 0x80 | payload.len() as u8];
    frame.extend_from_slice(&key);
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
    frame
}

#[tokio::test]
async fn text_and_binary_roundtrip() {
    init_logging();
    let (results_tx, results_rx) = flume::unbounded();

    let addr = spawn_server(move |connection| {
        let results_tx = results_tx.clone();
        async move {
            let message = connection.get_message().await;
            results_tx.send_async(message).await.ok();
            connection.send_message(vec![0x01u8, 0x02, 0x03]).await.ok();
        }
    })
    .await;

    let connection = connect(addr).await;
    connection.send_message("hello").await.unwrap();

    let server_got = timeout(WAIT, results_rx.recv_async())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(server_got, Message::Text("hello".into()));

    let client_got = timeout(WAIT, connection.get_message())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(client_got, Message::Binary(vec![0x01, 0x02, 0x03]));

    timeout(WAIT, connection.close(1000, None))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn immediate_close_reaches_the_peer() {
    init_logging();
    let (results_tx, results_rx) = flume::unbounded();

    let addr = spawn_server(move |connection| {
        let results_tx = results_tx.clone();
        async move {
            let result = connection.get_message().await;
            results_tx.send_async(result).await.ok();
        }
    })
    .await;

    let connection = connect(addr).await;
    timeout(WAIT, connection.close(1000, Some("bye".into())))
        .await
        .unwrap()
        .unwrap();

    let server_saw = timeout(WAIT, results_rx.recv_async()).await.unwrap().unwrap();
    let reason = match server_saw {
        Err(WebSocketError::ConnectionClosed(reason)) => reason,
        other => panic!("expected connection-closed, got {:?}", other),
    };
    assert_eq!(reason.code(), 1000);
    assert_eq!(reason.name(), "NORMAL_CLOSURE");
    assert_eq!(reason.reason(), Some("bye"));

    // every later operation observes the same local reason
    let err = connection.get_message().await.unwrap_err();
    let reason = err.close_reason().unwrap();
    assert_eq!(reason.code(), 1000);
    assert_eq!(reason.reason(), Some("bye"));
    assert!(connection.close_reason().is_some());
}

#[tokio::test]
async fn fragmented_text_is_reassembled() {
    init_logging();
    let (results_tx, results_rx) = flume::unbounded();

    let addr = spawn_server(move |connection| {
        let results_tx = results_tx.clone();
        async move {
            let message = connection.get_message().await;
            results_tx.send_async(message).await.ok();
        }
    })
    .await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    raw_handshake(&mut stream).await;
    stream.write_all(&masked_frame(0x1, false, b"a")).await.unwrap();
    stream.write_all(&masked_frame(0x0, false, b"bc")).await.unwrap();
    stream.write_all(&masked_frame(0x0, true, b"d")).await.unwrap();

    let message = timeout(WAIT, results_rx.recv_async())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(message, Message::Text("abcd".into()));
}

#[tokio::test]
async fn successive_pings_resolve_independently() {
    init_logging();

    let addr = spawn_server(|connection| async move {
        // keep the connection open until the client closes it
        while connection.get_message().await.is_ok() {}
    })
    .await;

    let connection = connect(addr).await;
    timeout(WAIT, connection.ping(vec![0x00u8, 0x01]))
        .await
        .unwrap()
        .unwrap();
    timeout(WAIT, connection.ping(vec![0x02u8]))
        .await
        .unwrap()
        .unwrap();

    timeout(WAIT, connection.close(1000, None))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn dead_tcp_surfaces_as_abnormal_closure() {
    init_logging();
    let (results_tx, results_rx) = flume::unbounded();

    let addr = spawn_server(move |connection| {
        let results_tx = results_tx.clone();
        async move {
            let result = connection.get_message().await;
            results_tx.send_async(result).await.ok();
        }
    })
    .await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    raw_handshake(&mut stream).await;
    // kill the TCP connection without a close handshake
    drop(stream);

    let result = timeout(WAIT, results_rx.recv_async()).await.unwrap().unwrap();
    let reason = match result {
        Err(WebSocketError::ConnectionClosed(reason)) => reason,
        other => panic!("expected connection-closed, got {:?}", other),
    };
    assert_eq!(reason.code(), 1006);
    assert_eq!(reason.name(), "ABNORMAL_CLOSURE");
    assert_eq!(reason.reason(), Some("TCP connection aborted"));
}

#[tokio::test]
async fn concurrent_senders_deliver_intact_messages() {
    init_logging();
    let (results_tx, results_rx) = flume::unbounded();

    let addr = spawn_server(move |connection| {
        let results_tx = results_tx.clone();
        async move {
            for _ in 0..2 {
                match connection.get_message().await {
                    Ok(message) => results_tx.send_async(message).await.ok(),
                    Err(_) => break,
                };
            }
        }
    })
    .await;

    let connection = connect(addr).await;
    let sender_a = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.send_message("A").await })
    };
    let sender_b = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.send_message("B").await })
    };
    sender_a.await.unwrap().unwrap();
    sender_b.await.unwrap().unwrap();

    let first = timeout(WAIT, results_rx.recv_async()).await.unwrap().unwrap();
    let second = timeout(WAIT, results_rx.recv_async()).await.unwrap().unwrap();
    let mut texts = vec![
        first.into_text().unwrap(),
        second.into_text().unwrap(),
    ];
    texts.sort();
    assert_eq!(texts, vec!["A".to_owned(), "B".to_owned()]);

    timeout(WAIT, connection.close(1000, None))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn pending_get_message_wakes_on_server_close() {
    init_logging();

    let addr = spawn_server(|connection| async move {
        connection.close(1000, Some("server done".into())).await.ok();
    })
    .await;

    let connection = connect(addr).await;
    let err = timeout(WAIT, connection.get_message())
        .await
        .unwrap()
        .unwrap_err();
    let reason = err.close_reason().unwrap();
    assert_eq!(reason.code(), 1000);
    assert_eq!(reason.reason(), Some("server done"));
}

#[tokio::test]
async fn large_binary_payload_roundtrips() {
    init_logging();

    let addr = spawn_server(|connection| async move {
        while let Ok(message) = connection.get_message().await {
            if connection.send_message(message).await.is_err() {
                break;
            }
        }
    })
    .await;

    let connection = connect(addr).await;
    let payload: Vec<u8> = (0..1 << 20).map(|i| (i % 251) as u8).collect();
    connection.send_message(payload.clone()).await.unwrap();
    let echoed = timeout(WAIT, connection.get_message())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, Message::Binary(payload));

    timeout(WAIT, connection.close(1000, None))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn unicode_text_roundtrips() {
    init_logging();

    let addr = spawn_server(|connection| async move {
        assert!(connection.is_server());
        while let Ok(message) = connection.get_message().await {
            if connection.send_message(message).await.is_err() {
                break;
            }
        }
    })
    .await;

    let connection = connect(addr).await;
    assert!(connection.is_client());
    assert!(connection.close_reason().is_none());

    let text = "héllo wörld ☃ 你好 🦀";
    connection.send_message(text).await.unwrap();
    let echoed = timeout(WAIT, connection.get_message())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed.as_text(), Some(text));

    timeout(WAIT, connection.close(1000, None))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn oversized_control_payloads_are_rejected() {
    init_logging();

    let addr = spawn_server(|connection| async move {
        while connection.get_message().await.is_ok() {}
    })
    .await;

    let connection = connect(addr).await;
    let err = connection.ping(vec![0u8; 126]).await.unwrap_err();
    assert!(matches!(err, WebSocketError::ControlFrameTooLargeError));

    let err = connection
        .close(1000, Some("x".repeat(124)))
        .await
        .unwrap_err();
    assert!(matches!(err, WebSocketError::ControlFrameTooLargeError));

    // the failed close must not have poisoned the connection
    timeout(WAIT, connection.close(1000, None))
        .await
        .unwrap()
        .unwrap();
}
