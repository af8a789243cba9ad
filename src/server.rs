use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use log::{debug, info};
use native_tls::TlsAcceptor as NativeTlsAcceptor;
use tokio::net::TcpListener;
use tokio::task::JoinSet;

use crate::connection::WebSocketConnection;
use crate::error::WebSocketError;
use crate::protocol::ProtocolEngine;
use crate::stream::Stream;

type Handler = Arc<dyn Fn(WebSocketConnection) -> BoxFuture<'static, ()> + Send + Sync>;

/// WebSocket server.
///
/// Listens on a TCP socket; for each incoming connection it performs the
/// opening handshake, spawns the connection's background tasks, and invokes
/// the handler with a [`WebSocketConnection`].
pub struct WebSocketServer {
    handler: Handler,
    ip: IpAddr,
    port: u16,
    tls: Option<Arc<tokio_native_tls::TlsAcceptor>>,
}

impl WebSocketServer {
    /// Creates a plaintext server bound to `ip:port` once
    /// [`listen()`](Self::listen) is called.
    pub fn new<H, Fut>(handler: H, ip: IpAddr, port: u16) -> Self
    where
        H: Fn(WebSocketConnection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |connection| handler(connection).boxed()),
            ip,
            port,
            tls: None,
        }
    }

    /// Serves TLS with the given acceptor.
    pub fn with_tls(mut self, acceptor: NativeTlsAcceptor) -> Self {
        self.tls = Some(Arc::new(acceptor.into()));
        self
    }

    /// Binds the listener and serves incoming connections until an accept
    /// fails.
    pub async fn listen(self) -> Result<(), WebSocketError> {
        let listener = TcpListener::bind((self.ip, self.port))
            .await
            .map_err(|e| WebSocketError::TcpBindError(e))?;
        self.serve(listener).await
    }

    /// Serves incoming connections from an already-bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<(), WebSocketError> {
        if let Ok(addr) = listener.local_addr() {
            info!(
                "Listening on {}://{}",
                if self.tls.is_none() { "ws" } else { "wss" },
                addr
            );
        }
        loop {
            let (tcp_stream, peer) = listener
                .accept()
                .await
                .map_err(|e| WebSocketError::TcpAcceptError(e))?;
            debug!("accepted connection from {}", peer);

            let handler = Arc::clone(&self.handler);
            let tls = self.tls.clone();
            tokio::spawn(async move {
                let stream = match tls {
                    Some(acceptor) => match Stream::accept_tls(tcp_stream, &acceptor).await {
                        Ok(stream) => stream,
                        Err(err) => {
                            debug!("TLS accept from {} failed: {}", peer, err);
                            return;
                        }
                    },
                    None => Stream::Plain(tcp_stream),
                };
                handle_connection(handler, stream).await;
            });
        }
    }
}

/// Runs one connection to completion: reader, writer, and the application
/// handler share a scope, and the transport is closed no matter which of
/// them fails first.
async fn handle_connection(handler: Handler, stream: Stream) {
    let (connection, reader, writer) = WebSocketConnection::new(stream, ProtocolEngine::server());

    let mut scope = JoinSet::new();
    scope.spawn(reader.run());
    scope.spawn(writer.run());
    scope.spawn(handler(connection.clone()));

    while let Some(result) = scope.join_next().await {
        if result.is_err() {
            scope.abort_all();
            connection.shutdown_transport().await;
        }
    }
}
