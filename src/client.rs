use std::net::ToSocketAddrs;

use log::info;
use tokio::net::TcpStream;
use url::Url;

use crate::connection::WebSocketConnection;
use crate::error::WebSocketError;
use crate::protocol::ProtocolEngine;
use crate::stream::Stream;
use crate::tls::Tls;

/// WebSocket client.
///
/// Connects to a server, performs the opening handshake, spawns the
/// connection's background tasks onto the current runtime, and hands back a
/// [`WebSocketConnection`].
pub struct WebSocketClient {
    host: String,
    port: u16,
    resource: String,
    tls: Tls,
}

impl WebSocketClient {
    /// Creates a client for `host:port` requesting `resource`.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        resource: impl Into<String>,
        tls: impl Into<Tls>,
    ) -> Self {
        let resource = resource.into();
        let resource = if resource.starts_with('/') {
            resource
        } else {
            format!("/{}", resource)
        };
        Self {
            host: host.into(),
            port,
            resource,
            tls: tls.into(),
        }
    }

    /// Creates a client from a `ws://` or `wss://` URL.
    pub fn from_url(url: &str) -> Result<Self, WebSocketError> {
        let parsed = Url::parse(url).map_err(|e| WebSocketError::ParseError(e))?;
        let tls = match parsed.scheme() {
            "ws" => Tls::No,
            "wss" => Tls::Yes,
            _ => return Err(WebSocketError::SchemeError),
        };
        let host = parsed.host_str().ok_or(WebSocketError::HostError)?;
        let port = parsed
            .port_or_known_default()
            .ok_or(WebSocketError::PortError)?;
        let resource = match parsed.query() {
            Some(query) => format!("{}?{}", parsed.path(), query),
            None => parsed.path().to_owned(),
        };
        Ok(Self::new(host, port, resource, tls))
    }

    /// Connects to the WebSocket server.
    ///
    /// The opening handshake completes in the background; messages sent
    /// before it finishes are queued and flushed in order once it does.
    pub async fn connect(self) -> Result<WebSocketConnection, WebSocketError> {
        info!(
            "Connecting to {}://{}:{}{}",
            if self.tls.is_secure() { "wss" } else { "ws" },
            self.host,
            self.port,
            self.resource
        );
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| WebSocketError::SocketAddrError(e))?
            .next()
            .ok_or(WebSocketError::ResolutionError)?;
        let tcp_stream = TcpStream::connect(addr)
            .await
            .map_err(|e| WebSocketError::TcpConnectionError(e))?;
        let stream = match self.tls.into_connector()? {
            Some(connector) => Stream::Plain(tcp_stream).into_tls(&self.host, connector).await?,
            None => Stream::Plain(tcp_stream),
        };

        let host_header = if self.port == 80 || self.port == 443 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        };
        let engine = ProtocolEngine::client(&host_header, &self.resource);
        let (connection, reader, writer) = WebSocketConnection::new(stream, engine);
        tokio::spawn(reader.run());
        tokio::spawn(writer.run());
        Ok(connection)
    }
}
