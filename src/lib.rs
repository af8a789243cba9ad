//! A message-oriented WebSocket endpoint runtime for tokio.
//!
//! Each connection is driven by a pair of background tasks: a reader that
//! feeds network bytes through a framing state machine and assembles
//! fragmented messages, and a writer that flushes the state machine's
//! outbound bytes. Applications interact with a [`WebSocketConnection`]
//! through four operations: [`send_message`](WebSocketConnection::send_message),
//! [`get_message`](WebSocketConnection::get_message),
//! [`ping`](WebSocketConnection::ping), and
//! [`close`](WebSocketConnection::close).
//!
//! # Server
//!
//! ```no_run
//! use std::net::{IpAddr, Ipv4Addr};
//! use ws_endpoint::{WebSocketConnection, WebSocketServer};
//!
//! async fn echo(connection: WebSocketConnection) {
//!     while let Ok(message) = connection.get_message().await {
//!         if connection.send_message(message).await.is_err() {
//!             break;
//!         }
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = WebSocketServer::new(echo, IpAddr::V4(Ipv4Addr::LOCALHOST), 9000);
//!     server.listen().await.unwrap();
//! }
//! ```
//!
//! # Client
//!
//! ```no_run
//! use ws_endpoint::WebSocketClient;
//!
//! #[tokio::main]
//! async fn main() {
//!     let connection = WebSocketClient::new("localhost", 9000, "/", false)
//!         .connect()
//!         .await
//!         .unwrap();
//!     connection.send_message("hello").await.unwrap();
//!     let reply = connection.get_message().await.unwrap();
//!     println!("{:?}", reply);
//!     connection.close(1000, None).await.unwrap();
//! }
//! ```

#![forbid(unsafe_code)]

mod client;
mod close;
mod connection;
mod error;
mod message;
mod protocol;
mod server;
mod stream;
mod tls;

pub use client::WebSocketClient;
pub use close::CloseReason;
pub use connection::WebSocketConnection;
pub use error::WebSocketError;
pub use message::Message;
pub use server::WebSocketServer;
pub use tls::Tls;
