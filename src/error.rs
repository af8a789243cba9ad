use native_tls::Error as NativeTlsError;
use std::io::Error as IoError;
use thiserror::Error;
use url::ParseError;

use crate::close::CloseReason;

#[derive(Error, Debug)]
pub enum WebSocketError {
    /// The operation cannot be completed because the connection is closed
    /// or in the process of closing. Carries the [`CloseReason`].
    #[error("connection closed: {0}")]
    ConnectionClosed(CloseReason),

    // connection errors
    #[error("could not bind TCP listener")]
    TcpBindError(IoError),
    #[error("could not accept TCP connection")]
    TcpAcceptError(IoError),
    #[error("could not connect using TCP")]
    TcpConnectionError(IoError),
    #[error("could not connect using TLS")]
    TlsConnectionError(NativeTlsError),
    #[error("could not use given TLS configuration")]
    TlsConfigError(NativeTlsError),

    // frame errors
    #[error("control frame has payload larger than 125 bytes")]
    ControlFrameTooLargeError,
    #[error("payload is too large")]
    PayloadTooLargeError,

    // url errors
    #[error("url could not be parsed")]
    ParseError(ParseError),
    #[error(r#"invalid websocket scheme (use "ws" or "wss")"#)]
    SchemeError,
    #[error("invalid or missing host")]
    HostError,
    #[error("invalid or unknown port")]
    PortError,
    #[error("could not parse into SocketAddrs")]
    SocketAddrError(IoError),
    #[error("could not resolve domain")]
    ResolutionError,
}

impl WebSocketError {
    /// Returns the [`CloseReason`] if this is a `ConnectionClosed` error.
    pub fn close_reason(&self) -> Option<&CloseReason> {
        match self {
            Self::ConnectionClosed(reason) => Some(reason),
            _ => None,
        }
    }
}
