use native_tls::TlsConnector;

use crate::error::WebSocketError;

/// Whether and how a [`WebSocketClient`](crate::WebSocketClient) secures its
/// transport.
///
/// `true.into()` selects TLS with a default connector, `false.into()` selects
/// plaintext, and a [`TlsConnector`] selects TLS with a custom configuration.
pub enum Tls {
    /// Plaintext TCP.
    No,
    /// TLS with a default [`TlsConnector`].
    Yes,
    /// TLS with the given [`TlsConnector`].
    Connector(TlsConnector),
}

impl Tls {
    /// Resolves to the connector to use, or None for plaintext.
    pub(crate) fn into_connector(self) -> Result<Option<TlsConnector>, WebSocketError> {
        match self {
            Self::No => Ok(None),
            Self::Yes => TlsConnector::new()
                .map(Some)
                .map_err(|e| WebSocketError::TlsConfigError(e)),
            Self::Connector(connector) => Ok(Some(connector)),
        }
    }

    pub(crate) fn is_secure(&self) -> bool {
        !matches!(self, Self::No)
    }
}

impl From<bool> for Tls {
    fn from(use_tls: bool) -> Self {
        if use_tls {
            Self::Yes
        } else {
            Self::No
        }
    }
}

impl From<TlsConnector> for Tls {
    fn from(connector: TlsConnector) -> Self {
        Self::Connector(connector)
    }
}
