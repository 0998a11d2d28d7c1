//! Error type for MQTT session operations.
//!
//! `TransferError` keeps the `rumqttc` error it came from, so a caller
//! translating it into its own taxonomy can still look at the protocol-level
//! detail.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    /// The client could not be built from the configuration and parameters
    /// (unreadable certificate, bad address).
    #[error("Client setup error: {0}")]
    ClientSetup(String),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] validator::ValidationErrors),

    /// The request could not be handed to the client (request queue full or
    /// event loop gone).
    #[error("Client request error: {0}")]
    ClientRequest(#[from] rumqttc::ClientError),

    /// The connection to the broker failed or was lost.
    ///
    /// Boxed to keep the enum small.
    #[error("Client connection error: {0}")]
    ClientConnection(#[from] Box<rumqttc::ConnectionError>),

    /// I/O failure outside the connection, such as reading a certificate.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A request needing a live connection was made without one.
    #[error("The client is not currently connected.")]
    NotConnected,

    /// The connection ended before the request was acknowledged.
    #[error("The connection closed before the request was acknowledged.")]
    ConnectionClosed,

    /// The broker refused a subscription.
    #[error("Subscription rejected by broker: {0}")]
    SubscriptionRejected(String),
}

impl From<rumqttc::ConnectionError> for TransferError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        TransferError::ClientConnection(Box::new(err))
    }
}

impl TransferError {
    /// The wrapped connection error, if this is one.
    pub fn connection_error(&self) -> Option<&rumqttc::ConnectionError> {
        match self {
            TransferError::ClientConnection(e) => Some(e),
            _ => None,
        }
    }
}
