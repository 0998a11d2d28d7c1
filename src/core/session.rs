//! Boundary between the protocol stage and a concrete protocol client.
//!
//! A [`ProtocolSession`] performs requests synchronously and reports their
//! outcome later through [`SessionHandlers`] and acknowledgement callbacks.
//! Those callbacks may fire on any thread; the protocol stage marshals them
//! back onto the pipeline context itself.

use std::{fmt, sync::Arc};

use bytes::Bytes;

use super::{
    error::Error,
    operation::{ClientCertificate, ConnectionArgs},
};

/// Called once when the broker acknowledges a publish, subscribe or
/// unsubscribe, or with an error when the request can no longer be
/// acknowledged.
pub type AckCallback = Box<dyn FnOnce(Result<(), Error>) + Send + 'static>;

pub type ConnectedHandler = Arc<dyn Fn() + Send + Sync + 'static>;
pub type ConnectionFailureHandler = Arc<dyn Fn(Error) + Send + Sync + 'static>;
pub type DisconnectedHandler = Arc<dyn Fn(Option<Error>) + Send + Sync + 'static>;
pub type MessageHandler = Arc<dyn Fn(String, Bytes) + Send + Sync + 'static>;

/// The four notification slots a session reports through.
#[derive(Clone)]
pub struct SessionHandlers {
    pub on_mqtt_connected: ConnectedHandler,
    pub on_mqtt_connection_failure: ConnectionFailureHandler,
    pub on_mqtt_disconnected: DisconnectedHandler,
    pub on_mqtt_message_received: MessageHandler,
}

impl fmt::Debug for SessionHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandlers").finish_non_exhaustive()
    }
}

/// A stateful protocol session.
///
/// Every method returns as soon as the request is handed to the client. An
/// `Err` means the request was never started.
pub trait ProtocolSession: Send {
    /// Starts connecting. The outcome arrives through `on_mqtt_connected` or
    /// `on_mqtt_connection_failure`.
    fn connect(
        &mut self,
        password: Option<&str>,
        client_certificate: Option<&ClientCertificate>,
    ) -> Result<(), Error>;

    /// Drops the current connection, if any, and connects again with a new
    /// password.
    fn reconnect(&mut self, password: Option<&str>) -> Result<(), Error>;

    /// Starts disconnecting. The outcome arrives through
    /// `on_mqtt_disconnected`.
    fn disconnect(&mut self) -> Result<(), Error>;

    fn publish(&mut self, topic: &str, payload: Bytes, on_ack: AckCallback) -> Result<(), Error>;

    fn subscribe(&mut self, topic: &str, on_ack: AckCallback) -> Result<(), Error>;

    fn unsubscribe(&mut self, topic: &str, on_ack: AckCallback) -> Result<(), Error>;
}

/// Builds sessions for the protocol stage.
pub trait SessionFactory: Send + Sync {
    fn create(
        &self,
        args: &ConnectionArgs,
        handlers: SessionHandlers,
    ) -> Result<Box<dyn ProtocolSession>, Error>;
}
