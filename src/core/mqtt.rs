//! `ProtocolSession` over the `hubpipe_mqtt` transport.
//!
//! Transport failures are classified into a client library result code or a
//! CONNACK code first and then through the generic mapper, so every error
//! leaving this module carries an [`MqttLibraryError`](super::error::library::MqttLibraryError)
//! as its cause and the transport's own description as its message.

use std::{io, sync::Arc};

use bytes::Bytes;
use hubpipe_mqtt::{
    rumqttc::{ClientError, ConnectReturnCode, ConnectionError},
    ClientAuth, MqttTransport, TransferError, TransportCallbacks, TransportParams,
};
use tokio::runtime::Handle;
use tracing::debug;

use super::{
    error::{
        library::{connack, rc},
        Error,
    },
    operation::{ClientCertificate, ConnectionArgs},
    session::{AckCallback, ProtocolSession, SessionFactory, SessionHandlers},
};
use crate::config::TransportConfig;

/// Creates one [`MqttTransport`] per `SetConnectionArgs`, driven on the
/// tokio runtime captured at construction.
#[derive(Debug)]
pub struct MqttSessionFactory {
    config: TransportConfig,
    runtime: Handle,
}

impl MqttSessionFactory {
    /// Captures the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails with a Pipeline error outside a runtime.
    pub fn new(config: TransportConfig) -> Result<Self, Error> {
        let runtime = Handle::try_current().map_err(|e| {
            Error::pipeline("the MQTT session factory must be created inside a tokio runtime")
                .with_cause(e)
        })?;
        Ok(Self::with_runtime(config, runtime))
    }

    pub fn with_runtime(config: TransportConfig, runtime: Handle) -> Self {
        Self { config, runtime }
    }
}

impl SessionFactory for MqttSessionFactory {
    fn create(
        &self,
        args: &ConnectionArgs,
        handlers: SessionHandlers,
    ) -> Result<Box<dyn ProtocolSession>, Error> {
        let params = TransportParams {
            client_id: args.client_id.clone(),
            hostname: args.hostname.clone(),
            username: args.username.clone(),
            ca_cert: args.ca_cert.clone(),
        };

        let on_failure = handlers.on_mqtt_connection_failure;
        let on_disconnected = handlers.on_mqtt_disconnected;
        let callbacks = TransportCallbacks {
            on_connected: handlers.on_mqtt_connected,
            on_connection_failure: Arc::new(move |e: TransferError| on_failure(transfer_error(&e))),
            on_disconnected: Arc::new(move |e: Option<TransferError>| {
                on_disconnected(e.as_ref().map(transfer_error))
            }),
            on_message: handlers.on_mqtt_message_received,
        };

        debug!("Creating MQTT session for {}", params.client_id);
        Ok(Box::new(MqttSession {
            transport: MqttTransport::new(
                self.config.clone(),
                params,
                callbacks,
                self.runtime.clone(),
            ),
        }))
    }
}

struct MqttSession {
    transport: MqttTransport,
}

impl ProtocolSession for MqttSession {
    fn connect(
        &mut self,
        password: Option<&str>,
        client_certificate: Option<&ClientCertificate>,
    ) -> Result<(), Error> {
        let client_auth = client_certificate.map(|cert| ClientAuth {
            certificate: cert.certificate.as_bytes().to_vec(),
            private_key: cert.private_key.as_bytes().to_vec(),
        });
        self.transport
            .connect(password, client_auth)
            .map_err(|e| transfer_error(&e))
    }

    fn reconnect(&mut self, password: Option<&str>) -> Result<(), Error> {
        self.transport
            .reconnect(password)
            .map_err(|e| transfer_error(&e))
    }

    fn disconnect(&mut self) -> Result<(), Error> {
        self.transport.disconnect().map_err(|e| transfer_error(&e))
    }

    fn publish(&mut self, topic: &str, payload: Bytes, on_ack: AckCallback) -> Result<(), Error> {
        self.transport
            .publish(topic, payload, translate_ack(on_ack))
            .map_err(|e| transfer_error(&e))
    }

    fn subscribe(&mut self, topic: &str, on_ack: AckCallback) -> Result<(), Error> {
        self.transport
            .subscribe(topic, translate_ack(on_ack))
            .map_err(|e| transfer_error(&e))
    }

    fn unsubscribe(&mut self, topic: &str, on_ack: AckCallback) -> Result<(), Error> {
        self.transport
            .unsubscribe(topic, translate_ack(on_ack))
            .map_err(|e| transfer_error(&e))
    }
}

fn translate_ack(on_ack: AckCallback) -> hubpipe_mqtt::AckHandler {
    Box::new(move |result| on_ack(result.map_err(|e| transfer_error(&e))))
}

/// Classifies a transport failure and maps it to a generic error.
pub fn transfer_error(e: &TransferError) -> Error {
    let classified = match e {
        TransferError::ClientConnection(c) => return connection_error(c).with_message(e.to_string()),
        TransferError::ClientRequest(ClientError::TryRequest(_)) => rc::QUEUE_SIZE,
        TransferError::ClientRequest(_) | TransferError::NotConnected => rc::NO_CONN,
        TransferError::ConnectionClosed => rc::CONN_LOST,
        TransferError::ClientSetup(_) | TransferError::ConfigError(_) => rc::INVAL,
        TransferError::Io(_) => rc::ERRNO,
        TransferError::SubscriptionRejected(_) => rc::ACL_DENIED,
    };
    Error::from_result_code(classified).with_message(e.to_string())
}

fn connection_error(e: &ConnectionError) -> Error {
    let code = match e {
        ConnectionError::ConnectionRefused(code) => {
            return Error::from_connect_code(connack_code(*code))
        }
        ConnectionError::Tls(_) => rc::TLS,
        ConnectionError::MqttState(_) | ConnectionError::NotConnAck(_) => rc::PROTOCOL,
        ConnectionError::RequestsDone => rc::NO_CONN,
        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => rc::CONN_LOST,
        ConnectionError::Io(io_err) => match io_err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => rc::CONN_LOST,
            _ => rc::ERRNO,
        },
        #[allow(unreachable_patterns)]
        _ => rc::UNKNOWN,
    };
    Error::from_result_code(code)
}

fn connack_code(code: ConnectReturnCode) -> u8 {
    match code {
        ConnectReturnCode::Success => connack::ACCEPTED,
        ConnectReturnCode::RefusedProtocolVersion => connack::REFUSED_PROTOCOL_VERSION,
        ConnectReturnCode::BadClientId => connack::REFUSED_IDENTIFIER_REJECTED,
        ConnectReturnCode::ServiceUnavailable => connack::REFUSED_SERVER_UNAVAILABLE,
        ConnectReturnCode::BadUserNamePassword => connack::REFUSED_BAD_USERNAME_PASSWORD,
        ConnectReturnCode::NotAuthorized => connack::REFUSED_NOT_AUTHORIZED,
    }
}
