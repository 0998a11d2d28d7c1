//! # hubpipe-mqtt: MQTT sessions for the hubpipe protocol stage
//!
//! A thin session layer over `rumqttc` shaped for a pipeline that wants
//! synchronous, non-blocking requests and callback-reported outcomes:
//!
//! - **Explicit lifecycle**: connect, reconnect and disconnect on request,
//!   never on its own
//! - **Callback reporting** of connect, connection failure, disconnect and
//!   incoming messages
//! - **Per-request acknowledgements** for publish, subscribe and unsubscribe,
//!   correlated through packet ids
//! - **TLS** with a CA from the connection parameters, a file, or the
//!   platform trust store, and optional client certificates
//!
//! # Quick Start
//!
//! ```ignore
//! let params = TransportParams {
//!     client_id: "device-1".into(),
//!     hostname: "hub.example.net".into(),
//!     username: "hub.example.net/device-1/?api-version=2018-06-30".into(),
//!     ca_cert: None,
//! };
//! let mut transport = MqttTransport::new(Config::default(), params, callbacks, Handle::current());
//! transport.connect(Some(&sas_token), None)?;
//! ```

mod acks;
mod client;
mod config;
mod error;
mod transport;

pub use rumqttc;

pub use acks::AckHandler;
pub use client::{ClientAuth, ClientBuilder};
pub use config::Config;
pub use error::TransferError;
pub use transport::{MqttTransport, TransportCallbacks};

/// Per-session connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParams {
    pub client_id: String,
    pub hostname: String,
    pub username: String,
    /// PEM CA bundle overriding the configured one.
    pub ca_cert: Option<String>,
}
