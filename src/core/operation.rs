//! Operations travelling down the pipeline and events travelling up.
//!
//! An [`Operation`] is created by client-facing code, routed down the stage
//! chain and finished exactly once. Finishing consumes the operation, so a
//! second completion cannot be expressed.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;

use super::error::Error;

/// Completion callback attached to an operation.
pub type OpCallback = Box<dyn FnOnce(Result<(), Error>) + Send + 'static>;

static NEXT_OP_ID: AtomicU64 = AtomicU64::new(1);

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionArgs {
    pub hostname: String,
    pub username: String,
    pub client_id: String,
    /// PEM encoded CA certificate used to verify the broker.
    pub ca_cert: Option<String>,
}

impl ConnectionArgs {
    pub fn new(
        hostname: impl Into<String>,
        username: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            username: username.into(),
            client_id: client_id.into(),
            ca_cert: None,
        }
    }

    pub fn with_ca_cert(mut self, ca_cert: impl Into<String>) -> Self {
        self.ca_cert = Some(ca_cert.into());
        self
    }
}

/// X.509 client certificate and its private key, both PEM encoded.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientCertificate {
    pub certificate: String,
    pub private_key: String,
}

impl fmt::Debug for ClientCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCertificate")
            .field("certificate", &format_args!("{} bytes", self.certificate.len()))
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Credential used on the next connect.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Shared access signature token, sent as the MQTT password.
    SasToken(String),
    /// Certificate presented during the TLS handshake.
    Certificate(ClientCertificate),
}

impl Credential {
    pub fn kind(&self) -> &'static str {
        match self {
            Credential::SasToken(_) => "sas token",
            Credential::Certificate(_) => "client certificate",
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::SasToken(_) => f.write_str("SasToken(<redacted>)"),
            Credential::Certificate(cert) => f.debug_tuple("Certificate").field(cert).finish(),
        }
    }
}

/// What an operation asks the pipeline to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpKind {
    SetConnectionArgs(ConnectionArgs),
    SetCredential(Credential),
    Connect,
    Reconnect,
    Disconnect,
    Publish { topic: String, payload: Bytes },
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    /// Handled by stages above the protocol stage.
    EnableFeature(String),
    /// Handled by stages above the protocol stage.
    DisableFeature(String),
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::SetConnectionArgs(_) => "SetConnectionArgs",
            OpKind::SetCredential(_) => "SetCredential",
            OpKind::Connect => "Connect",
            OpKind::Reconnect => "Reconnect",
            OpKind::Disconnect => "Disconnect",
            OpKind::Publish { .. } => "Publish",
            OpKind::Subscribe { .. } => "Subscribe",
            OpKind::Unsubscribe { .. } => "Unsubscribe",
            OpKind::EnableFeature(_) => "EnableFeature",
            OpKind::DisableFeature(_) => "DisableFeature",
        }
    }
}

pub struct Operation {
    id: u64,
    kind: OpKind,
    error: Option<Error>,
    callback: Option<OpCallback>,
}

impl Operation {
    pub fn new(kind: OpKind) -> Self {
        Self {
            id: NEXT_OP_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            error: None,
            callback: None,
        }
    }

    pub fn with_callback(kind: OpKind, callback: OpCallback) -> Self {
        let mut op = Self::new(kind);
        op.callback = Some(callback);
        op
    }

    /// Process-unique identifier, used in logs and for acknowledgement
    /// bookkeeping.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> &OpKind {
        &self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Records a failure. A later failure replaces an earlier one.
    pub fn set_error(&mut self, error: Error) {
        self.error = Some(error);
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Splits the operation into its callback and outcome. Consumes the
    /// operation, so it cannot be finished twice.
    pub fn finish(self) -> (Option<OpCallback>, Result<(), Error>) {
        let outcome = match self.error {
            Some(error) => Err(error),
            None => Ok(()),
        };
        (self.callback, outcome)
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("error", &self.error)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Upward notification. No completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    IncomingMessage { topic: String, payload: Bytes },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::IncomingMessage { .. } => "IncomingMessage",
        }
    }
}
