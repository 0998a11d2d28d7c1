//! Builds a `rumqttc` client and event loop for one session.
//!
//! ```ignore
//! let (client, event_loop) = ClientBuilder::new(&config, &params)
//!     .password(Some(token))
//!     .client_auth(None)
//!     .build()?;
//! ```

use std::{fs, time::Duration};

use rumqttc::{AsyncClient, EventLoop, MqttOptions, TlsConfiguration, Transport};

use super::{
    config::{check_readable_file, Config},
    error::TransferError,
    TransportParams,
};

/// PEM client certificate and private key for mutual TLS.
#[derive(Clone)]
pub struct ClientAuth {
    pub certificate: Vec<u8>,
    pub private_key: Vec<u8>,
}

impl std::fmt::Debug for ClientAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientAuth")
            .field("certificate", &format_args!("{} bytes", self.certificate.len()))
            .field("private_key", &"<redacted>")
            .finish()
    }
}

pub struct ClientBuilder<'a> {
    config: &'a Config,
    params: &'a TransportParams,
    password: Option<String>,
    client_auth: Option<ClientAuth>,
}

impl<'a> ClientBuilder<'a> {
    pub fn new(config: &'a Config, params: &'a TransportParams) -> Self {
        Self {
            config,
            params,
            password: None,
            client_auth: None,
        }
    }

    /// Password sent in CONNECT. For IoT hubs this is the SAS token.
    pub fn password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    /// Client certificate presented during the TLS handshake.
    pub fn client_auth(mut self, client_auth: Option<ClientAuth>) -> Self {
        self.client_auth = client_auth;
        self
    }

    fn options(&self) -> MqttOptions {
        let mut opts = MqttOptions::new(
            self.params.client_id.clone(),
            self.params.hostname.clone(),
            self.config.port,
        );
        opts.set_keep_alive(Duration::from_secs(self.config.keep_alive));
        opts.set_clean_session(self.config.clean_session);
        opts.set_inflight(self.config.max_inflight);

        if let Some(max_packet_size) = self.config.max_packet_size {
            opts.set_max_packet_size(max_packet_size as usize, max_packet_size as usize);
        }

        if !self.params.username.is_empty() {
            opts.set_credentials(
                self.params.username.clone(),
                self.password.clone().unwrap_or_default(),
            );
        }
        opts
    }

    /// CA bundle: from the params first, then the configured file.
    fn ca(&self) -> Result<Option<Vec<u8>>, TransferError> {
        if let Some(pem) = &self.params.ca_cert {
            return Ok(Some(pem.as_bytes().to_vec()));
        }
        match &self.config.ca_cert_path {
            Some(path) => {
                check_readable_file(path).map_err(|e| {
                    TransferError::ClientSetup(format!("Invalid TLS configuration: {e}"))
                })?;
                Ok(Some(fs::read(path)?))
            }
            None => Ok(None),
        }
    }

    fn transport(&self) -> Result<Transport, TransferError> {
        if !self.config.tls {
            if self.client_auth.is_some() {
                return Err(TransferError::ClientSetup(
                    "a client certificate requires TLS to be enabled".into(),
                ));
            }
            return Ok(Transport::Tcp);
        }

        let client_auth = self
            .client_auth
            .as_ref()
            .map(|auth| (auth.certificate.clone(), auth.private_key.clone()));

        match (self.ca()?, client_auth) {
            (Some(ca), client_auth) => Ok(Transport::Tls(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth,
            })),
            (None, None) => Ok(Transport::tls_with_default_config()),
            (None, Some(_)) => Err(TransferError::ClientSetup(
                "a client certificate requires a CA certificate".into(),
            )),
        }
    }

    pub fn build(self) -> Result<(AsyncClient, EventLoop), TransferError> {
        if self.params.hostname.is_empty() {
            return Err(TransferError::ClientSetup("hostname must not be empty".into()));
        }

        let mut opts = self.options();
        opts.set_transport(self.transport()?);

        let cap = self.config.request_channel_capacity.unwrap_or(10) as usize;
        Ok(AsyncClient::new(opts, cap))
    }
}
