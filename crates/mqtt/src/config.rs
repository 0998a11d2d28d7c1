//! Transport settings for MQTT sessions.
//!
//! Broker address, client id and username are not configured here: they
//! arrive per session as [`TransportParams`](crate::TransportParams) built
//! from the pipeline's connection arguments. This section only holds the
//! knobs that stay the same for every session.
//!
//! # Examples
//!
//! ```toml
//! [transport]
//! port = 8883
//! keep_alive = 60
//! qos = 1
//! tls = true
//! ca_cert_path = "/etc/hubpipe/ca.pem"
//! ```

use std::{fs, io};

use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    /// 8883 for MQTT over TLS, 1883 for plain MQTT with `tls = false`.
    #[validate(range(min = 1, message = "port 0 is not a broker port"))]
    pub port: u16,

    /// Seconds of silence before the client pings. The broker gives up after
    /// one and a half of these.
    #[validate(range(min = 5, max = 3600, message = "keep_alive must be 5..=3600 seconds"))]
    pub keep_alive: u64,

    pub clean_session: bool,

    /// Unacknowledged QoS 1/2 publishes the client keeps in flight.
    #[validate(range(min = 1, max = 1000, message = "max_inflight must be 1..=1000"))]
    pub max_inflight: u16,

    /// Upper bound on packet size, incoming and outgoing. `None` keeps the
    /// client library's default.
    #[validate(range(min = 64, message = "max_packet_size below 64 bytes cannot carry a CONNECT"))]
    pub max_packet_size: Option<u16>,

    /// Requests queued inside the client before `try_*` calls are refused
    /// with a queue-full error.
    #[validate(range(min = 1, max = 255, message = "request_channel_capacity must be 1..=255"))]
    pub request_channel_capacity: Option<u8>,

    /// 0, 1 or 2; applies to publishes and subscriptions alike. QoS 0
    /// publishes complete as soon as they are written.
    #[validate(range(max = 2, message = "qos must be 0, 1 or 2"))]
    pub qos: u8,

    pub tls: bool,

    /// PEM bundle used when the connection arguments carry no CA. With
    /// neither, the platform trust store is used.
    #[validate(custom(function = "check_readable_file"))]
    pub ca_cert_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8883,
            keep_alive: 60,
            clean_session: false,
            max_inflight: 10,
            max_packet_size: Some(u16::MAX),
            request_channel_capacity: Some(10),
            qos: 1,
            tls: true,
            ca_cert_path: None,
        }
    }
}

impl Config {
    /// Anything out of range reads as at-least-once.
    pub fn qos(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtLeastOnce,
        }
    }
}

/// `path` must name a regular file this process can open.
pub(crate) fn check_readable_file(path: &str) -> Result<(), ValidationError> {
    let fail = |code: &'static str, message: String| {
        Err(ValidationError::new(code).with_message(message.into()))
    };

    if path.is_empty() {
        return fail("empty_path", "file path is empty".into());
    }
    match fs::metadata(path) {
        Ok(meta) if !meta.is_file() => fail("not_a_file", format!("{path} is not a regular file")),
        Ok(_) => fs::File::open(path)
            .map(drop)
            .or_else(|e| fail("file_not_readable", format!("cannot read {path}: {e}"))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fail("file_not_found", format!("{path} does not exist"))
        }
        Err(e) => fail("file_not_readable", format!("cannot stat {path}: {e}")),
    }
}
