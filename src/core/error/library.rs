//! Errors reported by the MQTT client library, before translation to the
//! generic taxonomy.
//!
//! Two numeric spaces feed this type: CONNACK refusal codes returned by the
//! broker during the handshake, and result codes returned by the client
//! library for any other call. Each code gets its own variant so that the
//! original meaning survives as the causal parent of the generic error.

use thiserror::Error;

use super::ErrorKind;

/// CONNACK return codes (MQTT 3.1.1, section 3.2.2.3).
pub mod connack {
    pub const ACCEPTED: u8 = 0;
    pub const REFUSED_PROTOCOL_VERSION: u8 = 1;
    pub const REFUSED_IDENTIFIER_REJECTED: u8 = 2;
    pub const REFUSED_SERVER_UNAVAILABLE: u8 = 3;
    pub const REFUSED_BAD_USERNAME_PASSWORD: u8 = 4;
    pub const REFUSED_NOT_AUTHORIZED: u8 = 5;
}

/// Client library result codes.
pub mod rc {
    pub const SUCCESS: i32 = 0;
    pub const NOMEM: i32 = 1;
    pub const PROTOCOL: i32 = 2;
    pub const INVAL: i32 = 3;
    pub const NO_CONN: i32 = 4;
    pub const CONN_REFUSED: i32 = 5;
    pub const NOT_FOUND: i32 = 6;
    pub const CONN_LOST: i32 = 7;
    pub const TLS: i32 = 8;
    pub const PAYLOAD_SIZE: i32 = 9;
    pub const NOT_SUPPORTED: i32 = 10;
    pub const AUTH: i32 = 11;
    pub const ACL_DENIED: i32 = 12;
    pub const UNKNOWN: i32 = 13;
    pub const ERRNO: i32 = 14;
    pub const QUEUE_SIZE: i32 = 15;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum MqttLibraryError {
    #[error("Connection Refused: unacceptable protocol version.")]
    RefusedProtocolVersion,

    #[error("Connection Refused: identifier rejected.")]
    RefusedIdentifierRejected,

    #[error("Connection Refused: broker unavailable.")]
    RefusedServerUnavailable,

    #[error("Connection Refused: bad user name or password.")]
    RefusedBadUsernamePassword,

    #[error("Connection Refused: not authorised.")]
    RefusedNotAuthorized,

    #[error("Connection Refused: unknown reason (code {0}).")]
    RefusedUnknown(u8),

    #[error("Out of memory.")]
    NoMemory,

    #[error("A network protocol error occurred when communicating with the broker.")]
    Protocol,

    #[error("Invalid function arguments provided.")]
    InvalidArgs,

    #[error("The client is not currently connected.")]
    NoConnection,

    #[error("The connection was refused.")]
    ConnectionRefused,

    #[error("Message not found (internal error).")]
    NotFound,

    #[error("The connection was lost.")]
    ConnectionLost,

    #[error("A TLS error occurred.")]
    Tls,

    #[error("Payload too large.")]
    PayloadSize,

    #[error("This feature is not supported.")]
    NotSupported,

    #[error("Authorisation failed.")]
    Auth,

    #[error("Access denied by ACL.")]
    AclDenied,

    #[error("Unknown error.")]
    Unknown,

    #[error("Message queue full.")]
    QueueSize,

    #[error("Unknown result code {0}.")]
    UnknownCode(i32),
}

impl MqttLibraryError {
    /// Builds the library error for a non-zero CONNACK code.
    pub fn from_connect_code(code: u8) -> Self {
        match code {
            connack::REFUSED_PROTOCOL_VERSION => Self::RefusedProtocolVersion,
            connack::REFUSED_IDENTIFIER_REJECTED => Self::RefusedIdentifierRejected,
            connack::REFUSED_SERVER_UNAVAILABLE => Self::RefusedServerUnavailable,
            connack::REFUSED_BAD_USERNAME_PASSWORD => Self::RefusedBadUsernamePassword,
            connack::REFUSED_NOT_AUTHORIZED => Self::RefusedNotAuthorized,
            other => Self::RefusedUnknown(other),
        }
    }

    /// Builds the library error for a non-zero library result code.
    pub fn from_result_code(code: i32) -> Self {
        match code {
            rc::NOMEM => Self::NoMemory,
            rc::PROTOCOL => Self::Protocol,
            rc::INVAL => Self::InvalidArgs,
            rc::NO_CONN => Self::NoConnection,
            rc::CONN_REFUSED => Self::ConnectionRefused,
            rc::NOT_FOUND => Self::NotFound,
            rc::CONN_LOST => Self::ConnectionLost,
            rc::TLS => Self::Tls,
            rc::PAYLOAD_SIZE => Self::PayloadSize,
            rc::NOT_SUPPORTED => Self::NotSupported,
            rc::AUTH => Self::Auth,
            rc::ACL_DENIED => Self::AclDenied,
            rc::UNKNOWN => Self::Unknown,
            rc::ERRNO => Self::Unknown,
            rc::QUEUE_SIZE => Self::QueueSize,
            other => Self::UnknownCode(other),
        }
    }

    /// Generic kind a library error is reported as.
    pub fn generic_kind(&self) -> ErrorKind {
        match self {
            Self::RefusedServerUnavailable => ErrorKind::ConnectionFailed,
            Self::RefusedBadUsernamePassword | Self::RefusedNotAuthorized => {
                ErrorKind::Unauthorized
            }
            Self::RefusedProtocolVersion
            | Self::RefusedIdentifierRejected
            | Self::RefusedUnknown(_) => ErrorKind::Transport,

            Self::NoConnection | Self::ConnectionLost => ErrorKind::ConnectionDropped,
            Self::ConnectionRefused | Self::Tls | Self::Auth | Self::AclDenied => {
                ErrorKind::Unauthorized
            }
            Self::NoMemory
            | Self::Protocol
            | Self::InvalidArgs
            | Self::NotFound
            | Self::PayloadSize
            | Self::NotSupported
            | Self::Unknown
            | Self::QueueSize
            | Self::UnknownCode(_) => ErrorKind::Transport,
        }
    }
}
