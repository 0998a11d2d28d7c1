//! Generic error taxonomy shared by every pipeline layer.
//!
//! All failures that leave the pipeline, whatever their origin, are expressed
//! as an [`Error`] tagged with one [`ErrorKind`]:
//!
//! **Service failures** arrive as HTTP-style status codes and are translated by
//! [`Error::from_status_code`].
//!
//! **Protocol library failures** arrive as CONNACK refusal codes or library
//! result codes. They are first turned into a library-specific
//! [`MqttLibraryError`] and then into a generic kind by
//! [`Error::from_connect_code`] / [`Error::from_result_code`]. The library
//! error stays attached as the causal parent, so logs can show both levels
//! while retry policy above only ever looks at the generic kind.
//!
//! **Pipeline failures** (superseded operations, unhandled operations, closed
//! contexts) are built directly with [`Error::pipeline`].
//!
//! # Usage
//!
//! ```ignore
//! let err = Error::from_connect_code(5);
//! assert_eq!(err.kind(), ErrorKind::Unauthorized);
//! assert_eq!(err.library_cause(), Some(&MqttLibraryError::RefusedNotAuthorized));
//! ```

use std::{error::Error as StdError, fmt, sync::Arc};

pub mod library;

pub use library::MqttLibraryError;

/// Shared, type-erased causal error.
pub type Cause = Arc<dyn StdError + Send + Sync + 'static>;

/// Closed set of library- and service-agnostic failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The operation was cancelled before it could finish.
    OperationCancelled,
    /// A connection could not be established.
    ConnectionFailed,
    /// A previously established connection was dropped.
    ConnectionDropped,
    /// Service returned 400.
    Argument,
    /// Authorization failed or service returned 401.
    Unauthorized,
    /// Service returned 403.
    QuotaExceeded,
    /// Service returned 404.
    NotFound,
    /// Operation timed out, service returned 408 or 504.
    Timeout,
    /// Service returned 409.
    AlreadyExists,
    /// Service returned 412.
    InvalidEtag,
    /// Service returned 413.
    MessageTooLarge,
    /// Service returned 429.
    Throttling,
    /// Service returned 500.
    InternalService,
    /// Service returned 502.
    BadResponse,
    /// Service returned 503.
    ServiceUnavailable,
    /// Service returned a status code outside the known table.
    FailedStatusCode,
    /// Error reported by the protocol client library.
    Transport,
    /// Error raised by the pipeline itself.
    Pipeline,
}

impl ErrorKind {
    /// Returns a short, static identifier for the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::OperationCancelled => "OperationCancelled",
            ErrorKind::ConnectionFailed => "ConnectionFailed",
            ErrorKind::ConnectionDropped => "ConnectionDropped",
            ErrorKind::Argument => "Argument",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::QuotaExceeded => "QuotaExceeded",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::AlreadyExists => "AlreadyExists",
            ErrorKind::InvalidEtag => "InvalidEtag",
            ErrorKind::MessageTooLarge => "MessageTooLarge",
            ErrorKind::Throttling => "Throttling",
            ErrorKind::InternalService => "InternalService",
            ErrorKind::BadResponse => "BadResponse",
            ErrorKind::ServiceUnavailable => "ServiceUnavailable",
            ErrorKind::FailedStatusCode => "FailedStatusCode",
            ErrorKind::Transport => "Transport",
            ErrorKind::Pipeline => "Pipeline",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generic pipeline error: a kind, a message, and an optional causal parent.
///
/// Cloning is cheap; the cause is reference counted so the same failure can be
/// attached to an operation and reported to the unhandled-failure sink.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    #[source]
    cause: Option<Cause>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    /// Shorthand for an error raised by the pipeline itself.
    pub fn pipeline(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Pipeline, message)
    }

    /// Attaches `cause` as the causal parent, replacing any previous one.
    pub fn with_cause(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Replaces the message while keeping kind and cause.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// Returns the causal parent when it is a protocol library error.
    pub fn library_cause(&self) -> Option<&MqttLibraryError> {
        self.cause
            .as_deref()
            .and_then(|cause| cause.downcast_ref::<MqttLibraryError>())
    }

    /// Maps a service status code to a generic error.
    ///
    /// Codes outside the table produce [`ErrorKind::FailedStatusCode`]. The
    /// message is kept verbatim in every case.
    pub fn from_status_code(code: u16, message: impl Into<String>) -> Self {
        Self::new(status_code_kind(code), message)
    }

    /// Wraps a library error in its generic counterpart, keeping it as cause.
    pub fn from_library(error: MqttLibraryError) -> Self {
        Self::new(error.generic_kind(), error.to_string()).with_cause(error)
    }

    /// Maps a CONNACK refusal code through the library error table.
    pub fn from_connect_code(code: u8) -> Self {
        Self::from_library(MqttLibraryError::from_connect_code(code))
    }

    /// Maps a protocol library result code through the library error table.
    pub fn from_result_code(rc: i32) -> Self {
        Self::from_library(MqttLibraryError::from_result_code(rc))
    }

    /// Renders the error followed by every cause in its chain.
    pub fn chain_report(&self) -> String {
        let mut report = self.to_string();
        let mut current = StdError::source(self);
        while let Some(cause) = current {
            report.push_str(" (caused by: ");
            report.push_str(&cause.to_string());
            report.push(')');
            current = cause.source();
        }
        report
    }
}

fn status_code_kind(code: u16) -> ErrorKind {
    match code {
        400 => ErrorKind::Argument,
        401 => ErrorKind::Unauthorized,
        403 => ErrorKind::QuotaExceeded,
        404 => ErrorKind::NotFound,
        408 => ErrorKind::Timeout,
        409 => ErrorKind::AlreadyExists,
        412 => ErrorKind::InvalidEtag,
        413 => ErrorKind::MessageTooLarge,
        429 => ErrorKind::Throttling,
        500 => ErrorKind::InternalService,
        502 => ErrorKind::BadResponse,
        503 => ErrorKind::ServiceUnavailable,
        504 => ErrorKind::Timeout,
        _ => ErrorKind::FailedStatusCode,
    }
}
