//! Error handling for the bridge and session.
//!
//! Provides a unified error type combining a protocol-level [`ErrorKind`]
//! with the details of the underlying failure. The kinds mirror the error
//! taxonomy of the wire protocol:
//!
//! * Transport: [`TransportUnavailable`], [`NotConnected`]
//! * Decoding: [`MalformedMessage`]
//! * Command execution: [`UnknownCommand`], [`HandlerFailure`],
//!   [`InvalidArgument`]
//! * Pending commands: [`Timeout`], [`Disconnected`]
//!
//! [`TransportUnavailable`]: ErrorKind::TransportUnavailable
//! [`NotConnected`]: ErrorKind::NotConnected
//! [`MalformedMessage`]: ErrorKind::MalformedMessage
//! [`UnknownCommand`]: ErrorKind::UnknownCommand
//! [`HandlerFailure`]: ErrorKind::HandlerFailure
//! [`InvalidArgument`]: ErrorKind::InvalidArgument
//! [`Timeout`]: ErrorKind::Timeout
//! [`Disconnected`]: ErrorKind::Disconnected

use std::fmt;

use thiserror::Error;

/// Main error type combining error kind and details.
#[derive(Debug)]
pub struct Error {
    /// Classification of the error.
    pub kind: ErrorKind,

    /// Details of the underlying error.
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

/// Standard result type for bridge and session operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories of the remote control protocol.
///
/// Each variant represents a distinct failure class with a stable,
/// human-readable message. On the device side most of these surface as
/// `result=false` responses rather than aborting anything; on the client
/// side they surface as rejected command futures.
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
pub enum ErrorKind {
    /// Broker unreachable or authentication rejected.
    #[error("transport unavailable")]
    TransportUnavailable,

    /// Operation attempted while the transport is not connected.
    #[error("not connected")]
    NotConnected,

    /// Envelope failed to decode or misses required fields.
    #[error("malformed message")]
    MalformedMessage,

    /// Command name not registered with the dispatcher.
    #[error("unknown command")]
    UnknownCommand,

    /// The player capability returned failure or a handler raised.
    #[error("handler failure")]
    HandlerFailure,

    /// Pending command not answered within the command timeout.
    #[error("timed out")]
    Timeout,

    /// Pending command rejected because the session closed.
    #[error("disconnected")]
    Disconnected,

    /// Parameter outside its documented domain.
    #[error("invalid argument")]
    InvalidArgument,

    /// Defect with no protocol meaning, e.g. a lost internal channel.
    #[error("internal error")]
    Internal,
}

impl Error {
    /// Creates a new error with the specified kind and details.
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            error: error.into(),
        }
    }

    /// Attempts to downcast the underlying error to a concrete type.
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }

    /// Creates an error for an unreachable or rejecting broker.
    pub fn transport_unavailable<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::TransportUnavailable, error)
    }

    /// Creates an error for operations attempted while disconnected.
    pub fn not_connected<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::NotConnected, error)
    }

    /// Creates an error for undecodable or incomplete envelopes.
    pub fn malformed_message<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::MalformedMessage, error)
    }

    /// Creates an error for unregistered command names.
    pub fn unknown_command<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::UnknownCommand, error)
    }

    /// Creates an error for failures inside a command handler or the
    /// player capability.
    pub fn handler_failure<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::HandlerFailure, error)
    }

    /// Creates an error for commands that were not answered in time.
    pub fn timeout<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Timeout, error)
    }

    /// Creates an error for commands rejected by session shutdown.
    pub fn disconnected<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Disconnected, error)
    }

    /// Creates an error for parameters outside their documented domain.
    pub fn invalid_argument<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::InvalidArgument, error)
    }

    /// Creates an error for internal defects.
    pub fn internal<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Internal, error)
    }
}

/// Returns the underlying error source, allowing chains to be examined
/// for root causes.
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

/// Formats the error as `{kind}: {details}`.
impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: ", self.kind)?;
        self.error.fmt(fmt)
    }
}

/// Converts IO errors into their logical protocol equivalents.
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::{
            AddrNotAvailable, BrokenPipe, ConnectionAborted, ConnectionRefused, ConnectionReset,
            InvalidData, InvalidInput, NotConnected, TimedOut,
        };
        match err.kind() {
            AddrNotAvailable | ConnectionRefused | NotConnected => Self::transport_unavailable(err),
            BrokenPipe | ConnectionReset | ConnectionAborted => Self::disconnected(err),
            TimedOut => Self::timeout(err),
            InvalidInput | InvalidData => Self::invalid_argument(err),
            _ => Self::internal(err),
        }
    }
}

/// Converts JSON errors to `MalformedMessage`.
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::malformed_message(err)
    }
}

/// Converts UUID parsing errors to `MalformedMessage`.
///
/// Command ids travel as dashed hex strings; anything else fails the
/// envelope, not the session.
impl From<uuid::Error> for Error {
    fn from(err: uuid::Error) -> Self {
        Self::malformed_message(err)
    }
}

/// Converts MQTT client-side request errors to `NotConnected`.
///
/// `rumqttc` raises these when the event loop is gone or its request
/// queue rejects the operation, which both mean the adapter can no
/// longer reach the broker.
impl From<rumqttc::ClientError> for Error {
    fn from(err: rumqttc::ClientError) -> Self {
        Self::not_connected(err)
    }
}

/// Converts MQTT connection errors to `TransportUnavailable`.
impl From<rumqttc::ConnectionError> for Error {
    fn from(err: rumqttc::ConnectionError) -> Self {
        Self::transport_unavailable(err.to_string())
    }
}

/// Converts timer expirations to `Timeout`.
impl From<tokio::time::error::Elapsed> for Error {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::timeout(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_details() {
        let err = Error::invalid_argument("volume 101 out of range 0..=100");
        assert_eq!(
            err.to_string(),
            "invalid argument: volume 101 out of range 0..=100"
        );
    }

    #[test]
    fn json_errors_are_malformed_messages() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(err.kind, ErrorKind::MalformedMessage);
    }

    #[test]
    fn refused_connections_are_transport_unavailable() {
        let io = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        let err: Error = io.into();
        assert_eq!(err.kind, ErrorKind::TransportUnavailable);
    }
}
