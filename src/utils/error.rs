//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

use serde::{Deserialize, Serialize};

/// Category of an RPC engine error. Every request outcome that is not a
/// success carries exactly one of these through its completion callback.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum ErrorKind {
    /// Uncategorized failure (I/O, parsing, channel, etc.).
    Generic,

    /// Opcode is not registered with the engine.
    UnknownOpcode,

    /// Endpoint of a request was already set.
    AlreadyBound,

    /// Request has no target endpoint.
    NoEndpoint,

    /// Malformed argument or request used in the wrong state.
    InvalidArgument,

    /// Chained URI lookup failed in transport.
    LookupFailed,

    /// Peer does not know the queried rank (or the group).
    UnknownRank,

    /// Transport-level send failure.
    Transport,

    /// Address resolution for a known URI failed.
    Unreachable,

    /// Message was delivered to the wrong rank/tag.
    BadTarget,

    /// Deadline exceeded.
    Timeout,

    /// Explicitly aborted.
    Canceled,

    /// Operation on a request that already reached a terminal state.
    AlreadyFinished,

    /// Server handler dropped a request without replying.
    NoReply,

    /// Tree root has no parent.
    NoParent,

    /// Message timestamp is too far ahead of the local clock.
    HlcSkew,

    /// Collective header carries a stale group version.
    GroupVersion,
}

/// Customized error type for the RPC engine.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct CartwrightError {
    kind: ErrorKind,
    msg: String,
}

impl CartwrightError {
    /// Creates a generic error carrying the given message.
    pub fn msg(msg: impl ToString) -> Self {
        CartwrightError {
            kind: ErrorKind::Generic,
            msg: msg.to_string(),
        }
    }

    /// Creates an error of the given kind.
    pub fn new(kind: ErrorKind, msg: impl ToString) -> Self {
        CartwrightError {
            kind,
            msg: msg.to_string(),
        }
    }

    /// Returns the kind of this error.
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error is of the given kind.
    #[inline]
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

impl fmt::Display for CartwrightError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.kind == ErrorKind::Generic {
            write!(f, "{}", self.msg) // do not display literal quotes
        } else {
            write!(f, "{:?}: {}", self.kind, self.msg)
        }
    }
}

impl error::Error for CartwrightError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `CartwrightError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for CartwrightError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                CartwrightError::msg(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `CartwrightError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for CartwrightError {
            fn from(e: $error) -> CartwrightError {
                CartwrightError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::mpsc::error::TryRecvError);

impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = CartwrightError::msg("what the heck?");
        assert_eq!(format!("{}", e), String::from("what the heck?"));
        let e = CartwrightError::new(ErrorKind::Timeout, "rpc 7");
        assert_eq!(format!("{}", e), String::from("Timeout: rpc 7"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = CartwrightError::from(io_error);
        assert!(e.msg.contains("oh no!"));
        assert_eq!(e.kind(), ErrorKind::Generic);
    }

    #[test]
    fn kind_survives_encoding() -> Result<(), CartwrightError> {
        let e = CartwrightError::new(ErrorKind::NoReply, "dropped");
        let bytes = rmp_serde::encode::to_vec(&e)?;
        let d: CartwrightError = rmp_serde::decode::from_slice(&bytes)?;
        assert!(d.is(ErrorKind::NoReply));
        Ok(())
    }
}
