//! Error types for the `sse` crate.
//!
//! Follows the same layout as the other layers: a root `Error` struct holding an
//! `ErrorKind` plus an optional source for chaining.

use std::error::Error as StdError;
use std::fmt;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
}

/// Categories of failure surfaced by the push core.
///
/// Individual recipient failures and peer failures are normally absorbed by the
/// broadcast and aggregation paths; these kinds only reach callers where a hard
/// error is meaningful.
#[derive(Debug, PartialEq)]
pub enum ErrorKind {
    /// A single connection's transport rejected a write.
    TransportWrite,
    /// A remote peer call failed or timed out.
    PeerUnreachable,
    /// The registry (or a remote client) has been shut down.
    ClosedRegistry,
    /// The request could not be mapped onto an addressing target.
    InvalidTarget,
    /// A checkout was attempted on a retired reference counted view.
    Retired,
    /// A remote payload could not be reconstructed under the configured policy.
    TypeReconstruction,
    Serialization,
}

impl Error {
    pub fn new(error_kind: ErrorKind, message: &str) -> Self {
        Error {
            source: Some(message.to_string().into()),
            error_kind,
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.error_kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{:?}: {}", self.error_kind, source),
            None => write!(f, "{:?}", self.error_kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::PeerUnreachable,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Serialization,
        }
    }
}

pub fn transport_error(message: &str) -> Error {
    Error::new(ErrorKind::TransportWrite, message)
}

pub fn closed_error(message: &str) -> Error {
    Error::new(ErrorKind::ClosedRegistry, message)
}

pub fn invalid_target(message: &str) -> Error {
    Error::new(ErrorKind::InvalidTarget, message)
}
