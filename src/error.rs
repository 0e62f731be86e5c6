//! Error types for the grafton-av library.

use std::{io, time::Duration};
use thiserror::Error;

/// The main error type for transport operations.
///
/// Construction problems (bad options, malformed frames) are reported
/// synchronously. Failures observed by the worker threads are recorded and
/// reported by the next pull or push on the affected session.
#[derive(Debug, Error)]
pub enum Error {
    /// The worker runtime could not be started.
    #[error("Failed to initialize the transport runtime: {0}")]
    InitializationFailed(String),

    /// A session was requested through the process-wide API before
    /// [`global::initialize`](crate::global::initialize) or after
    /// [`global::destroy`](crate::global::destroy).
    #[error("The transport runtime is not initialized")]
    NotInitialized,

    /// The host platform or CPU cannot run the transport.
    #[error("Platform or CPU is not supported")]
    PlatformUnsupported,

    /// A pull deadline elapsed before a frame arrived.
    ///
    /// This is not a session failure; retrying is the caller's choice.
    #[error("Timed out after {timeout:?} waiting for {operation}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// The session was torn down.
    #[error("The {0} has been closed")]
    Closed(&'static str),

    /// Network, codec or negotiation failure. The session must be recreated.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Frame data is invalid or inconsistent with its declared layout.
    #[error("Invalid frame data: {0}")]
    InvalidFrame(String),

    /// Configuration parameters are invalid.
    ///
    /// This can occur when builder validation fails or conflicting options are set.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// I/O operation failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// `true` for [`Error::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// `true` for [`Error::Closed`].
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed(_))
    }

    /// `true` for errors after which the session cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Io(_) | Error::Closed(_))
    }

    /// Copies the error so a recorded session failure can be reported
    /// to more than one caller.
    pub(crate) fn duplicate(&self) -> Error {
        match self {
            Error::InitializationFailed(s) => Error::InitializationFailed(s.clone()),
            Error::NotInitialized => Error::NotInitialized,
            Error::PlatformUnsupported => Error::PlatformUnsupported,
            Error::Timeout { operation, timeout } => Error::Timeout {
                operation: *operation,
                timeout: *timeout,
            },
            Error::Closed(what) => Error::Closed(*what),
            Error::Transport(s) => Error::Transport(s.clone()),
            Error::InvalidFrame(s) => Error::InvalidFrame(s.clone()),
            Error::InvalidConfiguration(s) => Error::InvalidConfiguration(s.clone()),
            Error::Io(e) => Error::Io(io::Error::new(e.kind(), e.to_string())),
        }
    }
}
