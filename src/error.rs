use std::io;

use thiserror::Error;

/// Errors surfaced by source construction and stream operations.
///
/// Construction-time failures propagate synchronously through `Result`.
/// Failures inside dispatched callbacks never reach this type: reader
/// errors translate to a `Disconnected` event and writer errors are
/// swallowed by policy.
#[derive(Debug, Error)]
pub enum Error {
    /// The runner backing a source or task queue is gone.
    #[error("runner is no longer available")]
    RunnerUnavailable,

    /// A syscall failed; carries a short diagnostic and the OS error.
    #[error("{what} failed: {source}")]
    OperationFailed {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    /// An invalid file descriptor was handed to a source constructor.
    #[error("invalid file descriptor")]
    IllegalArgument,

    /// An operation was attempted in a state that forbids it.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
}

impl Error {
    /// Wraps a syscall failure with a short diagnostic label.
    pub(crate) fn operation(what: &'static str, source: io::Error) -> Self {
        Self::OperationFailed { what, source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
