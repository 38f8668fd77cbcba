use std::io;

use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the transport outside the I/O hot path.
///
/// CM establishment failures are carried as raw OS error codes in the
/// queue's `cm_error` slot and converted to [`Error::Io`] when they reach
/// the caller that initiated the connect.
#[derive(Debug, Error)]
pub enum Error {
    /// An operating-system or verbs-layer error.
    #[error("I/O error")]
    Io(#[from] io::Error),

    /// The controller advertised capabilities this transport cannot use.
    #[error("controller is not compatible: {0}")]
    Incompatible(&'static str),

    /// The requested lifecycle transition lost a race with another owner,
    /// or the matching worker is already scheduled.
    #[error("controller busy")]
    Busy,

    /// The transport configuration file could not be parsed.
    #[error("bad transport config")]
    Config(#[from] toml::de::Error),
}

/// Outcome of a submission attempt on the hot path.
///
/// `Busy` asks the block layer to back off and requeue; anything else is a
/// setup failure that is surfaced as-is.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// Transient resource shortage; the request should be requeued.
    #[error("queue busy, requeue")]
    Busy,

    /// Command setup failed before the request ever reached the wire.
    #[error(transparent)]
    Other(#[from] Error),
}
