use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Engine-wide error codes.
///
/// Errors are returned, never logged; a partially written container whose
/// operation returned an error should be discarded by the caller.
#[derive(Error, Debug)]
pub enum Error {
    #[error("data type mismatch")]
    InvalidDtype,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("rank {0} is outside the supported range 1..={max}", max = crate::DIMENSION_MAX)]
    ExceededDim(usize),

    /// Expression could not be parsed. `offset` is a 1-based byte offset
    /// into the source string.
    #[error("parse error at offset {offset}: {reason}")]
    Parse { offset: usize, reason: String },

    #[error("expression has not been compiled")]
    NotCompiled,

    /// Sentinel for exhausted iterators; `has_next` is the public
    /// predicate, so seeing this escape an iterator is a bug in the caller.
    #[error("iteration finished")]
    EndIter,

    #[error("codec failure: {0}")]
    Codec(String),

    #[error("I/O failure")]
    Io(#[from] std::io::Error),

    /// Unreachable-state assertion.
    #[error("internal failure: {0}")]
    Failed(&'static str),
}

impl Error {
    pub(crate) fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn codec<S: Into<String>>(msg: S) -> Self {
        Self::Codec(msg.into())
    }
}
