//! Error types surfaced by pooled decode sessions

use thiserror::Error;

use crate::decoder::EngineError;
use crate::source::SourceError;

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of a failed `load` or `decode` call
#[derive(Error, Debug)]
pub enum Error {
    /// The byte source could not be read. The session stays usable.
    #[error("failed to read source `{name}`: {source}")]
    SourceRead {
        name: String,
        #[source]
        source: SourceError,
    },

    /// Not enough bytes were fed to finalize a frame. Retry with a larger threshold.
    #[error("partial image, no frame data after {fed} bytes")]
    PartialData { fed: usize },

    /// The engine rejected the data
    #[error("decode failed: {0}")]
    Decode(String),

    /// A later `decode` call on the same session superseded this one
    #[error("decode cancelled")]
    Cancelled,

    /// `decode` was called before any source was loaded
    #[error("file is not loaded")]
    NotLoaded,
}

impl Error {
    /// Cancellations are superseded work, not failures to present to a user.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Whether retrying with more bytes may succeed.
    pub fn is_partial(&self) -> bool {
        matches!(self, Error::PartialData { .. })
    }
}

impl From<EngineError> for Error {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Incomplete { fed } => Error::PartialData { fed },
            other => Error::Decode(other.to_string()),
        }
    }
}
