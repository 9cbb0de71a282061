use thiserror::Error;

/// Errors produced by the collection core.
///
/// Per-event failures (`Decode`, `Fingerprint`) are recovered where they
/// happen and never escape the parser. Startup failures (`Connection`,
/// `Config`) surface to whoever called `start`.
#[derive(Debug, Error)]
pub enum QanError {
    /// Opening a session or an event stream against a target failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// A raw profiler document could not be decoded into an event.
    #[error("decode error: {0}")]
    Decode(String),

    /// An event could not be turned into a fingerprint.
    #[error("fingerprint error: {0}")]
    Fingerprint(String),

    /// The writer rejected a report.
    #[error("delivery error: {0}")]
    Delivery(String),

    /// Invalid configuration, detected before anything starts.
    #[error("config error: {0}")]
    Config(String),

    /// A background task died instead of exiting cleanly.
    #[error("shutdown error: {0}")]
    Shutdown(String),

    #[error("{0} already running")]
    AlreadyRunning(&'static str),

    #[error("{0} is not running")]
    NotRunning(&'static str),

    /// The queue a component reads from was already consumed or closed.
    #[error("{0} queue closed")]
    QueueClosed(&'static str),
}

impl QanError {
    /// True for errors that only affect a single event.
    pub fn is_per_event(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::Fingerprint(_))
    }
}

impl From<bson::document::ValueAccessError> for QanError {
    fn from(err: bson::document::ValueAccessError) -> Self {
        QanError::Decode(err.to_string())
    }
}

#[cfg(feature = "mongodb")]
impl From<mongodb::error::Error> for QanError {
    fn from(err: mongodb::error::Error) -> Self {
        QanError::Connection(err.to_string())
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, QanError>;
