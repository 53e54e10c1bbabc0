//! Error types for the midiclock core.

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the clock, the message queue and configuration loading.
///
/// None of these are transient: they report a caller logic error and are
/// never retried internally.
#[derive(Debug, Error)]
pub enum Error {
    /// Operation not allowed in the clock's current run state, or invoked
    /// re-entrantly from the dispatch thread.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A parameter was out of range, non-finite, or inconsistent.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The queue holds no pending messages.
    #[error("Message queue is empty")]
    EmptyQueue,

    /// Configuration file error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Error {
    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }
}

/// Reject NaN, infinities and values `<= 0`.
pub(crate) fn ensure_positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(Error::invalid_argument(format!(
            "{name} must be finite and greater than zero, got {value}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_positive() {
        assert!(ensure_positive("bpm", 120.0).is_ok());
        assert!(matches!(
            ensure_positive("bpm", 0.0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(ensure_positive("bpm", -1.0).is_err());
        assert!(ensure_positive("bpm", f64::NAN).is_err());
        assert!(ensure_positive("bpm", f64::INFINITY).is_err());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(Error::EmptyQueue.to_string(), "Message queue is empty");
        assert_eq!(
            Error::invalid_state("already running").to_string(),
            "Invalid state: already running"
        );
    }
}
