//! Custom error types for the acquisition core.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failures that can occur while talking to a serial instrument.
//!
//! ## Error Hierarchy
//!
//! `DaqError` is an enum that consolidates the failure classes of a session:
//!
//! - **`Connection`**: The stream could not be opened (device unavailable, permission
//!   denied, user declined). Reported to the caller; nothing is retried automatically.
//! - **`StreamLost`**: A read or write failed, or a disconnect was observed. The session
//!   is torn down and can only be recovered by a fresh `open`.
//! - **`InvalidConfiguration`**: An unknown sampling-period or range label was handed to
//!   the command encoder, or a codebook was built from inconsistent tables. Aborts only
//!   the single command; the session keeps running.
//! - **`ResponseTimeout`**: A bounded wait for a device reply ran past its deadline. The
//!   stream stays usable.
//! - **`Config`**: Wraps errors from `figment` while loading the configuration file.
//! - **`Io`** / **`Export`**: File and CSV failures while exporting history.
//!
//! Field-level parse failures never show up here: an unparsable field becomes `None`
//! inside the record and the line is kept.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors raised by the acquisition core.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Opening the stream failed.
    #[error("Failed to connect to device: {0}")]
    Connection(String),

    /// `open` was called while a session is already active.
    #[error("A session is already open")]
    AlreadyOpen,

    /// An operation needed an open stream but the manager is closed.
    #[error("Port not open")]
    NotConnected,

    /// The stream failed or the device went away mid-session.
    #[error("Lost connection to device: {0}")]
    StreamLost(String),

    /// Unknown label or malformed codebook.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A device reply did not arrive in time.
    #[error("Timed out after {timeout_ms} ms waiting for {waiting_for}")]
    ResponseTimeout {
        /// What the caller was waiting for
        waiting_for: String,
        /// Deadline that expired
        timeout_ms: u64,
    },

    /// The read side is held by the running acquisition task.
    #[error("Read side is busy (acquisition running)")]
    ReadBusy,

    /// Configuration file could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but failed validation.
    #[error("Configuration validation error: {0}")]
    Validation(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV serialization failure.
    #[error("Export error: {0}")]
    Export(#[from] csv::Error),
}

impl DaqError {
    /// Whether this error ends the current session.
    ///
    /// Only stream-level failures are terminal; everything else leaves the
    /// connection usable.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, DaqError::StreamLost(_))
    }
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_stream_loss_is_fatal() {
        assert!(DaqError::StreamLost("unplugged".into()).is_session_fatal());
        assert!(!DaqError::InvalidConfiguration("bogus".into()).is_session_fatal());
        assert!(!DaqError::ResponseTimeout {
            waiting_for: "device ID".into(),
            timeout_ms: 1000,
        }
        .is_session_fatal());
        assert!(!DaqError::NotConnected.is_session_fatal());
    }

    #[test]
    fn timeout_message_names_the_wait() {
        let err = DaqError::ResponseTimeout {
            waiting_for: "device ID".into(),
            timeout_ms: 250,
        };
        assert_eq!(
            err.to_string(),
            "Timed out after 250 ms waiting for device ID"
        );
    }

    #[test]
    fn connection_message_matches_status_text() {
        let err = DaqError::Connection("No such file or directory".into());
        assert_eq!(
            err.to_string(),
            "Failed to connect to device: No such file or directory"
        );
    }
}
