//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, shared by the
//! transports, codecs and instrument drivers. Using the `thiserror` crate, it
//! provides a single place to describe everything that can go wrong on the
//! way from a property refresh to the wire and back.
//!
//! ## Error Hierarchy
//!
//! - **`TransportTimeout`**: a command that needed a reply got none before its
//!   deadline.
//! - **`Transport`**: a port-level failure (not open, write refused, read
//!   error). The core never looks further into these than "failed".
//! - **`Decode`**: bytes arrived but did not form a valid reply for the codec
//!   (checksum mismatch, wrong tag, malformed hex, bad sentinel or length).
//! - **`Config`** / **`Configuration`**: parse errors from `figment` and
//!   semantic validation errors found afterwards.
//! - **`Io`** / **`Persistence`**: file access and JSON errors from the
//!   settings store.
//! - **`Instrument`**: driver-level failures that are neither of the above.
//!
//! Out-of-domain writes are not represented here. They are dropped with a
//! `debug!` log line and never reach the caller.
//!
//! None of these are raised to callers of `read()`/`write()` on an
//! instrument; the engine folds them into `InstrumentStatus::Error`.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// A reply that arrived but could not be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason} (raw reply: {raw:?})")]
pub struct DecodeError {
    /// What was wrong with the reply.
    pub reason: String,
    /// The reply exactly as received, kept for diagnostics.
    pub raw: String,
}

impl DecodeError {
    /// Build a decode error for `raw`.
    pub fn new(reason: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            raw: raw.into(),
        }
    }
}

/// Every failure the crate reports.
#[derive(Error, Debug)]
pub enum DaqError {
    /// No complete reply arrived in time.
    #[error("Transport timeout after {timeout:?}")]
    TransportTimeout {
        /// How long the exchange waited.
        timeout: Duration,
    },

    /// The port could not be opened, written or read.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// A reply arrived but did not parse.
    #[error("Decode failure: {0}")]
    Decode(#[from] DecodeError),

    /// A configuration layer could not be read.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// The merged configuration is inconsistent.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem failure while saving or loading settings.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A settings file is not valid JSON.
    #[error("Settings persistence error: {0}")]
    Persistence(#[from] serde_json::Error),

    /// An instrument refused a request before anything was sent.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// Built without the `instrument_serial` feature.
    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::Instrument("valve bank offline".to_string());
        assert_eq!(err.to_string(), "Instrument error: valve bank offline");
    }

    #[test]
    fn test_decode_error_keeps_raw_reply() {
        let err: DaqError = DecodeError::new("tag mismatch", "<gd:4>").into();
        let text = err.to_string();
        assert!(text.contains("tag mismatch"));
        assert!(text.contains("<gd:4>"));
    }

    #[test]
    fn test_timeout_display() {
        let err = DaqError::TransportTimeout {
            timeout: Duration::from_millis(200),
        };
        assert_eq!(err.to_string(), "Transport timeout after 200ms");
    }
}
