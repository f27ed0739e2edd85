//! Error types for NTB hardware operations.

use thiserror::Error;

/// Result type alias for NTB operations.
pub type Result<T> = std::result::Result<T, NtbError>;

/// Errors that can occur while driving an NTB device.
///
/// Setup-time failures are terminal: attach rolls back everything it
/// acquired and reports the device unusable. Link-level problems are never
/// surfaced here — they stay inside the recovery state machine and reach
/// the transport only as link up/down events.
#[derive(Debug, Error)]
pub enum NtbError {
    /// A BAR or interrupt resource could not be allocated.
    #[error("resource unavailable: {reason}")]
    ResourceUnavailable {
        /// What the platform refused to provide.
        reason: String,
    },

    /// The platform rejected a resource reconfiguration (BAR resize or
    /// write-combining attribute change).
    #[error("resource configuration rejected: {reason}")]
    ResourceConfiguration {
        /// What was rejected.
        reason: String,
    },

    /// Unrecognized device identifier or unsupported topology.
    #[error("unsupported configuration: {reason}")]
    UnsupportedConfiguration {
        /// Why the device cannot be driven.
        reason: String,
    },

    /// Out-of-range, already-occupied, or reserved index.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// Which validation failed.
        reason: String,
    },

    /// A second event-callback or transport registration was attempted.
    #[error("already registered: {what}")]
    AlreadyRegistered {
        /// The surface that is already taken.
        what: &'static str,
    },

    /// I/O error talking to the platform.
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error.
        #[from]
        source: std::io::Error,
    },
}

impl NtbError {
    /// Create a resource-unavailable error.
    pub fn resource_unavailable(reason: impl Into<String>) -> Self {
        Self::ResourceUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a resource-configuration error.
    pub fn resource_configuration(reason: impl Into<String>) -> Self {
        Self::ResourceConfiguration {
            reason: reason.into(),
        }
    }

    /// Create an unsupported-configuration error.
    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::UnsupportedConfiguration {
            reason: reason.into(),
        }
    }

    /// Create an invalid-argument error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }
}
