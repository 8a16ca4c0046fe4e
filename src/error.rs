//! Error types for the ble-central crate.

use thiserror::Error;

/// The main error type for this crate.
///
/// Every failed operation resolves with exactly one of these variants. The
/// type is `Clone` so that the same error can be attached to an event and
/// returned to the caller that issued the command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The Bluetooth adapter is absent, powered off or no longer usable.
    #[error("Bluetooth radio unavailable")]
    RadioUnavailable,

    /// The command is not valid in the peripheral's (or radio's) current state.
    #[error("Invalid state: {reason}")]
    InvalidState {
        /// Description of the conflicting state.
        reason: String,
    },

    /// A GATT or I/O operation was issued against a peripheral that is not connected.
    #[error("Peripheral not connected")]
    NotConnected,

    /// Establishing the connection failed.
    #[error("Connection failed: {reason}")]
    ConnectFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The link went down while the operation was outstanding.
    #[error("Peripheral disconnected")]
    Disconnected,

    /// The native stack did not complete the operation in time.
    #[error("Operation timed out")]
    Timeout,

    /// An opaque error reported by the platform Bluetooth stack.
    #[error("Native failure{}: {message}", code.map(|c| format!(" ({c})")).unwrap_or_default())]
    NativeFailure {
        /// Platform specific error code, when one is available.
        code: Option<i32>,
        /// The platform's error message.
        message: String,
    },

    /// No peripheral is registered under the given identifier.
    #[error("Peripheral not found: {identifier}")]
    PeripheralNotFound {
        /// The identifier that was searched for.
        identifier: String,
    },

    /// The active transport lacks the capability needed for the operation.
    #[error("Operation not supported: {operation}")]
    NotSupported {
        /// Description of the unsupported operation.
        operation: String,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for [`Error::InvalidState`].
    pub(crate) fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`Error::NativeFailure`] without an error code.
    pub(crate) fn native(message: impl Into<String>) -> Self {
        Self::NativeFailure {
            code: None,
            message: message.into(),
        }
    }

    /// Returned when the session task is gone.
    pub(crate) fn session_closed() -> Self {
        Self::Internal("central session has shut down".to_string())
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_failure_display() {
        let with_code = Error::NativeFailure {
            code: Some(3),
            message: "write not permitted".to_string(),
        };
        assert_eq!(with_code.to_string(), "Native failure (3): write not permitted");

        let without_code = Error::native("adapter busy");
        assert_eq!(without_code.to_string(), "Native failure: adapter busy");
    }

    #[test]
    fn test_invalid_state_display() {
        let err = Error::invalid_state("connect already in progress");
        assert_eq!(err.to_string(), "Invalid state: connect already in progress");
    }
}
