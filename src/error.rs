//! Error types for connection lifecycle operations

use std::time::Duration;
use thiserror::Error;

/// Failure to establish (or borrow) the managed connection
///
/// `Clone` so that every caller waiting on the same connect attempt can be
/// handed the outcome of that single attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The underlying connect attempt failed
    #[error("Failed to connect to {address}: {details}")]
    Failed {
        /// Redacted connection address
        address: String,
        /// Driver error message
        details: String,
    },

    /// The connect attempt or the borrow did not finish in time
    #[error("Connection attempt timed out after {after:?}")]
    Timeout {
        /// The bound that expired
        after: Duration,
    },

    /// The connection was established but closed before it could be used
    #[error("Connection closed")]
    Closed,
}

/// Failure to tear down the managed connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DisconnectError {
    /// The underlying disconnect failed
    #[error("Failed to disconnect: {details}")]
    Failed {
        /// Driver error message
        details: String,
    },

    /// The disconnect did not finish in time
    #[error("Disconnect timed out after {after:?}")]
    Timeout {
        /// The bound that expired
        after: Duration,
    },
}

impl ConnectError {
    /// Whether this error came from an expired time bound
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl DisconnectError {
    /// Whether this error came from an expired time bound
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
