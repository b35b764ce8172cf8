//! Error types for the opportunistic exchange engine.
//!
//! Mirrors the kinds enumerated in the design: failures are local to a
//! session or store operation and never cascade into a process-level abort.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Category used by the scheduler to decide how a failure affects backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Transport,
    Protocol,
    Trust,
    Store,
    Crypto,
    Cancellation,
    Configuration,
}

/// Severity used for logging verbosity, not for control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorCategory {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Crypto => ErrorSeverity::Critical,
            Self::Store => ErrorSeverity::High,
            Self::Transport | Self::Protocol => ErrorSeverity::Medium,
            Self::Trust | Self::Configuration => ErrorSeverity::Low,
            Self::Cancellation => ErrorSeverity::Low,
        }
    }

    /// Whether a failure of this category should count against a peer's
    /// exponential backoff (store failures are fatal to the session but do
    /// not reflect on the remote peer, per the design's error propagation
    /// rules).
    pub fn counts_against_peer(&self) -> bool {
        !matches!(self, Self::Store | Self::Configuration | Self::Cancellation)
    }
}

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("peer rejected: insufficient trust (common_friends={common_friends}, required={required})")]
    PeerRejected { common_friends: u32, required: u32 },

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("cancelled")]
    Cancelled,

    #[error("cryptographic failure: {0}")]
    CryptoFailure(String),

    #[error("store failure: {0}")]
    StoreFailure(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::TransportUnavailable(_) | Self::Io(_) => ErrorCategory::Transport,
            Self::Timeout(_) => ErrorCategory::Transport,
            Self::PeerRejected { .. } => ErrorCategory::Trust,
            Self::ProtocolError(_) | Self::Serialization(_) | Self::InvalidData(_) => {
                ErrorCategory::Protocol
            }
            Self::Cancelled => ErrorCategory::Cancellation,
            Self::CryptoFailure(_) => ErrorCategory::Crypto,
            Self::StoreFailure(_) | Self::Sqlite(_) => ErrorCategory::Store,
            Self::Config(_) => ErrorCategory::Configuration,
        }
    }

    /// User-visible message: never leaks file paths, hashes, or internal
    /// identifiers (spec §7 / §4.8).
    pub fn user_message(&self) -> &'static str {
        match self.category() {
            ErrorCategory::Transport => "could not reach peer",
            ErrorCategory::Protocol => "exchange protocol error",
            ErrorCategory::Trust => "peer did not meet trust requirements",
            ErrorCategory::Store => "local storage error",
            ErrorCategory::Crypto => "cryptographic verification failed",
            ErrorCategory::Cancellation => "operation cancelled",
            ErrorCategory::Configuration => "invalid configuration",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_failures_do_not_count_against_peer() {
        let err = Error::StoreFailure("disk full".into());
        assert!(!err.category().counts_against_peer());
    }

    #[test]
    fn transport_failures_count_against_peer() {
        let err = Error::TransportUnavailable("ble radio off".into());
        assert!(err.category().counts_against_peer());
    }

    #[test]
    fn user_message_never_echoes_internals() {
        let err = Error::CryptoFailure("sha256 mismatch at /data/store.db".into());
        assert_eq!(err.user_message(), "cryptographic verification failed");
    }
}
