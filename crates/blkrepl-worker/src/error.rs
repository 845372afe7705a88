//! Error types for the replication worker.

use thiserror::Error;

/// Result type alias for replication worker operations.
pub type ReplResult<T> = Result<T, ReplError>;

/// Errors that can occur in the replication worker.
#[derive(Debug, Error)]
pub enum ReplError {
    /// The local backing disk failed or is detached.
    #[error("local disk failure on minor {minor}")]
    DiskFailure {
        /// Device minor number.
        minor: u32,
    },

    /// Sending a packet to the peer failed.
    #[error("network send failed: {msg}")]
    NetworkSend {
        /// Error message describing the send failure.
        msg: String,
    },

    /// The connection to the peer is gone.
    #[error("peer not connected")]
    Disconnected,

    /// A transient resource (buffer, reservation slot) is unavailable right now.
    #[error("resource exhausted: {what}")]
    ResourceExhausted {
        /// Which resource ran out.
        what: &'static str,
    },

    /// The peer sent something that does not fit the protocol state.
    #[error("protocol violation: {msg}")]
    ProtocolViolation {
        /// Error message describing the violation.
        msg: String,
    },

    /// A handle refers to a request that no longer exists.
    #[error("stale request handle")]
    StaleHandle,

    /// A successful completion arrived for a request that was already
    /// force-aborted. The pages it wrote into may have been reused.
    #[error("possible memory corruption: delayed successful completion of aborted request on minor {minor}, sector {sector}")]
    CorruptionHazard {
        /// Device minor number.
        minor: u32,
        /// Start sector of the aborted request.
        sector: u64,
    },

    /// A resync-after dependency would close a cycle.
    #[error("resync-after dependency of minor {minor} on {after} would create a cycle")]
    ResyncAfterCycle {
        /// The device the dependency was configured on.
        minor: u32,
        /// The requested predecessor.
        after: u32,
    },

    /// A resync-after dependency names an invalid minor.
    #[error("invalid resync-after minor {after}")]
    ResyncAfterInvalid {
        /// The requested predecessor.
        after: u32,
    },

    /// No device with that volume number exists on the connection.
    #[error("unknown volume {vnr}")]
    UnknownDevice {
        /// Volume number within the connection.
        vnr: u32,
    },

    /// A digest algorithm name is not supported.
    #[error("unknown digest algorithm {name}")]
    UnknownDigest {
        /// The configured name.
        name: String,
    },

    /// A notification handler vetoed a state change.
    #[error("{event} handler returned {code}")]
    HelperRefused {
        /// Event name.
        event: &'static str,
        /// Exit status.
        code: i32,
    },

    /// A requested state transition is not allowed from the current state.
    #[error("minor {minor}: state change refused: {reason}")]
    StateRefused {
        /// Device minor number.
        minor: u32,
        /// Why the transition was refused.
        reason: &'static str,
    },

    /// Configuration could not be parsed.
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    /// Serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// The worker was shut down.
    #[error("replication worker shut down")]
    Shutdown,
}

impl ReplError {
    /// True for errors after which the device must not be used again
    /// until an operator intervenes.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReplError::CorruptionHazard { .. })
    }

    /// True for transient conditions that are retried on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, ReplError::ResourceExhausted { .. })
    }
}
