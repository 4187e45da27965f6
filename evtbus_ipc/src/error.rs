//! Error types for event transport operations

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while moving events between processes
#[derive(Error, Debug)]
pub enum IpcError {
    /// Transient: buffer full/empty or no complete frame yet. Retry.
    #[error("Operation would block - retry later")]
    WouldBlock,

    /// The single operation was rejected (e.g. message larger than the buffer)
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Why the argument was rejected
        reason: String,
    },

    /// Framing mismatch; the affected event is dropped
    #[error("Corrupt frame: {reason}")]
    CorruptFrame {
        /// What did not match
        reason: String,
    },

    /// Shared memory or semaphore could not be allocated
    #[error(
        "System resource exhausted allocating {resource}: {reason} - run `clear-ipc all` to reclaim leaked IPC resources"
    )]
    ResourceExhausted {
        /// Resource being allocated
        resource: String,
        /// OS diagnostic
        reason: String,
    },

    /// Acknowledgement not received within the configured wait
    #[error("Timed out after {waited:?} waiting for acknowledgement from {peer}")]
    Timeout {
        /// Peer address
        peer: String,
        /// How long we waited
        waited: Duration,
    },

    /// Shared state can no longer be trusted; the process must abort
    #[error("Fatal failure on {resource}: {reason} - abort and run `clear-ipc` before restarting")]
    Fatal {
        /// Offending resource
        resource: String,
        /// OS diagnostic or invariant that failed
        reason: String,
    },

    /// IPC resource does not exist
    #[error("IPC resource not found: {name}")]
    NotFound {
        /// Resource name or id
        name: String,
    },

    /// Peer disconnected or stream finished
    #[error("Channel closed: {peer}")]
    Closed {
        /// Peer description
        peer: String,
    },

    /// Record (de)serialization failed; the affected event is dropped
    #[error("Record codec error: {reason}")]
    Codec {
        /// Codec diagnostic
        reason: String,
    },

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error
    #[error("System call error: {source}")]
    Nix {
        /// Source nix error
        #[from]
        source: nix::Error,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {source}")]
    Json {
        /// Source JSON error
        #[from]
        source: serde_json::Error,
    },
}

impl IpcError {
    /// Only `WouldBlock` is transient.
    pub fn is_transient(&self) -> bool {
        matches!(self, IpcError::WouldBlock)
    }

    /// Errors that cost one event but leave the endpoint usable.
    pub fn is_per_event(&self) -> bool {
        matches!(self, IpcError::CorruptFrame { .. } | IpcError::Codec { .. })
    }

    /// Errors that must terminate the owning process (or connection).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IpcError::ResourceExhausted { .. } | IpcError::Fatal { .. } | IpcError::Timeout { .. }
        )
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        IpcError::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        IpcError::CorruptFrame {
            reason: reason.into(),
        }
    }

    pub(crate) fn fatal(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        IpcError::Fatal {
            resource: resource.into(),
            reason: reason.into(),
        }
    }
}

impl From<bincode::Error> for IpcError {
    fn from(err: bincode::Error) -> Self {
        IpcError::Codec {
            reason: err.to_string(),
        }
    }
}

/// Result type for event transport operations
pub type IpcResult<T> = Result<T, IpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_disjoint() {
        let errors = [
            IpcError::WouldBlock,
            IpcError::corrupt("len"),
            IpcError::fatal("sem 3", "EIDRM"),
            IpcError::Timeout {
                peer: "127.0.0.1:1".into(),
                waited: Duration::from_millis(5),
            },
            IpcError::invalid("too big"),
        ];
        for e in &errors {
            let classes = [e.is_transient(), e.is_per_event(), e.is_fatal()];
            assert!(classes.iter().filter(|c| **c).count() <= 1, "{e:?}");
        }
        assert!(errors[0].is_transient());
        assert!(errors[1].is_per_event());
        assert!(errors[2].is_fatal());
        assert!(errors[3].is_fatal());
    }

    #[test]
    fn fatal_diagnostics_recommend_cleanup() {
        let msg = IpcError::ResourceExhausted {
            resource: "semaphore key 0x1234".into(),
            reason: "ENOSPC".into(),
        }
        .to_string();
        assert!(msg.contains("semaphore key 0x1234"));
        assert!(msg.contains("clear-ipc"));
    }
}
