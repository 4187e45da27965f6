//! System-wide constants for the evtbus workspace.
//!
//! Single source of truth for limits, defaults and on-disk naming.
//! Imported by all crates; do not duplicate these values elsewhere.

/// Size of one addressable ring-buffer word in bytes.
pub const WORD_SIZE: usize = 4;

/// Bytes of framing in front of every payload (`length_prefix` + `type_tag`).
pub const FRAME_HEADER_BYTES: usize = 8;

/// Largest frame accepted from a byte stream (256 MiB).
pub const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// Magic number at the start of every ring-buffer segment: `"EVTRING\0"`.
pub const RING_MAGIC: u64 = u64::from_le_bytes(*b"EVTRING\0");

/// Magic number at the start of every histogram table segment: `"EVTHIST\0"`.
pub const HIST_MAGIC: u64 = u64::from_le_bytes(*b"EVTHIST\0");

/// Salt mixed into every named IPC key so unrelated programs on the host
/// using SysV IPC do not collide with us.
pub const IPC_KEY_NAMESPACE: u32 = 0x4556_0000;

/// Prefix of discovery marker files (`SHM<id>-SEM<id>-<name>`).
pub const MARKER_PREFIX: &str = "SHM";

/// Name component used in markers of unnamed resources.
pub const UNNAMED_MARKER: &str = "UNNAMED";

/// Environment variable overriding the discovery-marker directory.
pub const MARKER_DIR_ENV: &str = "EVTBUS_TMPDIR";

/// Permission bits for every segment and semaphore we create.
pub const IPC_PERMISSIONS: i32 = 0o600;

/// How many times semaphore/segment creation is retried before giving up.
pub const IPC_CREATE_RETRIES: u32 = 5;

/// Sleep between creation retries in milliseconds.
pub const IPC_CREATE_RETRY_MS: u64 = 10;

/// Default ring capacity in words (16 MiB).
pub const DEFAULT_RING_CAPACITY_WORDS: usize = 4 * 1024 * 1024;

/// Default sleep between enqueue/dequeue retries in microseconds.
pub const DEFAULT_RETRY_INTERVAL_US: u64 = 20;

/// Default maximum wait for a socket acknowledgement in milliseconds.
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 10_000;

/// Default socket read poll interval in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

/// Default number of connect attempts.
pub const DEFAULT_CONNECT_RETRIES: u32 = 10;

/// Default initial connect backoff in milliseconds.
pub const DEFAULT_CONNECT_BACKOFF_MS: u64 = 50;

/// Default backoff ceiling in milliseconds.
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 2_000;

/// Default number of histogram table slots.
pub const DEFAULT_HIST_SLOTS: usize = 256;

/// Default bytes reserved per histogram slot.
pub const DEFAULT_HIST_SLOT_BYTES: usize = 16 * 1024;

/// Default histogram merge period in milliseconds.
pub const DEFAULT_MERGE_INTERVAL_MS: u64 = 1_000;

/// Default refresh period of `inspect-ring-buffers` in milliseconds.
pub const DEFAULT_INSPECT_INTERVAL_MS: u64 = 1_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_are_consistent() {
        assert_eq!(FRAME_HEADER_BYTES, 2 * WORD_SIZE);
        assert!(MAX_FRAME_BYTES < u32::MAX as usize);
        assert!(DEFAULT_RING_CAPACITY_WORDS > 0);
        assert!(DEFAULT_CONNECT_BACKOFF_MS <= DEFAULT_MAX_BACKOFF_MS);
    }

    #[test]
    fn magics_differ() {
        assert_ne!(RING_MAGIC, HIST_MAGIC);
        assert_eq!(&RING_MAGIC.to_le_bytes()[..7], b"EVTRING");
    }
}
