//! Atomic version counter for optimistic concurrency control
//!
//! The counter lives directly in shared memory (it is `repr(transparent)` over
//! an `AtomicU64`), one per histogram slot.

use std::sync::atomic::{AtomicU64, Ordering, fence};

/// Version counter using even/odd optimistic versioning
///
/// Writers bump the version to odd before touching the protected bytes and
/// back to even afterwards. Readers copy the bytes between two loads and
/// discard the copy if the version moved or was odd.
#[derive(Debug)]
#[repr(transparent)]
pub struct VersionCounter {
    counter: AtomicU64,
}

impl VersionCounter {
    /// Create a new version counter starting at 0 (even)
    pub const fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Get current version with acquire ordering
    pub fn load(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }

    /// Begin write operation - increment to odd version
    pub fn begin_write(&self) -> u64 {
        let next = self.counter.fetch_add(1, Ordering::AcqRel) + 1;
        // Slot bytes must not be written before the odd version is visible.
        fence(Ordering::Release);
        next
    }

    /// Complete write operation - increment to even version
    pub fn end_write(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Release) + 1
    }

    /// Start an optimistic read; `None` while a write is in progress.
    pub fn read_begin(&self) -> Option<u64> {
        let version = self.load();
        Self::is_stable(version).then_some(version)
    }

    /// Whether data read since `read_begin` returned `start` is consistent.
    pub fn read_validate(&self, start: u64) -> bool {
        fence(Ordering::Acquire);
        self.counter.load(Ordering::Relaxed) == start
    }

    /// Check if version is stable (even)
    pub fn is_stable(version: u64) -> bool {
        version % 2 == 0
    }

    /// Check if version indicates write in progress (odd)
    pub fn is_writing(version: u64) -> bool {
        version % 2 == 1
    }
}

impl Default for VersionCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_counter_creation() {
        let counter = VersionCounter::new();
        assert_eq!(counter.load(), 0);
        assert!(VersionCounter::is_stable(counter.load()));
    }

    #[test]
    fn test_write_cycle() {
        let counter = VersionCounter::new();

        let v1 = counter.begin_write();
        assert_eq!(v1, 1);
        assert!(VersionCounter::is_writing(v1));

        let v2 = counter.end_write();
        assert_eq!(v2, 2);
        assert!(VersionCounter::is_stable(v2));
    }

    #[test]
    fn test_torn_read_is_detected() {
        let counter = VersionCounter::new();
        let start = counter.read_begin().unwrap();

        counter.begin_write();
        assert!(counter.read_begin().is_none());
        assert!(!counter.read_validate(start));

        counter.end_write();
        assert!(!counter.read_validate(start));
        let again = counter.read_begin().unwrap();
        assert!(counter.read_validate(again));
    }
}
