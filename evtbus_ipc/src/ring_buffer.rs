//! Shared-memory circular buffer of framed messages
//!
//! ```text
//! ┌────────────────────────┬───────────────────────────────────────────┐
//! │ RingBufferHeader (128) │ circular region, capacity_words * 4 bytes │
//! └────────────────────────┴───────────────────────────────────────────┘
//! ```
//!
//! Cursor fields (`read_offset`, `write_offset`, `entry_count`) and the
//! message bytes they cover are only mutated while holding the buffer's
//! semaphore. Everything else is an atomic that may be read without it.
//! `enqueue` and `dequeue` never wait for space or data: they return
//! [`IpcError::WouldBlock`] and leave retrying to the caller.

use crate::arena::Arena;
use crate::discovery::{Marker, ResourceKind, validate_name};
use crate::error::{IpcError, IpcResult};
use crate::framing::{encoded_len, peek_length};
use crate::platform::{KeyKind, ShmCreated, ShmMapping, get_current_pid, ipc_key, shm_create, shm_remove};
use crate::registry::IpcRegistry;
use crate::semaphore::{Semaphore, remove_semaphore};
use evtbus::consts::{FRAME_HEADER_BYTES, IPC_CREATE_RETRIES, IPC_CREATE_RETRY_MS, RING_MAGIC, WORD_SIZE};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use std::fmt;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Header at the start of every ring buffer segment
#[repr(C, align(64))]
pub struct RingBufferHeader {
    /// `RING_MAGIC` once initialization is complete
    pub magic: AtomicU64,
    /// Region size in words, immutable after creation
    pub capacity_words: AtomicU64,
    /// Word offset of the oldest buffered message
    pub read_offset: AtomicU64,
    /// Word offset the next message is written to
    pub write_offset: AtomicU64,
    /// Complete messages currently buffered
    pub entry_count: AtomicU64,
    /// Producer handles currently attached
    pub attached_producers: AtomicU32,
    /// Consumer handles currently attached
    pub attached_consumers: AtomicU32,
    /// Guarding semaphore id
    pub sem_id: AtomicI32,
    /// Process that created the segment
    pub created_pid: AtomicU32,
    /// Messages enqueued since creation
    pub total_enqueued: AtomicU64,
    /// Messages dequeued since creation
    pub total_dequeued: AtomicU64,
    /// Set on the first producer attach, never cleared
    pub producers_ever: AtomicU32,
}

const_assert_eq!(core::mem::size_of::<RingBufferHeader>(), 128);
const_assert_eq!(core::mem::align_of::<RingBufferHeader>(), 64);

/// Bytes occupied by the header
pub const HEADER_BYTES: usize = core::mem::size_of::<RingBufferHeader>();

impl RingBufferHeader {
    fn capacity(&self) -> usize {
        self.capacity_words.load(Ordering::Acquire) as usize
    }

    /// Words between the cursors. A full buffer has equal cursors and a
    /// nonzero entry count.
    fn filled_words(&self) -> usize {
        let capacity = self.capacity();
        if capacity == 0 || self.entry_count.load(Ordering::Acquire) == 0 {
            return 0;
        }
        let read = self.read_offset.load(Ordering::Acquire) as usize;
        let write = self.write_offset.load(Ordering::Acquire) as usize;
        match (write + capacity - read) % capacity {
            0 => capacity,
            filled => filled,
        }
    }
}

/// Identifies a ring buffer segment on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferId {
    shm_id: i32,
}

impl BufferId {
    /// Wrap a SysV segment id
    pub const fn new(shm_id: i32) -> Self {
        Self { shm_id }
    }

    /// SysV segment id
    pub const fn shm_id(&self) -> i32 {
        self.shm_id
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shm:{}", self.shm_id)
    }
}

/// Role of an attached handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachMode {
    /// Counted in `attached_producers`
    Producer,
    /// Counted in `attached_consumers`
    Consumer,
    /// Read-only mapping, changes nothing
    Monitor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Owner,
    Attached(AttachMode),
}

/// Point-in-time header snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingStatus {
    /// Region size in words
    pub capacity_words: usize,
    /// Words currently holding messages
    pub filled_words: usize,
    /// Complete messages currently buffered
    pub entry_count: u64,
    /// Producer handles attached
    pub attached_producers: u32,
    /// Consumer handles attached
    pub attached_consumers: u32,
    /// Messages enqueued since creation
    pub total_enqueued: u64,
    /// Messages dequeued since creation
    pub total_dequeued: u64,
    /// Creator process id
    pub created_pid: u32,
}

impl RingStatus {
    /// Filled fraction in `[0, 1]`
    pub fn fill_fraction(&self) -> f64 {
        if self.capacity_words == 0 {
            0.0
        } else {
            self.filled_words as f64 / self.capacity_words as f64
        }
    }
}

/// Handle to a ring buffer mapped into this process
pub struct RingBuffer {
    mapping: ShmMapping,
    arena: Arena,
    sem: Option<Semaphore>,
    role: Role,
    name: Option<String>,
    marker: Option<PathBuf>,
}

impl RingBuffer {
    /// Allocate a buffer of `capacity_words` words.
    ///
    /// A named buffer that already exists is attached instead, provided its
    /// capacity matches; only the process that actually created the segment
    /// writes the marker and registers the resources with `registry`.
    pub fn create(
        name: Option<&str>,
        capacity_words: usize,
        registry: &IpcRegistry,
    ) -> IpcResult<Self> {
        if capacity_words == 0 {
            return Err(IpcError::invalid("ring buffer capacity must be at least one word"));
        }
        if let Some(name) = name {
            validate_name(name)?;
        }
        let size = capacity_words
            .checked_mul(WORD_SIZE)
            .and_then(|bytes| bytes.checked_add(HEADER_BYTES))
            .ok_or_else(|| IpcError::invalid(format!("capacity of {capacity_words} words overflows")))?;

        let key = name.map(|n| ipc_key(KeyKind::Ring, n));
        match shm_create(key, size)? {
            ShmCreated::New(shm_id) => Self::initialize(shm_id, key, name, capacity_words, registry)
                .inspect_err(|_| {
                    let _ = shm_remove(shm_id);
                }),
            ShmCreated::Existing(shm_id) => Self::join_existing(shm_id, name, capacity_words),
        }
    }

    fn initialize(
        shm_id: i32,
        key: Option<libc::key_t>,
        name: Option<&str>,
        capacity_words: usize,
        registry: &IpcRegistry,
    ) -> IpcResult<Self> {
        let mapping = ShmMapping::attach(shm_id, false)?;
        let (sem, _) = Semaphore::create_with_key(key)?;

        let marker = match Marker::create(
            registry.marker_dir(),
            shm_id,
            sem.id(),
            name,
            ResourceKind::Ring,
        ) {
            Ok(marker) => marker,
            Err(e) => {
                let _ = remove_semaphore(sem.id());
                return Err(e);
            }
        };

        // SAFETY: the segment is at least HEADER_BYTES long and page aligned.
        let header = unsafe { &*(mapping.as_ptr() as *const RingBufferHeader) };
        header.capacity_words.store(capacity_words as u64, Ordering::Relaxed);
        header.read_offset.store(0, Ordering::Relaxed);
        header.write_offset.store(0, Ordering::Relaxed);
        header.entry_count.store(0, Ordering::Relaxed);
        header.sem_id.store(sem.id(), Ordering::Relaxed);
        header.created_pid.store(get_current_pid(), Ordering::Relaxed);
        header.magic.store(RING_MAGIC, Ordering::Release);

        registry.register_segment(shm_id);
        registry.register_semaphore(sem.id());
        registry.register_marker(marker.path.clone());

        info!(
            shm_id,
            sem_id = sem.id(),
            name = name.unwrap_or("<unnamed>"),
            capacity_words,
            "created ring buffer"
        );
        Self::from_mapping(mapping, Some(sem), Role::Owner, name, Some(marker.path))
    }

    fn join_existing(shm_id: i32, name: Option<&str>, capacity_words: usize) -> IpcResult<Self> {
        let mapping = ShmMapping::attach(shm_id, false)?;
        if mapping.len() < HEADER_BYTES {
            return Err(IpcError::invalid(format!(
                "segment {shm_id} for '{}' is too small for a ring buffer",
                name.unwrap_or_default()
            )));
        }
        // SAFETY: length checked above; shmat returns page-aligned addresses.
        let header = unsafe { &*(mapping.as_ptr() as *const RingBufferHeader) };

        // The creator may still be filling in the header.
        let mut attempts = 0;
        while header.magic.load(Ordering::Acquire) != RING_MAGIC {
            attempts += 1;
            if attempts > IPC_CREATE_RETRIES {
                return Err(IpcError::invalid(format!(
                    "segment {shm_id} for '{}' is not an initialized ring buffer",
                    name.unwrap_or_default()
                )));
            }
            std::thread::sleep(Duration::from_millis(IPC_CREATE_RETRY_MS));
        }

        let existing = header.capacity();
        if existing != capacity_words {
            return Err(IpcError::invalid(format!(
                "ring buffer '{}' exists with {existing} words, {capacity_words} requested",
                name.unwrap_or_default()
            )));
        }
        let sem = Semaphore::attach(header.sem_id.load(Ordering::Acquire))?;
        debug!(shm_id, name = name.unwrap_or_default(), "attached to existing ring buffer");
        Self::from_mapping(mapping, Some(sem), Role::Owner, name, None)
    }

    /// Map an existing buffer into this process.
    pub fn attach(id: BufferId, mode: AttachMode) -> IpcResult<Self> {
        let read_only = mode == AttachMode::Monitor;
        let mapping = ShmMapping::attach(id.shm_id, read_only)?;
        if mapping.len() < HEADER_BYTES {
            return Err(IpcError::invalid(format!("segment {id} is too small for a ring buffer")));
        }
        // SAFETY: length checked above; shmat returns page-aligned addresses.
        let header = unsafe { &*(mapping.as_ptr() as *const RingBufferHeader) };
        if header.magic.load(Ordering::Acquire) != RING_MAGIC {
            return Err(IpcError::invalid(format!("segment {id} is not a ring buffer")));
        }

        let sem_id = header.sem_id.load(Ordering::Acquire);
        let sem = match (mode, Semaphore::attach(sem_id)) {
            (_, Ok(sem)) => Some(sem),
            (AttachMode::Monitor, Err(_)) => None,
            (_, Err(e)) => return Err(e),
        };

        match mode {
            AttachMode::Producer => {
                header.attached_producers.fetch_add(1, Ordering::AcqRel);
                header.producers_ever.store(1, Ordering::Release);
            }
            AttachMode::Consumer => {
                header.attached_consumers.fetch_add(1, Ordering::AcqRel);
            }
            AttachMode::Monitor => {}
        }
        debug!(%id, ?mode, "attached ring buffer");
        Self::from_mapping(mapping, sem, Role::Attached(mode), None, None)
    }

    fn from_mapping(
        mapping: ShmMapping,
        sem: Option<Semaphore>,
        role: Role,
        name: Option<&str>,
        marker: Option<PathBuf>,
    ) -> IpcResult<Self> {
        // SAFETY: callers checked the header; capacity was validated at creation.
        let header = unsafe { &*(mapping.as_ptr() as *const RingBufferHeader) };
        let capacity_words = header.capacity();
        if capacity_words.saturating_mul(WORD_SIZE).saturating_add(HEADER_BYTES) > mapping.len() {
            return Err(IpcError::fatal(
                format!("shm id {}", mapping.id()),
                format!("header claims {capacity_words} words but the segment is {} bytes", mapping.len()),
            ));
        }
        // SAFETY: the region after the header is capacity_words words long and
        // word aligned because HEADER_BYTES is a multiple of the word size.
        let arena = unsafe {
            let base = NonNull::new_unchecked(mapping.as_ptr().add(HEADER_BYTES));
            Arena::from_raw(base, capacity_words)
        };
        Ok(Self {
            mapping,
            arena,
            sem,
            role,
            name: name.map(str::to_string),
            marker,
        })
    }

    fn header(&self) -> &RingBufferHeader {
        // SAFETY: validated on construction; the mapping lives as long as self.
        unsafe { &*(self.mapping.as_ptr() as *const RingBufferHeader) }
    }

    fn writable_sem(&self) -> IpcResult<&Semaphore> {
        if self.role == Role::Attached(AttachMode::Monitor) {
            return Err(IpcError::invalid("monitor handles are read-only"));
        }
        self.sem.as_ref().ok_or_else(|| {
            IpcError::fatal(format!("ring buffer {}", self.id()), "guarding semaphore missing")
        })
    }

    /// Buffer id, shareable with other processes
    pub fn id(&self) -> BufferId {
        BufferId::new(self.mapping.id())
    }

    /// Guarding semaphore id
    pub fn sem_id(&self) -> i32 {
        self.header().sem_id.load(Ordering::Acquire)
    }

    /// Name given at creation, if this handle created or joined a named buffer
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Attach mode, `None` for the creating handle
    pub fn mode(&self) -> Option<AttachMode> {
        match self.role {
            Role::Owner => None,
            Role::Attached(mode) => Some(mode),
        }
    }

    /// Region size in words
    pub fn capacity_words(&self) -> usize {
        self.arena.capacity_words()
    }

    /// Copy one complete frame into the buffer.
    pub fn enqueue(&self, bytes: &[u8]) -> IpcResult<()> {
        let sem = self.writable_sem()?;
        if bytes.len() < FRAME_HEADER_BYTES
            || peek_length(bytes).map(encoded_len) != Some(bytes.len())
        {
            return Err(IpcError::invalid(format!(
                "{} bytes do not form a complete frame",
                bytes.len()
            )));
        }
        let words = Arena::words_for(bytes.len());
        if words > self.arena.capacity_words() {
            return Err(IpcError::invalid(format!(
                "message of {words} words exceeds buffer capacity of {} words",
                self.arena.capacity_words()
            )));
        }

        let _guard = sem.guard()?;
        let header = self.header();
        let free = self.arena.capacity_words() - header.filled_words();
        if words > free {
            return Err(IpcError::WouldBlock);
        }
        let write = header.write_offset.load(Ordering::Acquire) as usize;
        self.arena.write_at(write, bytes)?;
        header
            .write_offset
            .store(self.arena.advance(write, words) as u64, Ordering::Release);
        header.entry_count.fetch_add(1, Ordering::AcqRel);
        header.total_enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Copy the oldest frame out of the buffer.
    pub fn dequeue(&self) -> IpcResult<Vec<u8>> {
        let sem = self.writable_sem()?;
        let _guard = sem.guard()?;
        let header = self.header();
        if header.entry_count.load(Ordering::Acquire) == 0 {
            return Err(IpcError::WouldBlock);
        }

        let read = header.read_offset.load(Ordering::Acquire) as usize;
        let length_prefix = self.arena.read_word(read)?;
        let total = encoded_len(length_prefix);
        let words = Arena::words_for(total);
        let filled = header.filled_words();
        if (length_prefix as usize) < 4 || words > filled {
            error!(
                id = %self.id(),
                length_prefix,
                filled_words = filled,
                "corrupt length prefix in ring buffer"
            );
            return Err(IpcError::fatal(
                format!("ring buffer {}", self.id()),
                format!("length prefix {length_prefix} at word {read} with {filled} words filled"),
            ));
        }

        let bytes = self.arena.read_at(read, total)?;
        header
            .read_offset
            .store(self.arena.advance(read, words) as u64, Ordering::Release);
        header.entry_count.fetch_sub(1, Ordering::AcqRel);
        header.total_dequeued.fetch_add(1, Ordering::Relaxed);
        Ok(bytes)
    }

    /// Header snapshot, read without taking the semaphore.
    pub fn status(&self) -> RingStatus {
        let header = self.header();
        RingStatus {
            capacity_words: header.capacity(),
            filled_words: header.filled_words(),
            entry_count: header.entry_count.load(Ordering::Acquire),
            attached_producers: header.attached_producers.load(Ordering::Acquire),
            attached_consumers: header.attached_consumers.load(Ordering::Acquire),
            total_enqueued: header.total_enqueued.load(Ordering::Acquire),
            total_dequeued: header.total_dequeued.load(Ordering::Acquire),
            created_pid: header.created_pid.load(Ordering::Acquire),
        }
    }

    /// Filled fraction in `[0, 1]`
    pub fn fill_fraction(&self) -> f64 {
        self.status().fill_fraction()
    }

    /// Whether the guarding semaphore is currently held
    pub fn is_locked(&self) -> IpcResult<bool> {
        match &self.sem {
            Some(sem) => sem.is_locked(),
            None => Err(IpcError::NotFound {
                name: format!("semaphore {}", self.sem_id()),
            }),
        }
    }

    /// Discard every buffered message.
    pub fn clear(&self) -> IpcResult<()> {
        let sem = self.writable_sem()?;
        let _guard = sem.guard()?;
        let header = self.header();
        let dropped = header.entry_count.swap(0, Ordering::AcqRel);
        header.read_offset.store(0, Ordering::Release);
        header.write_offset.store(0, Ordering::Release);
        if dropped > 0 {
            warn!(id = %self.id(), dropped, "cleared ring buffer");
        }
        Ok(())
    }

    /// End of stream: some producer attached at one point, none is attached
    /// now and nothing remains buffered.
    pub fn is_drained(&self) -> bool {
        let header = self.header();
        header.producers_ever.load(Ordering::Acquire) != 0
            && header.attached_producers.load(Ordering::Acquire) == 0
            && header.entry_count.load(Ordering::Acquire) == 0
    }

    /// Unmap this handle. The segment persists.
    pub fn detach(self) {
        drop(self);
    }

    /// Remove the segment, its semaphore and (if this handle wrote it) the
    /// marker, and stop `registry` from tracking them. Processes still
    /// attached keep their mapping until they detach.
    pub fn destroy(self, registry: &IpcRegistry) -> IpcResult<()> {
        let shm_id = self.mapping.id();
        let sem_id = self.sem_id();
        let marker = self.marker.clone();
        drop(self);
        registry.forget(shm_id, sem_id, marker.as_deref());

        shm_remove(shm_id)?;
        match remove_semaphore(sem_id) {
            Ok(()) | Err(IpcError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        if let Some(path) = marker {
            match std::fs::remove_file(&path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        info!(shm_id, sem_id, "destroyed ring buffer");
        Ok(())
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        let header = self.header();
        match self.role {
            Role::Attached(AttachMode::Producer) => {
                header.attached_producers.fetch_sub(1, Ordering::AcqRel);
            }
            Role::Attached(AttachMode::Consumer) => {
                header.attached_consumers.fetch_sub(1, Ordering::AcqRel);
            }
            _ => {}
        }
    }
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("id", &self.id())
            .field("name", &self.name)
            .field("role", &self.role)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::MarkerDir;
    use crate::framing::{MessageType, frame};
    use crate::registry::TeardownReport;

    fn registry() -> (tempfile::TempDir, IpcRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = IpcRegistry::new(MarkerDir::new(dir.path()));
        (dir, registry)
    }

    fn msg(payload: &[u8]) -> Vec<u8> {
        frame(MessageType::Event, payload).unwrap()
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let (_dir, registry) = registry();
        assert!(matches!(
            RingBuffer::create(None, 0, &registry),
            Err(IpcError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_create_writes_marker_and_registers() {
        let (dir, registry) = registry();
        let ring = RingBuffer::create(None, 64, &registry).unwrap();
        assert_eq!(registry.tracked_segments(), 1);

        let markers = MarkerDir::new(dir.path()).scan().unwrap();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].shm_id, ring.id().shm_id());
        assert_eq!(markers[0].sem_id, ring.sem_id());
        assert!(markers[0].name.is_none());

        ring.destroy(&registry).unwrap();
        assert!(MarkerDir::new(dir.path()).scan().unwrap().is_empty());
        assert_eq!(registry.tracked_segments(), 0);
        assert_eq!(registry.teardown().unwrap(), TeardownReport::default());
    }

    #[test]
    fn test_enqueue_dequeue_fifo() {
        let (_dir, registry) = registry();
        let ring = RingBuffer::create(None, 64, &registry).unwrap();
        for i in 0..5u8 {
            ring.enqueue(&msg(&vec![i; i as usize + 1])).unwrap();
        }
        assert_eq!(ring.status().entry_count, 5);
        for i in 0..5u8 {
            assert_eq!(ring.dequeue().unwrap(), msg(&vec![i; i as usize + 1]));
        }
        assert!(matches!(ring.dequeue(), Err(IpcError::WouldBlock)));
        assert_eq!(ring.status().total_dequeued, 5);
    }

    #[test]
    fn test_full_capacity_is_usable() {
        let (_dir, registry) = registry();
        // 4 words per message (8-byte header + 8-byte payload)
        let ring = RingBuffer::create(None, 8, &registry).unwrap();
        ring.enqueue(&msg(&[1; 8])).unwrap();
        ring.enqueue(&msg(&[2; 8])).unwrap();
        let status = ring.status();
        assert_eq!(status.filled_words, 8);
        assert_eq!(ring.fill_fraction(), 1.0);
        assert!(matches!(ring.enqueue(&msg(&[])), Err(IpcError::WouldBlock)));

        assert_eq!(ring.dequeue().unwrap(), msg(&[1; 8]));
        ring.enqueue(&msg(&[3; 8])).unwrap();
        assert_eq!(ring.dequeue().unwrap(), msg(&[2; 8]));
        assert_eq!(ring.dequeue().unwrap(), msg(&[3; 8]));
    }

    #[test]
    fn test_oversized_and_malformed_messages_are_rejected() {
        let (_dir, registry) = registry();
        let ring = RingBuffer::create(None, 4, &registry).unwrap();
        assert!(matches!(
            ring.enqueue(&msg(&[0; 20])),
            Err(IpcError::InvalidArgument { .. })
        ));
        let mut truncated = msg(b"abc");
        truncated.pop();
        assert!(matches!(
            ring.enqueue(&truncated),
            Err(IpcError::InvalidArgument { .. })
        ));
        assert_eq!(ring.status().entry_count, 0);
    }

    #[test]
    fn test_attach_counts_and_drain_detection() {
        let (_dir, registry) = registry();
        let ring = RingBuffer::create(Some(&format!("drain_{}", get_current_pid())), 32, &registry)
            .unwrap();
        assert!(!ring.is_drained());

        let producer = RingBuffer::attach(ring.id(), AttachMode::Producer).unwrap();
        let consumer = RingBuffer::attach(ring.id(), AttachMode::Consumer).unwrap();
        let monitor = RingBuffer::attach(ring.id(), AttachMode::Monitor).unwrap();
        let status = monitor.status();
        assert_eq!(status.attached_producers, 1);
        assert_eq!(status.attached_consumers, 1);

        producer.enqueue(&msg(b"last")).unwrap();
        producer.detach();
        assert!(!consumer.is_drained());
        assert_eq!(consumer.dequeue().unwrap(), msg(b"last"));
        assert!(consumer.is_drained());

        assert!(matches!(
            monitor.enqueue(&msg(b"x")),
            Err(IpcError::InvalidArgument { .. })
        ));
        drop(consumer);
        assert_eq!(monitor.status().attached_consumers, 0);
    }

    #[test]
    fn test_named_create_joins_existing() {
        let (_dir, registry) = registry();
        let name = format!("join_{}", get_current_pid());
        let first = RingBuffer::create(Some(&name), 16, &registry).unwrap();
        let second = RingBuffer::create(Some(&name), 16, &registry).unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(registry.tracked_segments(), 1);

        first.enqueue(&msg(b"shared")).unwrap();
        assert_eq!(second.dequeue().unwrap(), msg(b"shared"));

        assert!(matches!(
            RingBuffer::create(Some(&name), 32, &registry),
            Err(IpcError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_clear_resets_cursors() {
        let (_dir, registry) = registry();
        let ring = RingBuffer::create(None, 16, &registry).unwrap();
        ring.enqueue(&msg(b"a")).unwrap();
        ring.enqueue(&msg(b"b")).unwrap();
        ring.clear().unwrap();
        assert_eq!(ring.status().filled_words, 0);
        assert!(matches!(ring.dequeue(), Err(IpcError::WouldBlock)));
    }

    #[test]
    fn test_corrupt_prefix_is_fatal() {
        let (_dir, registry) = registry();
        let ring = RingBuffer::create(None, 16, &registry).unwrap();
        ring.enqueue(&msg(b"abcd")).unwrap();
        // Overwrite the length prefix with a value larger than the fill level.
        ring.arena.write_at(0, &1000u32.to_le_bytes()).unwrap();
        assert!(matches!(ring.dequeue(), Err(IpcError::Fatal { .. })));
        assert!(!ring.is_locked().unwrap());
    }
}
