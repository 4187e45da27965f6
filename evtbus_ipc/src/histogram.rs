//! Cross-process histogram aggregation
//!
//! A histogram table is a SysV segment of fixed-size slots. Each slot holds
//! one serialized [`Histogram1D`] keyed by `(name, owner_pid)`; merged
//! results live in slots owned by pid 0. A slot is written only by its
//! owner, so owners never contend; the table semaphore is taken only to
//! claim or release slots and to write merged results. Readers copy slots
//! optimistically and use the per-slot [`VersionCounter`] to detect a
//! snapshot torn by a concurrent write.

use crate::discovery::{Marker, ResourceKind, validate_name};
use crate::endpoint::CancelToken;
use crate::error::{IpcError, IpcResult};
use crate::platform::{
    KeyKind, ShmCreated, ShmMapping, get_current_pid, ipc_key, is_process_alive, shm_create,
    shm_remove,
};
use crate::registry::IpcRegistry;
use crate::semaphore::{Semaphore, remove_semaphore};
use crate::version::VersionCounter;
use evtbus::config::HistogramConfig;
use evtbus::consts::{HIST_MAGIC, IPC_CREATE_RETRIES, IPC_CREATE_RETRY_MS};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Owner id of merged slots
pub const MERGED_OWNER: u32 = 0;

const TORN_READ_RETRIES: usize = 64;

/// Fixed-binning one-dimensional histogram
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Histogram1D {
    /// Histogram name, the merge key
    pub name: String,
    /// Lower edge of the first bin
    pub low: f64,
    /// Upper edge of the last bin
    pub high: f64,
    /// Bin contents
    pub bins: Vec<f64>,
    /// Weight below `low`
    pub underflow: f64,
    /// Weight at or above `high` (and NaN fills)
    pub overflow: f64,
    /// Number of fills
    pub entries: u64,
}

impl Histogram1D {
    /// Empty histogram with `nbins` equal bins over `[low, high)`
    pub fn new(name: impl Into<String>, nbins: usize, low: f64, high: f64) -> IpcResult<Self> {
        if nbins == 0 || !(low < high) {
            return Err(IpcError::invalid(format!(
                "invalid binning: {nbins} bins over [{low}, {high})"
            )));
        }
        Ok(Self {
            name: name.into(),
            low,
            high,
            bins: vec![0.0; nbins],
            underflow: 0.0,
            overflow: 0.0,
            entries: 0,
        })
    }

    /// Add one entry of weight 1
    pub fn fill(&mut self, x: f64) {
        self.fill_weighted(x, 1.0);
    }

    /// Add one entry of weight `w`
    pub fn fill_weighted(&mut self, x: f64, w: f64) {
        self.entries += 1;
        if x < self.low {
            self.underflow += w;
        } else if x >= self.high || x.is_nan() {
            self.overflow += w;
        } else {
            let width = (self.high - self.low) / self.bins.len() as f64;
            let bin = (((x - self.low) / width) as usize).min(self.bins.len() - 1);
            self.bins[bin] += w;
        }
    }

    /// Sum `other` into `self`. Binning must match.
    pub fn add(&mut self, other: &Histogram1D) -> IpcResult<()> {
        if self.bins.len() != other.bins.len() || self.low != other.low || self.high != other.high
        {
            return Err(IpcError::invalid(format!(
                "cannot add '{}' ({} bins over [{}, {})) to '{}' ({} bins over [{}, {}))",
                other.name,
                other.bins.len(),
                other.low,
                other.high,
                self.name,
                self.bins.len(),
                self.low,
                self.high
            )));
        }
        for (mine, theirs) in self.bins.iter_mut().zip(&other.bins) {
            *mine += theirs;
        }
        self.underflow += other.underflow;
        self.overflow += other.overflow;
        self.entries += other.entries;
        Ok(())
    }

    /// Sum of in-range bins
    pub fn integral(&self) -> f64 {
        self.bins.iter().sum()
    }
}

/// Header at the start of a histogram table segment
#[repr(C, align(64))]
pub struct HistogramTableHeader {
    /// `HIST_MAGIC` once initialization is complete
    pub magic: AtomicU64,
    /// Number of slots
    pub slots: AtomicU64,
    /// Payload bytes per slot
    pub slot_bytes: AtomicU64,
    /// Guarding semaphore id
    pub sem_id: AtomicI32,
    /// Creator process id
    pub created_pid: AtomicU32,
    /// Merges performed since creation
    pub merges: AtomicU64,
}

const_assert_eq!(core::mem::size_of::<HistogramTableHeader>(), 64);

#[repr(C)]
struct SlotHeader {
    version: VersionCounter,
    owner_pid: AtomicU32,
    in_use: AtomicU32,
    name_len: AtomicU32,
    data_len: AtomicU32,
    publishes: AtomicU64,
}

const_assert_eq!(core::mem::size_of::<SlotHeader>(), 32);

const TABLE_HEADER_BYTES: usize = core::mem::size_of::<HistogramTableHeader>();
const SLOT_HEADER_BYTES: usize = core::mem::size_of::<SlotHeader>();

struct SlotSnapshot {
    owner_pid: u32,
    name: String,
    data: Vec<u8>,
}

enum SlotRead {
    Empty,
    Torn,
    Entry(SlotSnapshot),
}

/// Shared table of per-process histogram snapshots
pub struct HistogramTable {
    mapping: ShmMapping,
    sem: Semaphore,
    slots: usize,
    slot_bytes: usize,
    stride: usize,
    marker: Option<PathBuf>,
    claimed: Mutex<HashMap<(u32, String), usize>>,
}

impl HistogramTable {
    /// Allocate a table of `slots` slots holding up to `slot_bytes` each.
    /// A named table that already exists is joined instead.
    pub fn create(
        name: Option<&str>,
        slots: usize,
        slot_bytes: usize,
        registry: &IpcRegistry,
    ) -> IpcResult<Self> {
        if slots == 0 || slot_bytes < 64 {
            return Err(IpcError::invalid(format!(
                "histogram table too small: {slots} slots of {slot_bytes} bytes"
            )));
        }
        if let Some(name) = name {
            validate_name(name)?;
        }
        let stride = SLOT_HEADER_BYTES + slot_bytes.next_multiple_of(8);
        let size = slots
            .checked_mul(stride)
            .and_then(|b| b.checked_add(TABLE_HEADER_BYTES))
            .ok_or_else(|| IpcError::invalid("histogram table size overflows".to_string()))?;

        let key = name.map(|n| ipc_key(KeyKind::Histogram, n));
        match shm_create(key, size)? {
            ShmCreated::New(shm_id) => {
                Self::initialize(shm_id, key, name, slots, slot_bytes, registry).inspect_err(|_| {
                    let _ = shm_remove(shm_id);
                })
            }
            ShmCreated::Existing(shm_id) => {
                let table = Self::attach(shm_id)?;
                if table.slots != slots || table.slot_bytes != slot_bytes {
                    return Err(IpcError::invalid(format!(
                        "histogram table '{}' exists with {} slots of {} bytes",
                        name.unwrap_or_default(),
                        table.slots,
                        table.slot_bytes
                    )));
                }
                Ok(table)
            }
        }
    }

    /// Table sized from the `[histogram]` configuration section
    pub fn from_config(
        name: Option<&str>,
        config: &HistogramConfig,
        registry: &IpcRegistry,
    ) -> IpcResult<Self> {
        Self::create(name, config.slots, config.slot_bytes, registry)
    }

    fn initialize(
        shm_id: i32,
        key: Option<libc::key_t>,
        name: Option<&str>,
        slots: usize,
        slot_bytes: usize,
        registry: &IpcRegistry,
    ) -> IpcResult<Self> {
        let mapping = ShmMapping::attach(shm_id, false)?;
        let (sem, _) = Semaphore::create_with_key(key)?;
        let marker = match Marker::create(
            registry.marker_dir(),
            shm_id,
            sem.id(),
            name,
            ResourceKind::Histogram,
        ) {
            Ok(marker) => marker,
            Err(e) => {
                let _ = remove_semaphore(sem.id());
                return Err(e);
            }
        };

        // SAFETY: the segment is larger than the header and page aligned.
        let header = unsafe { &*(mapping.as_ptr() as *const HistogramTableHeader) };
        header.slots.store(slots as u64, Ordering::Relaxed);
        header.slot_bytes.store(slot_bytes as u64, Ordering::Relaxed);
        header.sem_id.store(sem.id(), Ordering::Relaxed);
        header.created_pid.store(get_current_pid(), Ordering::Relaxed);
        header.magic.store(HIST_MAGIC, Ordering::Release);

        registry.register_segment(shm_id);
        registry.register_semaphore(sem.id());
        registry.register_marker(marker.path.clone());
        info!(shm_id, sem_id = sem.id(), slots, slot_bytes, "created histogram table");

        let mut table = Self::from_mapping(mapping, sem)?;
        table.marker = Some(marker.path);
        Ok(table)
    }

    /// Map an existing table by segment id.
    pub fn attach(shm_id: i32) -> IpcResult<Self> {
        let mapping = ShmMapping::attach(shm_id, false)?;
        if mapping.len() < TABLE_HEADER_BYTES {
            return Err(IpcError::invalid(format!("segment {shm_id} is not a histogram table")));
        }
        // SAFETY: length checked above.
        let header = unsafe { &*(mapping.as_ptr() as *const HistogramTableHeader) };
        let mut attempts = 0;
        while header.magic.load(Ordering::Acquire) != HIST_MAGIC {
            attempts += 1;
            if attempts > IPC_CREATE_RETRIES {
                return Err(IpcError::invalid(format!(
                    "segment {shm_id} is not a histogram table"
                )));
            }
            std::thread::sleep(Duration::from_millis(IPC_CREATE_RETRY_MS));
        }
        let sem = Semaphore::attach(header.sem_id.load(Ordering::Acquire))?;
        Self::from_mapping(mapping, sem)
    }

    fn from_mapping(mapping: ShmMapping, sem: Semaphore) -> IpcResult<Self> {
        // SAFETY: callers verified the header.
        let header = unsafe { &*(mapping.as_ptr() as *const HistogramTableHeader) };
        let slots = header.slots.load(Ordering::Acquire) as usize;
        let slot_bytes = header.slot_bytes.load(Ordering::Acquire) as usize;
        let stride = SLOT_HEADER_BYTES + slot_bytes.next_multiple_of(8);
        if slots.saturating_mul(stride).saturating_add(TABLE_HEADER_BYTES) > mapping.len() {
            return Err(IpcError::fatal(
                format!("histogram table shm id {}", mapping.id()),
                format!("{slots} slots of {slot_bytes} bytes do not fit {} bytes", mapping.len()),
            ));
        }
        Ok(Self {
            mapping,
            sem,
            slots,
            slot_bytes,
            stride,
            marker: None,
            claimed: Mutex::new(HashMap::new()),
        })
    }

    /// Segment id
    pub fn id(&self) -> i32 {
        self.mapping.id()
    }

    /// Number of slots
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Merges performed by any process since creation
    pub fn merge_count(&self) -> u64 {
        self.header().merges.load(Ordering::Acquire)
    }

    fn header(&self) -> &HistogramTableHeader {
        // SAFETY: validated on construction.
        unsafe { &*(self.mapping.as_ptr() as *const HistogramTableHeader) }
    }

    fn slot_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.slots);
        // SAFETY: index < slots and the segment holds slots * stride bytes
        // after the header.
        unsafe { self.mapping.as_ptr().add(TABLE_HEADER_BYTES + index * self.stride) }
    }

    fn slot(&self, index: usize) -> &SlotHeader {
        // SAFETY: stride is a multiple of 8, so every slot header is aligned.
        unsafe { &*(self.slot_ptr(index) as *const SlotHeader) }
    }

    fn read_slot(&self, index: usize) -> SlotRead {
        let slot = self.slot(index);
        for _ in 0..TORN_READ_RETRIES {
            let Some(start) = slot.version.read_begin() else {
                std::hint::spin_loop();
                continue;
            };
            if slot.in_use.load(Ordering::Acquire) == 0 {
                if slot.version.read_validate(start) {
                    return SlotRead::Empty;
                }
                continue;
            }
            let owner_pid = slot.owner_pid.load(Ordering::Acquire);
            let name_len = slot.name_len.load(Ordering::Acquire) as usize;
            let data_len = slot.data_len.load(Ordering::Acquire) as usize;
            if name_len + data_len > self.slot_bytes {
                // Lengths from a torn header; the version check below fails.
                continue;
            }
            let mut body = vec![0u8; name_len + data_len];
            // SAFETY: the body lies within the slot; a concurrent writer can
            // only make the copy stale, which read_validate detects.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.slot_ptr(index).add(SLOT_HEADER_BYTES),
                    body.as_mut_ptr(),
                    body.len(),
                );
            }
            if !slot.version.read_validate(start) {
                continue;
            }
            let data = body.split_off(name_len);
            let Ok(name) = String::from_utf8(body) else {
                return SlotRead::Torn;
            };
            return SlotRead::Entry(SlotSnapshot {
                owner_pid,
                name,
                data,
            });
        }
        SlotRead::Torn
    }

    /// Seqlock write of a whole slot. Caller must be the slot's only writer.
    fn write_slot(&self, index: usize, owner_pid: u32, name: &str, data: &[u8]) {
        let slot = self.slot(index);
        slot.version.begin_write();
        slot.owner_pid.store(owner_pid, Ordering::Relaxed);
        slot.name_len.store(name.len() as u32, Ordering::Relaxed);
        slot.data_len.store(data.len() as u32, Ordering::Relaxed);
        // SAFETY: name.len() + data.len() <= slot_bytes, checked by callers.
        unsafe {
            let body = self.slot_ptr(index).add(SLOT_HEADER_BYTES);
            std::ptr::copy_nonoverlapping(name.as_ptr(), body, name.len());
            std::ptr::copy_nonoverlapping(data.as_ptr(), body.add(name.len()), data.len());
        }
        slot.in_use.store(1, Ordering::Relaxed);
        slot.publishes.fetch_add(1, Ordering::Relaxed);
        slot.version.end_write();
    }

    fn clear_slot(&self, index: usize) {
        let slot = self.slot(index);
        slot.version.begin_write();
        slot.in_use.store(0, Ordering::Relaxed);
        slot.owner_pid.store(0, Ordering::Relaxed);
        slot.name_len.store(0, Ordering::Relaxed);
        slot.data_len.store(0, Ordering::Relaxed);
        slot.version.end_write();
    }

    /// Slot owned by `(name, owner_pid)`. Caller holds the semaphore.
    fn find_slot(&self, name: &str, owner_pid: u32) -> Option<usize> {
        (0..self.slots).find(|&i| match self.read_slot(i) {
            SlotRead::Entry(s) => s.owner_pid == owner_pid && s.name == name,
            _ => false,
        })
    }

    /// Write `data` to the `(name, owner_pid)` slot, claiming a free slot if
    /// needed. Caller holds the semaphore.
    fn claim_and_write(&self, name: &str, owner_pid: u32, data: &[u8]) -> IpcResult<usize> {
        let index = match self.find_slot(name, owner_pid) {
            Some(index) => index,
            None => (0..self.slots)
                .find(|&i| self.slot(i).in_use.load(Ordering::Acquire) == 0)
                .ok_or_else(|| IpcError::ResourceExhausted {
                    resource: format!("histogram table {} slot for '{name}'", self.id()),
                    reason: format!("all {} slots in use", self.slots),
                })?,
        };
        self.write_slot(index, owner_pid, name, data);
        Ok(index)
    }

    fn encode(&self, hist: &Histogram1D) -> IpcResult<Vec<u8>> {
        validate_name(&hist.name)?;
        let data = serde_json::to_vec(hist)?;
        if hist.name.len() + data.len() > self.slot_bytes {
            return Err(IpcError::invalid(format!(
                "histogram '{}' needs {} bytes, slots hold {}",
                hist.name,
                hist.name.len() + data.len(),
                self.slot_bytes
            )));
        }
        Ok(data)
    }

    /// Write this process's snapshot of `hist`, replacing any earlier one.
    pub fn publish(&self, hist: &Histogram1D) -> IpcResult<()> {
        self.publish_as(get_current_pid(), hist)
    }

    /// Write `hist` under an explicit owner id instead of the caller's pid.
    ///
    /// A worker that is restarted under the same id replaces its previous
    /// snapshot rather than adding a second one. At most one live process
    /// may publish under a given id, and 0 is reserved for merged results.
    pub fn publish_as(&self, owner_pid: u32, hist: &Histogram1D) -> IpcResult<()> {
        if owner_pid == MERGED_OWNER {
            return Err(IpcError::invalid("owner id 0 is reserved for merged histograms"));
        }
        let data = self.encode(hist)?;
        let mut claimed = self.claimed.lock();
        let key = (owner_pid, hist.name.clone());
        if let Some(&index) = claimed.get(&key) {
            let slot = self.slot(index);
            if slot.in_use.load(Ordering::Acquire) == 1
                && slot.owner_pid.load(Ordering::Acquire) == owner_pid
            {
                self.write_slot(index, owner_pid, &hist.name, &data);
                return Ok(());
            }
        }
        let _guard = self.sem.guard()?;
        let index = self.claim_and_write(&hist.name, owner_pid, &data)?;
        claimed.insert(key, index);
        debug!(name = %hist.name, owner_pid, slot = index, "claimed histogram slot");
        Ok(())
    }

    fn owner_entries(&self, name: Option<&str>) -> Vec<SlotSnapshot> {
        (0..self.slots)
            .filter_map(|i| match self.read_slot(i) {
                SlotRead::Entry(s) if s.owner_pid != MERGED_OWNER => Some(s),
                SlotRead::Torn => {
                    warn!(table = self.id(), slot = i, "skipping torn histogram slot");
                    None
                }
                _ => None,
            })
            .filter(|s| name.is_none_or(|n| s.name == n))
            .collect()
    }

    /// Sum every owner's `name` snapshot and republish the result in the
    /// merged slot. `None` if no owner has published `name`.
    pub fn merge(&self, name: &str) -> IpcResult<Option<Histogram1D>> {
        let mut entries = self.owner_entries(Some(name));
        entries.sort_by_key(|s| s.owner_pid);

        let mut merged: Option<Histogram1D> = None;
        for entry in &entries {
            let hist: Histogram1D = match serde_json::from_slice(&entry.data) {
                Ok(hist) => hist,
                Err(e) => {
                    warn!(name, owner = entry.owner_pid, error = %e, "unreadable histogram snapshot");
                    continue;
                }
            };
            match merged.as_mut() {
                None => merged = Some(hist),
                Some(acc) => {
                    if let Err(e) = acc.add(&hist) {
                        warn!(name, owner = entry.owner_pid, error = %e, "skipping incompatible snapshot");
                    }
                }
            }
        }

        let Some(merged) = merged else {
            return Ok(None);
        };
        let data = self.encode(&merged)?;
        {
            let _guard = self.sem.guard()?;
            self.claim_and_write(name, MERGED_OWNER, &data)?;
        }
        self.header().merges.fetch_add(1, Ordering::AcqRel);
        debug!(name, owners = entries.len(), entries = merged.entries, "merged histogram");
        Ok(Some(merged))
    }

    /// Merge every published name. Returns how many were merged.
    pub fn merge_all(&self) -> IpcResult<usize> {
        let mut merged = 0;
        for name in self.names() {
            if self.merge(&name)?.is_some() {
                merged += 1;
            }
        }
        Ok(merged)
    }

    /// Last merged result for `name`, without merging.
    pub fn merged(&self, name: &str) -> IpcResult<Option<Histogram1D>> {
        for i in 0..self.slots {
            if let SlotRead::Entry(s) = self.read_slot(i) {
                if s.owner_pid == MERGED_OWNER && s.name == name {
                    return Ok(Some(serde_json::from_slice(&s.data)?));
                }
            }
        }
        Ok(None)
    }

    /// Distinct names with at least one owner snapshot, sorted
    pub fn names(&self) -> Vec<String> {
        self.owner_entries(None)
            .into_iter()
            .map(|s| s.name)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Release every slot of a worker that has exited. Returns the number
    /// of slots freed. Slots of running processes other than the caller
    /// are never touched, since their owner may be writing.
    pub fn remove_owner(&self, owner_pid: u32) -> IpcResult<usize> {
        if owner_pid == MERGED_OWNER {
            return Err(IpcError::invalid("merged slots are not owned by a process"));
        }
        if owner_pid != get_current_pid() && is_process_alive(owner_pid) {
            return Err(IpcError::invalid(format!(
                "process {owner_pid} is still running and owns its slots"
            )));
        }
        let _guard = self.sem.guard()?;
        let mut removed = 0;
        for i in 0..self.slots {
            let slot = self.slot(i);
            if slot.in_use.load(Ordering::Acquire) == 1
                && slot.owner_pid.load(Ordering::Acquire) == owner_pid
            {
                self.clear_slot(i);
                removed += 1;
            }
        }
        self.claimed.lock().retain(|(pid, _), _| *pid != owner_pid);
        if removed > 0 {
            info!(table = self.id(), owner_pid, removed, "released histogram slots");
        }
        Ok(removed)
    }

    /// Remove the segment, semaphore and marker, and untrack them in `registry`.
    pub fn destroy(self, registry: &IpcRegistry) -> IpcResult<()> {
        let shm_id = self.mapping.id();
        let sem_id = self.sem.id();
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
        info!(shm_id, sem_id, "destroyed histogram table");
        Ok(())
    }
}

impl std::fmt::Debug for HistogramTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistogramTable")
            .field("id", &self.id())
            .field("slots", &self.slots)
            .field("slot_bytes", &self.slot_bytes)
            .finish()
    }
}

/// Runs [`HistogramTable::merge_all`] periodically until cancelled
#[derive(Debug)]
pub struct HistogramMerger {
    table: Arc<HistogramTable>,
    interval: Duration,
    cancel: CancelToken,
}

impl HistogramMerger {
    /// Merger over `table` every `interval`
    pub fn new(table: Arc<HistogramTable>, interval: Duration, cancel: CancelToken) -> Self {
        Self {
            table,
            interval,
            cancel,
        }
    }

    /// Merger using `merge_interval_ms` from the configuration
    pub fn from_config(table: Arc<HistogramTable>, config: &HistogramConfig, cancel: CancelToken) -> Self {
        Self::new(table, config.merge_interval(), cancel)
    }

    /// Merge on the timer until cancelled, with a final merge on the way
    /// out. Returns the number of merge passes.
    pub fn run(&self) -> IpcResult<u64> {
        let mut passes = 0u64;
        let tick = self.interval.min(Duration::from_millis(10));
        let mut next = Instant::now() + self.interval;
        while !self.cancel.is_cancelled() {
            if Instant::now() >= next {
                self.table.merge_all()?;
                passes += 1;
                next += self.interval;
            }
            std::thread::sleep(tick);
        }
        self.table.merge_all()?;
        Ok(passes + 1)
    }

    /// Run on a background thread.
    pub fn spawn(self) -> JoinHandle<IpcResult<u64>> {
        std::thread::spawn(move || self.run())
    }
}
