//! Discovery markers and read-only buffer inspection
//!
//! Every segment/semaphore pair leaves a marker file named
//! `SHM<shmId>-SEM<semId>-<name|UNNAMED>` in the marker directory. The file
//! body is a small JSON record; the name alone is enough for cleanup.

use crate::error::{IpcError, IpcResult};
use crate::platform::{get_current_pid, is_process_alive};
use crate::ring_buffer::{AttachMode, BufferId, RingBuffer, RingStatus};
use evtbus::config::resolve_marker_dir;
use evtbus::consts::{MARKER_PREFIX, UNNAMED_MARKER};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

/// What a marker's segment holds
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Ring buffer segment
    Ring,
    /// Histogram table segment
    Histogram,
}

/// Marker file body
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MarkerInfo {
    /// Segment kind
    pub kind: ResourceKind,
    /// Creator process ID
    pub created_pid: u32,
    /// Creation timestamp
    pub created_at: SystemTime,
}

/// A parsed marker file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    /// Shared-memory segment id
    pub shm_id: i32,
    /// Semaphore id
    pub sem_id: i32,
    /// Resource name, `None` for unnamed resources
    pub name: Option<String>,
    /// Marker file location
    pub path: PathBuf,
}

impl Marker {
    /// File name for a segment/semaphore pair
    pub fn file_name(shm_id: i32, sem_id: i32, name: Option<&str>) -> String {
        format!(
            "{MARKER_PREFIX}{shm_id}-SEM{sem_id}-{}",
            name.unwrap_or(UNNAMED_MARKER)
        )
    }

    /// Parse a marker path. Returns `None` for files that are not markers.
    pub fn parse(path: &Path) -> Option<Self> {
        let file_name = path.file_name()?.to_str()?;
        let rest = file_name.strip_prefix(MARKER_PREFIX)?;
        let mut parts = rest.splitn(3, '-');
        let shm_id = parts.next()?.parse().ok()?;
        let sem_id = parts.next()?.strip_prefix("SEM")?.parse().ok()?;
        let name = match parts.next()? {
            "" => return None,
            UNNAMED_MARKER => None,
            other => Some(other.to_string()),
        };
        Some(Self {
            shm_id,
            sem_id,
            name,
            path: path.to_path_buf(),
        })
    }

    /// Write a marker for a freshly created resource pair.
    pub fn create(
        dir: &Path,
        shm_id: i32,
        sem_id: i32,
        name: Option<&str>,
        kind: ResourceKind,
    ) -> IpcResult<Self> {
        if let Some(name) = name {
            validate_name(name)?;
        }
        std::fs::create_dir_all(dir)?;
        let path = dir.join(Self::file_name(shm_id, sem_id, name));
        let info = MarkerInfo {
            kind,
            created_pid: get_current_pid(),
            created_at: SystemTime::now(),
        };
        std::fs::write(&path, serde_json::to_vec_pretty(&info)?)?;
        debug!(marker = %path.display(), "wrote discovery marker");
        Ok(Self {
            shm_id,
            sem_id,
            name: name.map(str::to_string),
            path,
        })
    }

    /// Whether the marker belongs to a named resource
    pub fn is_named(&self) -> bool {
        self.name.is_some()
    }

    /// Read the marker body. Markers written by older or foreign tools may
    /// have none.
    pub fn info(&self) -> Option<MarkerInfo> {
        let content = std::fs::read(&self.path).ok()?;
        serde_json::from_slice(&content).ok()
    }

    /// Delete the marker file. A marker that is already gone is not an error.
    pub fn remove(&self) -> IpcResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&Self::file_name(self.shm_id, self.sem_id, self.name.as_deref()))
    }
}

/// Reject names that cannot be embedded in a marker file name.
pub fn validate_name(name: &str) -> IpcResult<()> {
    if name.is_empty() || name == UNNAMED_MARKER || name.contains(['/', '\0']) {
        return Err(IpcError::invalid(format!(
            "'{name}' cannot be used as an IPC resource name"
        )));
    }
    Ok(())
}

/// Directory holding discovery markers
#[derive(Debug, Clone)]
pub struct MarkerDir {
    path: PathBuf,
}

impl MarkerDir {
    /// Use an explicit directory
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Resolve from an optional override, the environment, or the system
    /// temporary directory.
    pub fn resolve(explicit: Option<&Path>) -> Self {
        Self::new(resolve_marker_dir(explicit))
    }

    /// Directory path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All markers in the directory, ordered by segment id. Fails if the
    /// directory cannot be read.
    pub fn scan(&self) -> IpcResult<Vec<Marker>> {
        let mut markers: Vec<Marker> = std::fs::read_dir(&self.path)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| Marker::parse(&entry.path()))
            .collect();
        markers.sort_by_key(|m| m.shm_id);
        Ok(markers)
    }
}

/// Status of one discovered ring buffer
#[derive(Debug, Clone, Serialize)]
pub struct BufferReport {
    /// Segment id
    pub shm_id: i32,
    /// Semaphore id
    pub sem_id: i32,
    /// Resource name, if named
    pub name: Option<String>,
    /// Filled fraction in `[0, 1]`
    pub fill_fraction: f64,
    /// Header snapshot
    pub status: RingStatus,
    /// Whether the creating process is still running
    pub creator_alive: bool,
}

impl fmt::Display for BufferReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<24} shm={:<8} sem={:<8} fill={:>6.2}% entries={:<8} producers={:<3} consumers={:<3} enq={} deq={}",
            self.name.as_deref().unwrap_or(UNNAMED_MARKER),
            self.shm_id,
            self.sem_id,
            self.fill_fraction * 100.0,
            self.status.entry_count,
            self.status.attached_producers,
            self.status.attached_consumers,
            self.status.total_enqueued,
            self.status.total_dequeued,
        )
    }
}

/// Read-only inspection of every ring buffer with a marker
#[derive(Debug, Clone)]
pub struct BufferDiscovery {
    dir: MarkerDir,
}

impl BufferDiscovery {
    /// Inspect markers in `dir`
    pub fn new(dir: MarkerDir) -> Self {
        Self { dir }
    }

    /// Marker directory in use
    pub fn marker_dir(&self) -> &MarkerDir {
        &self.dir
    }

    /// Attach read-only to each ring buffer and snapshot its header.
    /// Markers whose segment is gone are logged as stale and skipped.
    pub fn inspect_buffers(&self) -> IpcResult<Vec<BufferReport>> {
        let mut reports = Vec::new();
        for marker in self.dir.scan()? {
            let info = marker.info();
            if info.as_ref().is_some_and(|i| i.kind != ResourceKind::Ring) {
                continue;
            }
            let buffer = match RingBuffer::attach(BufferId::new(marker.shm_id), AttachMode::Monitor) {
                Ok(buffer) => buffer,
                Err(IpcError::NotFound { .. }) => {
                    warn!(marker = %marker, "stale marker: segment no longer exists");
                    continue;
                }
                Err(e) => {
                    warn!(marker = %marker, error = %e, "skipping unreadable segment");
                    continue;
                }
            };
            let status = buffer.status();
            reports.push(BufferReport {
                shm_id: marker.shm_id,
                sem_id: marker.sem_id,
                name: marker.name.clone(),
                fill_fraction: status.fill_fraction(),
                creator_alive: is_process_alive(status.created_pid),
                status,
            });
        }
        Ok(reports)
    }
}
