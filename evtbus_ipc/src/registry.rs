//! Per-process record of created IPC resources
//!
//! The registry is an ordinary value owned by the process's top-level context
//! and passed by reference to whatever creates segments. Workers that only
//! attach never need one.

use crate::discovery::MarkerDir;
use crate::error::{IpcError, IpcResult};
use crate::platform::shm_remove;
use crate::semaphore::remove_semaphore;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Default)]
struct Tracked {
    segments: Vec<i32>,
    semaphores: Vec<i32>,
    markers: Vec<PathBuf>,
}

/// Resources removed by [`IpcRegistry::teardown`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TeardownReport {
    /// Segments marked for removal
    pub segments: usize,
    /// Semaphores removed
    pub semaphores: usize,
    /// Marker files deleted
    pub markers: usize,
}

/// Tracks segments, semaphores and markers created by this process
#[derive(Debug)]
pub struct IpcRegistry {
    marker_dir: MarkerDir,
    owning: bool,
    tracked: Mutex<Tracked>,
}

impl IpcRegistry {
    /// Registry that tears its resources down when dropped
    pub fn new(marker_dir: MarkerDir) -> Self {
        Self {
            marker_dir,
            owning: true,
            tracked: Mutex::new(Tracked::default()),
        }
    }

    /// Registry whose resources outlive it; teardown happens only when
    /// [`teardown`](Self::teardown) is called explicitly.
    pub fn non_owning(marker_dir: MarkerDir) -> Self {
        Self {
            marker_dir,
            owning: false,
            tracked: Mutex::new(Tracked::default()),
        }
    }

    /// Registry using the resolved default marker directory
    pub fn from_env() -> Self {
        Self::new(MarkerDir::resolve(None))
    }

    /// Directory markers are written to
    pub fn marker_dir(&self) -> &Path {
        self.marker_dir.path()
    }

    /// Whether dropping the registry tears down its resources
    pub fn is_owning(&self) -> bool {
        self.owning
    }

    /// Record a created segment
    pub fn register_segment(&self, shm_id: i32) {
        self.tracked.lock().segments.push(shm_id);
    }

    /// Record a created semaphore
    pub fn register_semaphore(&self, sem_id: i32) {
        self.tracked.lock().semaphores.push(sem_id);
    }

    /// Record a written marker file
    pub fn register_marker(&self, path: PathBuf) {
        self.tracked.lock().markers.push(path);
    }

    /// Stop tracking a resource pair that was destroyed explicitly.
    pub fn forget(&self, shm_id: i32, sem_id: i32, marker: Option<&Path>) {
        let mut tracked = self.tracked.lock();
        tracked.segments.retain(|id| *id != shm_id);
        tracked.semaphores.retain(|id| *id != sem_id);
        if let Some(marker) = marker {
            tracked.markers.retain(|p| p != marker);
        }
    }

    /// Number of segments currently tracked
    pub fn tracked_segments(&self) -> usize {
        self.tracked.lock().segments.len()
    }

    /// Remove everything this registry tracks. Resources that have already
    /// disappeared are skipped; the first other failure is returned after
    /// every removal has been attempted.
    pub fn teardown(&self) -> IpcResult<TeardownReport> {
        let tracked = std::mem::take(&mut *self.tracked.lock());
        let mut report = TeardownReport::default();
        let mut first_error = None;

        let mut note = |result: IpcResult<()>, counter: &mut usize| match result {
            Ok(()) => *counter += 1,
            Err(IpcError::NotFound { .. }) => {}
            Err(e) => {
                warn!(error = %e, "teardown step failed");
                first_error.get_or_insert(e);
            }
        };

        for id in tracked.segments {
            note(shm_remove(id), &mut report.segments);
        }
        for id in tracked.semaphores {
            note(remove_semaphore(id), &mut report.semaphores);
        }
        for path in tracked.markers {
            let removed = match std::fs::remove_file(&path) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(IpcError::NotFound {
                    name: path.display().to_string(),
                }),
                other => other.map_err(IpcError::from),
            };
            note(removed, &mut report.markers);
        }

        if report != TeardownReport::default() {
            info!(
                segments = report.segments,
                semaphores = report.semaphores,
                markers = report.markers,
                "IPC registry torn down"
            );
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

impl Drop for IpcRegistry {
    fn drop(&mut self) {
        if self.owning {
            if let Err(e) = self.teardown() {
                warn!(error = %e, "IPC registry teardown on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{ShmCreated, shm_create, shm_stat};
    use crate::semaphore::{SemKey, Semaphore, semaphore_exists};

    #[test]
    fn test_teardown_removes_tracked_resources() {
        let dir = tempfile::tempdir().unwrap();
        let registry = IpcRegistry::non_owning(MarkerDir::new(dir.path()));

        let ShmCreated::New(shm_id) = shm_create(None, 4096).unwrap() else {
            panic!("unnamed segment must be new");
        };
        let sem = Semaphore::create(SemKey::Unnamed).unwrap();
        let marker = dir.path().join("SHM1-SEM2-UNNAMED");
        std::fs::write(&marker, b"{}").unwrap();

        registry.register_segment(shm_id);
        registry.register_semaphore(sem.id());
        registry.register_marker(marker.clone());
        assert_eq!(registry.tracked_segments(), 1);

        let report = registry.teardown().unwrap();
        assert_eq!(
            report,
            TeardownReport {
                segments: 1,
                semaphores: 1,
                markers: 1
            }
        );
        assert!(shm_stat(shm_id).is_err());
        assert!(!semaphore_exists(sem.id()));
        assert!(!marker.exists());

        // second teardown has nothing left to do
        assert_eq!(registry.teardown().unwrap(), TeardownReport::default());
    }

    #[test]
    fn test_owning_registry_tears_down_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let sem = Semaphore::create(SemKey::Unnamed).unwrap();
        {
            let registry = IpcRegistry::new(MarkerDir::new(dir.path()));
            assert!(registry.is_owning());
            registry.register_semaphore(sem.id());
        }
        assert!(!semaphore_exists(sem.id()));
    }

    #[test]
    fn test_forget_skips_destroyed_resources() {
        let dir = tempfile::tempdir().unwrap();
        let registry = IpcRegistry::non_owning(MarkerDir::new(dir.path()));
        registry.register_segment(42);
        registry.register_semaphore(43);
        registry.forget(42, 43, None);
        assert_eq!(registry.tracked_segments(), 0);
        assert_eq!(registry.teardown().unwrap(), TeardownReport::default());
    }
}
