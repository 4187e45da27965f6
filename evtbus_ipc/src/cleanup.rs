//! Reclamation of IPC resources left behind by crashed processes

use crate::discovery::{Marker, MarkerDir};
use crate::error::{IpcError, IpcResult};
use crate::platform::{shm_remove, shm_stat};
use crate::semaphore::{remove_semaphore, semaphore_exists};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Which markers a reclaim pass considers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReclaimMode {
    /// Every marker
    All,
    /// Only named resources
    Named,
    /// Only unnamed resources
    #[default]
    Unnamed,
}

impl ReclaimMode {
    /// Whether `marker` falls under this mode
    pub fn matches(self, marker: &Marker) -> bool {
        match self {
            ReclaimMode::All => true,
            ReclaimMode::Named => marker.is_named(),
            ReclaimMode::Unnamed => !marker.is_named(),
        }
    }
}

impl FromStr for ReclaimMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(ReclaimMode::All),
            "named" => Ok(ReclaimMode::Named),
            "unnamed" => Ok(ReclaimMode::Unnamed),
            other => Err(format!("unknown mode '{other}', expected all, named or unnamed")),
        }
    }
}

impl fmt::Display for ReclaimMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReclaimMode::All => "all",
            ReclaimMode::Named => "named",
            ReclaimMode::Unnamed => "unnamed",
        })
    }
}

/// Segment left alone because processes are still attached
#[derive(Debug, Clone, Serialize)]
pub struct BusySegment {
    /// Marker file name
    pub marker: String,
    /// `shm_nattch` at the time of the check
    pub attach_count: u64,
}

/// Outcome of [`reclaim_orphans`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReclaimReport {
    /// Markers whose segment and semaphore were removed
    pub reclaimed: Vec<String>,
    /// Markers whose resources were already gone
    pub stale: Vec<String>,
    /// Segments still in use
    pub busy: Vec<BusySegment>,
    /// Markers that could not be processed, with the reason
    pub failed: Vec<(String, String)>,
}

impl ReclaimReport {
    /// Markers examined
    pub fn examined(&self) -> usize {
        self.reclaimed.len() + self.stale.len() + self.busy.len() + self.failed.len()
    }
}

impl fmt::Display for ReclaimReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reclaimed {}, stale markers removed {}, in use {}, failed {}",
            self.reclaimed.len(),
            self.stale.len(),
            self.busy.len(),
            self.failed.len()
        )
    }
}

enum Outcome {
    Reclaimed,
    Stale,
    Busy(u64),
}

fn ignore_missing(result: IpcResult<()>) -> IpcResult<()> {
    match result {
        Err(IpcError::NotFound { .. }) => Ok(()),
        other => other,
    }
}

fn reclaim_one(marker: &Marker) -> IpcResult<Outcome> {
    let stat = match shm_stat(marker.shm_id) {
        Ok(stat) => stat,
        Err(IpcError::NotFound { .. }) => {
            if semaphore_exists(marker.sem_id) {
                ignore_missing(remove_semaphore(marker.sem_id))?;
            }
            marker.remove()?;
            return Ok(Outcome::Stale);
        }
        Err(e) => return Err(e),
    };

    // A recycled id belongs to someone else; only the marker is ours.
    if let Some(info) = marker.info() {
        if info.created_pid != stat.creator_pid {
            debug!(%marker, creator = stat.creator_pid, "segment id reused, dropping marker only");
            marker.remove()?;
            return Ok(Outcome::Stale);
        }
    }

    if stat.attach_count > 0 {
        return Ok(Outcome::Busy(stat.attach_count));
    }

    ignore_missing(shm_remove(marker.shm_id))?;
    ignore_missing(remove_semaphore(marker.sem_id))?;
    marker.remove()?;
    Ok(Outcome::Reclaimed)
}

/// Remove segments and semaphores whose markers match `mode` and that no
/// process is attached to. Fails only if the marker directory cannot be
/// scanned; problems with individual markers are collected in the report.
pub fn reclaim_orphans(dir: &MarkerDir, mode: ReclaimMode) -> IpcResult<ReclaimReport> {
    let mut report = ReclaimReport::default();
    for marker in dir.scan()?.into_iter().filter(|m| mode.matches(m)) {
        let label = marker.to_string();
        match reclaim_one(&marker) {
            Ok(Outcome::Reclaimed) => {
                info!(marker = %label, "reclaimed IPC resources");
                report.reclaimed.push(label);
            }
            Ok(Outcome::Stale) => {
                debug!(marker = %label, "removed stale marker");
                report.stale.push(label);
            }
            Ok(Outcome::Busy(attach_count)) => {
                warn!(marker = %label, attach_count, "segment still attached, skipping");
                report.busy.push(BusySegment {
                    marker: label,
                    attach_count,
                });
            }
            Err(e) => {
                warn!(marker = %label, error = %e, "could not reclaim");
                report.failed.push((label, e.to_string()));
            }
        }
    }
    info!(dir = %dir.path().display(), %mode, %report, "reclaim pass complete");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("ALL".parse::<ReclaimMode>().unwrap(), ReclaimMode::All);
        assert_eq!("named".parse::<ReclaimMode>().unwrap(), ReclaimMode::Named);
        assert_eq!(ReclaimMode::default(), ReclaimMode::Unnamed);
        assert!("some".parse::<ReclaimMode>().is_err());
        assert_eq!(ReclaimMode::Named.to_string(), "named");
    }

    #[test]
    fn test_mode_matching() {
        let named = Marker::parse(std::path::Path::new("/tmp/SHM1-SEM2-jobs")).unwrap();
        let unnamed = Marker::parse(std::path::Path::new("/tmp/SHM3-SEM4-UNNAMED")).unwrap();
        assert!(ReclaimMode::Named.matches(&named));
        assert!(!ReclaimMode::Named.matches(&unnamed));
        assert!(ReclaimMode::Unnamed.matches(&unnamed));
        assert!(ReclaimMode::All.matches(&named) && ReclaimMode::All.matches(&unnamed));
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let gone = MarkerDir::new(dir.path().join("absent"));
        assert!(reclaim_orphans(&gone, ReclaimMode::All).is_err());
    }

    #[test]
    fn test_stale_marker_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        // Ids that do not name live resources.
        let path = dir.path().join(Marker::file_name(i32::MAX - 7, i32::MAX - 7, None));
        std::fs::write(&path, b"").unwrap();

        let report = reclaim_orphans(&MarkerDir::new(dir.path()), ReclaimMode::Unnamed).unwrap();
        assert_eq!(report.stale.len(), 1);
        assert_eq!(report.examined(), 1);
        assert!(!path.exists());
    }
}
