//! Binary SysV semaphore used to guard short critical sections in shared memory.
//!
//! A semaphore is created once by whichever process calls [`Semaphore::create`]
//! first; later callers with the same key attach to it. All lock/unlock
//! operations use `SEM_UNDO`, so the kernel releases the lock if the holder
//! dies inside the critical section.
//!
//! `semget` leaves a new semaphore at 0, so there is a window in which a
//! second process could attach to a semaphore that looks locked. The creator
//! therefore releases it with a plain `semop` (which sets `sem_otime`), and
//! attachers wait for `sem_otime` to become nonzero before using it.

use crate::error::{IpcError, IpcResult};
use crate::platform::{KeyKind, ipc_key};
use evtbus::consts::{IPC_CREATE_RETRIES, IPC_CREATE_RETRY_MS, IPC_PERMISSIONS};
use nix::errno::Errno;
use std::time::Duration;
use tracing::{debug, error, warn};

/// How a semaphore is identified on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemKey<'a> {
    /// Discoverable by name from any process
    Named(&'a str),
    /// Private; only reachable through its id (shared with forked children or via markers)
    Unnamed,
}

/// Handle to a binary semaphore (value 1 = unlocked, 0 = locked)
#[derive(Debug)]
pub struct Semaphore {
    id: i32,
}

impl Semaphore {
    /// Create the semaphore for `key`, or attach if it already exists.
    /// A freshly created semaphore starts unlocked.
    pub fn create(key: SemKey<'_>) -> IpcResult<Self> {
        let raw = match key {
            SemKey::Named(name) => Some(ipc_key(KeyKind::Semaphore, name)),
            SemKey::Unnamed => None,
        };
        Self::create_with_key(raw).map(|(sem, _)| sem)
    }

    /// Create or attach by raw IPC key. Returns whether this call created it.
    pub(crate) fn create_with_key(key: Option<libc::key_t>) -> IpcResult<(Self, bool)> {
        let raw_key = key.unwrap_or(libc::IPC_PRIVATE);
        let mut last_errno = Errno::UnknownErrno;

        for attempt in 0..IPC_CREATE_RETRIES {
            // SAFETY: semget has no memory-safety preconditions.
            let id = unsafe {
                libc::semget(raw_key, 1, libc::IPC_CREAT | libc::IPC_EXCL | IPC_PERMISSIONS)
            };
            if id >= 0 {
                let sem = Self { id };
                sem.initialize()?;
                debug!(sem_id = id, key = raw_key, "created semaphore");
                return Ok((sem, true));
            }

            match Errno::last() {
                Errno::EEXIST if key.is_some() => {
                    // SAFETY: as above.
                    let id = unsafe { libc::semget(raw_key, 1, IPC_PERMISSIONS) };
                    if id >= 0 {
                        let sem = Self { id };
                        sem.wait_initialized()?;
                        debug!(sem_id = id, key = raw_key, "attached to existing semaphore");
                        return Ok((sem, false));
                    }
                    // Removed between the two calls; go around again.
                    last_errno = Errno::last();
                }
                errno @ (Errno::ENOSPC | Errno::ENOMEM | Errno::EAGAIN | Errno::EINTR | Errno::EIDRM) => {
                    last_errno = errno;
                }
                errno => return Err(errno.into()),
            }

            warn!(
                key = raw_key,
                attempt,
                errno = %last_errno,
                "semaphore creation failed, retrying"
            );
            std::thread::sleep(Duration::from_millis(IPC_CREATE_RETRY_MS));
        }

        error!(key = raw_key, errno = %last_errno, "semaphore creation retries exhausted");
        Err(IpcError::ResourceExhausted {
            resource: format!("semaphore (key {raw_key:#x})"),
            reason: last_errno.desc().to_string(),
        })
    }

    /// Wrap an existing semaphore id, verifying it still exists.
    pub fn attach(id: i32) -> IpcResult<Self> {
        let sem = Self { id };
        sem.value()?;
        Ok(sem)
    }

    /// OS semaphore id
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Blocking decrement. Interrupted waits are restarted; every other
    /// failure means the shared state can no longer be trusted.
    pub fn lock(&self) -> IpcResult<()> {
        loop {
            match self.semop(-1) {
                Ok(()) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    error!(sem_id = self.id, errno = %errno, "semaphore lock failed");
                    return Err(IpcError::fatal(
                        format!("semaphore {}", self.id),
                        format!("lock failed: {}", errno.desc()),
                    ));
                }
            }
        }
    }

    /// Increment; never blocks.
    pub fn unlock(&self) -> IpcResult<()> {
        loop {
            match self.semop(1) {
                Ok(()) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    error!(sem_id = self.id, errno = %errno, "semaphore unlock failed");
                    return Err(IpcError::fatal(
                        format!("semaphore {}", self.id),
                        format!("unlock failed: {}", errno.desc()),
                    ));
                }
            }
        }
    }

    /// Lock and return a guard that unlocks when dropped.
    pub fn guard(&self) -> IpcResult<SemaphoreGuard<'_>> {
        self.lock()?;
        Ok(SemaphoreGuard { sem: self })
    }

    /// Non-blocking introspection for monitoring.
    pub fn is_locked(&self) -> IpcResult<bool> {
        Ok(self.value()? == 0)
    }

    /// Current semaphore value.
    pub fn value(&self) -> IpcResult<i32> {
        // SAFETY: GETVAL takes no fourth argument.
        let value = unsafe { libc::semctl(self.id, 0, libc::GETVAL) };
        if value < 0 {
            return Err(not_found_or(self.id, Errno::last()));
        }
        Ok(value)
    }

    /// Remove the OS semaphore. Only safe once no process references it.
    pub fn destroy(self) -> IpcResult<()> {
        remove_semaphore(self.id)
    }

    /// Move a fresh semaphore from 0 to 1. No `SEM_UNDO`: the release must
    /// outlive the creating process.
    fn initialize(&self) -> IpcResult<()> {
        loop {
            match self.semop_with(1, 0) {
                Ok(()) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(not_found_or(self.id, errno)),
            }
        }
    }

    /// Time of the last `semop`, 0 if none has happened yet.
    fn last_op_time(&self) -> IpcResult<libc::time_t> {
        // SAFETY: semid_ds is plain data; IPC_STAT fills it in.
        let mut ds: libc::semid_ds = unsafe { std::mem::zeroed() };
        // SAFETY: for IPC_STAT the fourth argument is the `buf` member of
        // `union semun`, a pointer to a semid_ds.
        let rc = unsafe { libc::semctl(self.id, 0, libc::IPC_STAT, &mut ds as *mut libc::semid_ds) };
        if rc < 0 {
            return Err(not_found_or(self.id, Errno::last()));
        }
        Ok(ds.sem_otime)
    }

    /// Wait for the creator of an existing semaphore to finish initializing it.
    fn wait_initialized(&self) -> IpcResult<()> {
        for _ in 0..IPC_CREATE_RETRIES {
            if self.last_op_time()? != 0 {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(IPC_CREATE_RETRY_MS));
        }
        error!(sem_id = self.id, "semaphore never initialized by its creator");
        Err(IpcError::fatal(
            format!("semaphore {}", self.id),
            "creator did not initialize it; run clear-ipc to remove it",
        ))
    }

    fn semop(&self, delta: i16) -> Result<(), Errno> {
        self.semop_with(delta, libc::SEM_UNDO as libc::c_short)
    }

    fn semop_with(&self, delta: i16, flags: libc::c_short) -> Result<(), Errno> {
        let mut op = libc::sembuf {
            sem_num: 0,
            sem_op: delta,
            sem_flg: flags,
        };
        // SAFETY: `op` is a valid sembuf and we pass exactly one.
        let rc = unsafe { libc::semop(self.id, &mut op, 1) };
        if rc < 0 { Err(Errno::last()) } else { Ok(()) }
    }
}

/// Unlocks its semaphore on drop
#[derive(Debug)]
pub struct SemaphoreGuard<'a> {
    sem: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.sem.unlock() {
            error!(sem_id = self.sem.id, error = %e, "failed to release semaphore guard");
        }
    }
}

/// Remove a semaphore by id (cleanup tooling).
pub fn remove_semaphore(id: i32) -> IpcResult<()> {
    // SAFETY: IPC_RMID takes no fourth argument.
    let rc = unsafe { libc::semctl(id, 0, libc::IPC_RMID) };
    if rc < 0 {
        return Err(not_found_or(id, Errno::last()));
    }
    debug!(sem_id = id, "removed semaphore");
    Ok(())
}

/// Whether a semaphore with this id exists.
pub fn semaphore_exists(id: i32) -> bool {
    // SAFETY: GETVAL takes no fourth argument.
    unsafe { libc::semctl(id, 0, libc::GETVAL) >= 0 }
}

fn not_found_or(id: i32, errno: Errno) -> IpcError {
    match errno {
        Errno::EINVAL | Errno::EIDRM => IpcError::NotFound {
            name: format!("semaphore {id}"),
        },
        errno => errno.into(),
    }
}
