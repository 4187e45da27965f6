//! Linux-specific System V shared memory operations

use crate::error::{IpcError, IpcResult};
use evtbus::consts::{IPC_KEY_NAMESPACE, IPC_PERMISSIONS};
use nix::errno::Errno;
use nix::unistd::getpid;
use std::ptr::NonNull;

/// Kind of resource a named key is derived for. Segments and semaphores live
/// in separate kernel namespaces, but ring buffers and histogram tables of the
/// same name must not collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// Ring buffer segment and its semaphore
    Ring,
    /// Histogram table segment and its semaphore
    Histogram,
    /// Free-standing semaphore
    Semaphore,
}

impl KeyKind {
    fn tag(&self) -> &'static str {
        match self {
            KeyKind::Ring => "ring",
            KeyKind::Histogram => "hist",
            KeyKind::Semaphore => "sem",
        }
    }
}

/// Derive the SysV key for a named resource. Never returns `IPC_PRIVATE`.
pub fn ipc_key(kind: KeyKind, name: &str) -> libc::key_t {
    // FNV-1a over "<kind>:<name>"
    let mut hash: u32 = 0x811c_9dc5;
    for byte in kind.tag().bytes().chain(std::iter::once(b':')).chain(name.bytes()) {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    let key = (hash ^ IPC_KEY_NAMESPACE) as libc::key_t;
    if key == libc::IPC_PRIVATE { 1 } else { key }
}

/// Outcome of a segment creation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmCreated {
    /// A new zero-filled segment
    New(i32),
    /// A segment with this key already existed
    Existing(i32),
}

impl ShmCreated {
    /// Segment id regardless of outcome
    pub fn id(&self) -> i32 {
        match *self {
            ShmCreated::New(id) | ShmCreated::Existing(id) => id,
        }
    }
}

/// Create a segment of `size` bytes. `None` key creates an unnamed
/// (`IPC_PRIVATE`) segment.
pub fn shm_create(key: Option<libc::key_t>, size: usize) -> IpcResult<ShmCreated> {
    let raw_key = key.unwrap_or(libc::IPC_PRIVATE);
    let flags = libc::IPC_CREAT | libc::IPC_EXCL | IPC_PERMISSIONS;
    // SAFETY: shmget has no memory-safety preconditions.
    let id = unsafe { libc::shmget(raw_key, size, flags) };
    if id >= 0 {
        return Ok(ShmCreated::New(id));
    }

    match Errno::last() {
        Errno::EEXIST if key.is_some() => {
            // SAFETY: as above; size 0 attaches to any existing size.
            let id = unsafe { libc::shmget(raw_key, 0, IPC_PERMISSIONS) };
            if id < 0 {
                return Err(Errno::last().into());
            }
            Ok(ShmCreated::Existing(id))
        }
        errno @ (Errno::ENOSPC | Errno::ENOMEM) => Err(IpcError::ResourceExhausted {
            resource: format!("shared memory segment ({size} bytes, key {raw_key:#x})"),
            reason: errno.desc().to_string(),
        }),
        Errno::EINVAL => Err(IpcError::invalid(format!(
            "segment size {size} rejected by the kernel (check kernel.shmmax)"
        ))),
        errno => Err(errno.into()),
    }
}

/// Kernel bookkeeping for one segment
#[derive(Debug, Clone, Copy)]
pub struct ShmStat {
    /// Segment size in bytes
    pub size: usize,
    /// Number of current attachments across all processes
    pub attach_count: u64,
    /// Creator process id
    pub creator_pid: u32,
    /// Process that performed the last attach/detach
    pub last_pid: u32,
}

/// Query `IPC_STAT` for a segment.
pub fn shm_stat(id: i32) -> IpcResult<ShmStat> {
    // SAFETY: shmid_ds is plain old data; the kernel fills it in.
    let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::shmctl(id, libc::IPC_STAT, &mut ds) };
    if rc < 0 {
        return match Errno::last() {
            Errno::EINVAL | Errno::EIDRM => Err(IpcError::NotFound {
                name: format!("shm id {id}"),
            }),
            errno => Err(errno.into()),
        };
    }
    Ok(ShmStat {
        size: ds.shm_segsz as usize,
        attach_count: ds.shm_nattch as u64,
        creator_pid: ds.shm_cpid as u32,
        last_pid: ds.shm_lpid as u32,
    })
}

/// Mark a segment for removal. It disappears once the last process detaches.
pub fn shm_remove(id: i32) -> IpcResult<()> {
    // SAFETY: IPC_RMID ignores the buffer argument.
    let rc = unsafe { libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut()) };
    if rc < 0 {
        return match Errno::last() {
            Errno::EINVAL | Errno::EIDRM => Err(IpcError::NotFound {
                name: format!("shm id {id}"),
            }),
            errno => Err(errno.into()),
        };
    }
    Ok(())
}

/// A segment mapped into this process. Detached on drop.
#[derive(Debug)]
pub struct ShmMapping {
    id: i32,
    addr: NonNull<u8>,
    len: usize,
    read_only: bool,
}

// SAFETY: the mapping is process-wide; every mutable access to the region
// goes through atomics or happens under the owning semaphore.
unsafe impl Send for ShmMapping {}
unsafe impl Sync for ShmMapping {}

impl ShmMapping {
    /// Attach segment `id`, optionally read-only.
    pub fn attach(id: i32, read_only: bool) -> IpcResult<Self> {
        let stat = shm_stat(id)?;
        let flags = if read_only { libc::SHM_RDONLY } else { 0 };
        // SAFETY: a null address lets the kernel choose the placement.
        let raw = unsafe { libc::shmat(id, std::ptr::null(), flags) };
        if raw as isize == -1 {
            return match Errno::last() {
                Errno::EINVAL | Errno::EIDRM => Err(IpcError::NotFound {
                    name: format!("shm id {id}"),
                }),
                Errno::ENOMEM => Err(IpcError::ResourceExhausted {
                    resource: format!("address space for shm id {id}"),
                    reason: Errno::ENOMEM.desc().to_string(),
                }),
                errno => Err(errno.into()),
            };
        }
        let addr = NonNull::new(raw as *mut u8).ok_or_else(|| IpcError::NotFound {
            name: format!("shm id {id}"),
        })?;
        Ok(Self {
            id,
            addr,
            len: stat.size,
            read_only,
        })
    }

    /// Segment id
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Mapped length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping has zero length
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the mapping was attached read-only
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Base address of the mapping
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }
}

impl Drop for ShmMapping {
    fn drop(&mut self) {
        // SAFETY: addr came from a successful shmat and is detached once.
        unsafe {
            libc::shmdt(self.addr.as_ptr() as *const libc::c_void);
        }
    }
}

/// Check if process is alive using kill(pid, 0)
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(Errno::ESRCH) => false,
        Err(Errno::EPERM) => true, // exists, owned by someone else
        Err(_) => false,
    }
}

/// Get current process ID
pub fn get_current_pid() -> u32 {
    getpid().as_raw() as u32
}
