//! Helpers shared by the integration tests

#![allow(dead_code)]

use evtbus_ipc::IpcResult;

/// Run `child` in a forked process and return its pid. The child exits with
/// status 0 if `child` succeeds and 1 otherwise, skipping destructors.
pub fn fork_child<F: FnOnce() -> IpcResult<()>>(child: F) -> libc::pid_t {
    // SAFETY: the child only touches state it owns and leaves through _exit.
    match unsafe { libc::fork() } {
        -1 => panic!("fork failed: {}", std::io::Error::last_os_error()),
        0 => {
            let code = match child() {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("child failed: {e}");
                    1
                }
            };
            // SAFETY: terminates the child without running parent-owned drops.
            unsafe { libc::_exit(code) }
        }
        pid => pid,
    }
}

/// Wait for a forked child and return its exit status.
pub fn wait_child(pid: libc::pid_t) -> i32 {
    let mut status = 0;
    // SAFETY: pid is a child of this process.
    let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(rc, pid, "waitpid failed: {}", std::io::Error::last_os_error());
    assert!(libc::WIFEXITED(status), "child {pid} did not exit normally");
    libc::WEXITSTATUS(status)
}

/// Unique resource name for one test run
pub fn unique_name(prefix: &str) -> String {
    format!("{prefix}_{}_{}", std::process::id(), rand::random::<u32>())
}
