//! PID-level liveness checks, independent of the child handles the
//! supervisor holds. Needed for services whose handle was lost (e.g. a
//! registry adopted from a previous warden run) and as the monitor's
//! ground truth for "the OS process still exists".

use sysinfo::{Pid, System};

/// Whether a PID exists in the OS process table.
pub fn is_running(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_processes();
    sys.process(Pid::from_u32(pid)).is_some()
}

// sysinfo scans the OS process table synchronously. Calling it on a tokio
// worker thread would stall the runtime, so the async wrapper runs it on the
// blocking pool.

/// Async wrapper for [`is_running`].
pub async fn is_running_async(pid: u32) -> bool {
    tokio::task::spawn_blocking(move || is_running(pid))
        .await
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_pid_is_running() {
        assert!(is_running(std::process::id()));
    }

    #[test]
    fn test_bogus_pid_is_not_running() {
        // PIDs near u32::MAX are not valid on any supported platform
        assert!(!is_running(u32::MAX - 1));
    }

    #[tokio::test]
    async fn test_async_wrapper_matches_sync() {
        assert!(is_running_async(std::process::id()).await);
        assert!(!is_running_async(u32::MAX - 1).await);
    }
}
