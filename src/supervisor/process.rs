//! Child-process plumbing: spawning a service binary with its assigned port
//! and terminating it gracefully with a bounded grace period.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

use crate::supervisor::error::WardenError;

/// Resolve the executable path for a service. Service binaries live next to
/// the warden binary (release layout) unless the configured services
/// directory overrides the location. Cargo keeps hyphens in binary names, so
/// the service name is used as-is.
pub fn service_executable(
    service_name: &str,
    services_dir: Option<&Path>,
) -> Result<PathBuf, WardenError> {
    let dir = match services_dir {
        Some(dir) => dir.to_path_buf(),
        None => {
            let exe = env::current_exe().map_err(|e| WardenError::Spawn {
                name: service_name.to_string(),
                reason: format!("cannot determine executable directory: {}", e),
            })?;
            exe.parent()
                .map(Path::to_path_buf)
                .ok_or_else(|| WardenError::Spawn {
                    name: service_name.to_string(),
                    reason: "executable has no parent directory".to_string(),
                })?
        }
    };

    let mut exe_name = service_name.to_string();
    if cfg!(target_os = "windows") {
        exe_name.push_str(".exe");
    }
    Ok(dir.join(exe_name))
}

/// Handle to one spawned service process. Owned exclusively by the
/// Supervisor; liveness and termination go through this handle.
#[derive(Debug)]
pub struct ProcessHandle {
    pub pid: u32,
    child: Child,
}

impl ProcessHandle {
    /// Spawn a service binary, passing the assigned port as a `--port`
    /// argument and as two environment variables so receiving services may
    /// use either convention.
    pub fn spawn(name: &str, exe_path: &Path, port: u16) -> Result<Self, WardenError> {
        if !exe_path.exists() {
            return Err(WardenError::Spawn {
                name: name.to_string(),
                reason: format!("executable not found: {}", exe_path.display()),
            });
        }

        let mut cmd = Command::new(exe_path);
        cmd.arg("--port")
            .arg(port.to_string())
            .env("SERVICE_PORT", port.to_string())
            .env("WARDEN_ASSIGNED_PORT", port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);

        let child = cmd.spawn().map_err(|e| WardenError::Spawn {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        let pid = child.id().ok_or_else(|| WardenError::Spawn {
            name: name.to_string(),
            reason: "spawned process has no PID".to_string(),
        })?;

        tracing::info!("Spawned '{}' (pid {}) on port {}", name, pid, port);
        Ok(Self { pid, child })
    }

    /// Whether the process has not yet exited.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Send the graceful termination signal, wait up to `grace` for exit,
    /// then force-kill. Consumes the handle; the process is gone afterwards.
    pub async fn terminate(mut self, grace: Duration) {
        signal_graceful(self.pid);

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!("Process {} exited with {}", self.pid, status);
            }
            Ok(Err(e)) => {
                tracing::warn!("Failed to wait for process {}: {}", self.pid, e);
            }
            Err(_) => {
                tracing::warn!("Process {} ignored graceful signal, force killing", self.pid);
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
            }
        }
    }
}

/// Ask a process to terminate gracefully.
#[cfg(unix)]
fn signal_graceful(pid: u32) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::warn!("Failed to send SIGTERM to {}: {}", pid, e);
    }
}

/// Windows has no graceful signal for detached console processes; terminate
/// directly via the process handle.
#[cfg(windows)]
fn signal_graceful(pid: u32) {
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::{OpenProcess, TerminateProcess};
    use winapi::um::winnt::PROCESS_TERMINATE;

    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if handle.is_null() {
            tracing::warn!("Failed to open process {} for termination", pid);
            return;
        }
        if TerminateProcess(handle, 0) == 0 {
            tracing::warn!("TerminateProcess failed for {}", pid);
        }
        CloseHandle(handle);
    }
}
