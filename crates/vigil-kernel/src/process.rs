//! Process liveness checks and signalling behind a trait seam.
//!
//! The watchdog only talks to [`ProcessControl`]; [`OsProcessControl`] is the
//! real implementation and tests substitute a fake.

use vigil_types::VigilError;

/// Liveness check and termination signals for an OS process.
pub trait ProcessControl: Send + Sync {
    /// `true` if a process with `pid` currently exists.
    fn is_alive(&self, pid: u32) -> bool;
    /// Ask the process to exit (SIGTERM on Unix).
    fn terminate(&self, pid: u32) -> Result<(), VigilError>;
    /// Force the process to exit (SIGKILL on Unix).
    fn kill(&self, pid: u32) -> Result<(), VigilError>;
}

/// `true` when `pid` names exactly one process.
///
/// On Unix, `kill(0, ..)` signals the caller's whole process group and
/// negative values address groups or every process, so only `1..=i32::MAX`
/// is a single target.
pub fn is_signalable_pid(pid: u32) -> bool {
    pid > 0 && i32::try_from(pid).is_ok()
}

/// Signals delivered through the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsProcessControl;

#[cfg(unix)]
impl ProcessControl for OsProcessControl {
    fn is_alive(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        if !is_signalable_pid(pid) {
            return false;
        }
        // Signal 0 checks existence without delivering anything. EPERM still means the
        // process exists.
        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn terminate(&self, pid: u32) -> Result<(), VigilError> {
        send(pid, nix::sys::signal::Signal::SIGTERM)
    }

    fn kill(&self, pid: u32) -> Result<(), VigilError> {
        send(pid, nix::sys::signal::Signal::SIGKILL)
    }
}

#[cfg(unix)]
fn send(pid: u32, signal: nix::sys::signal::Signal) -> Result<(), VigilError> {
    use nix::unistd::Pid;

    if !is_signalable_pid(pid) {
        return Err(VigilError::ProcessControl(format!(
            "pid {pid} does not name a single process"
        )));
    }
    nix::sys::signal::kill(Pid::from_raw(pid as i32), signal)
        .map_err(|e| VigilError::ProcessControl(format!("{signal:?} to {pid}: {e}")))
}

#[cfg(not(unix))]
impl ProcessControl for OsProcessControl {
    fn is_alive(&self, _pid: u32) -> bool {
        // No portable existence check; assume the recorded process is still there.
        true
    }

    fn terminate(&self, pid: u32) -> Result<(), VigilError> {
        Err(VigilError::ProcessControl(format!(
            "signals not supported on this platform (pid {pid})"
        )))
    }

    fn kill(&self, pid: u32) -> Result<(), VigilError> {
        self.terminate(pid)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(OsProcessControl.is_alive(std::process::id()));
    }

    #[test]
    fn exited_child_is_not_alive() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!OsProcessControl.is_alive(pid));
    }

    #[test]
    fn terminate_running_child() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        OsProcessControl.terminate(child.id()).unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn out_of_range_pid_is_rejected() {
        assert!(!OsProcessControl.is_alive(u32::MAX));
        assert!(matches!(
            OsProcessControl.kill(u32::MAX),
            Err(VigilError::ProcessControl(_))
        ));
    }

    #[test]
    fn pid_zero_is_never_checked_or_signalled() {
        assert!(!is_signalable_pid(0));
        assert!(!OsProcessControl.is_alive(0));
        assert!(matches!(
            OsProcessControl.terminate(0),
            Err(VigilError::ProcessControl(_))
        ));
        assert!(matches!(
            OsProcessControl.kill(0),
            Err(VigilError::ProcessControl(_))
        ));
    }

    #[test]
    fn signalable_range() {
        assert!(is_signalable_pid(1));
        assert!(is_signalable_pid(i32::MAX as u32));
        assert!(!is_signalable_pid(i32::MAX as u32 + 1));
    }
}
