//! Process suspension (SIGSTOP) for threat response
//!
//! The automated path only ever suspends. Resume and kill are manual
//! controls. Nothing here retries.

use crate::detector::process::process_state;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Why a process control call failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActuatorError {
    #[error("process {0} not found")]
    NotFound(u32),
    #[error("permission denied for process {0}")]
    PermissionDenied(u32),
    #[error("process {0} is protected")]
    Protected(u32),
    #[error("process {pid} did not exit within {waited:?}")]
    Timeout { pid: u32, waited: Duration },
    #[error("signal to process {pid} failed: {errno}")]
    Os { pid: u32, errno: Errno },
}

/// Capability to stop, continue and terminate processes
pub trait ProcessController: Send + Sync {
    fn suspend(&self, pid: u32) -> Result<(), ActuatorError>;
    fn resume(&self, pid: u32) -> Result<(), ActuatorError>;
    /// Terminate and wait up to `wait` for the process to go away
    fn kill(&self, pid: u32, wait: Duration) -> Result<(), ActuatorError>;
}

/// POSIX signal backend
#[derive(Debug, Clone)]
pub struct SignalController {
    proc_root: PathBuf,
    own_pid: u32,
}

impl SignalController {
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            own_pid: std::process::id(),
        }
    }

    fn guard(&self, pid: u32) -> Result<Pid, ActuatorError> {
        if pid <= 1 || pid == self.own_pid {
            return Err(ActuatorError::Protected(pid));
        }
        let raw = i32::try_from(pid).map_err(|_| ActuatorError::NotFound(pid))?;
        Ok(Pid::from_raw(raw))
    }

    fn send(&self, pid: u32, sig: Signal) -> Result<(), ActuatorError> {
        let target = self.guard(pid)?;
        signal::kill(target, sig).map_err(|errno| match errno {
            Errno::ESRCH => ActuatorError::NotFound(pid),
            Errno::EPERM => ActuatorError::PermissionDenied(pid),
            errno => ActuatorError::Os { pid, errno },
        })
    }

    /// Whether a process is stopped
    pub fn is_suspended(&self, pid: u32) -> bool {
        process_state(&self.proc_root, pid) == Some('T')
    }

    fn is_gone(&self, pid: u32) -> bool {
        match process_state(&self.proc_root, pid) {
            None => true,
            Some(state) => state == 'Z' || state == 'X',
        }
    }
}

impl Default for SignalController {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessController for SignalController {
    fn suspend(&self, pid: u32) -> Result<(), ActuatorError> {
        self.send(pid, Signal::SIGSTOP)?;
        info!("Suspended process {}", pid);
        Ok(())
    }

    fn resume(&self, pid: u32) -> Result<(), ActuatorError> {
        self.send(pid, Signal::SIGCONT)?;
        info!("Resumed process {}", pid);
        Ok(())
    }

    fn kill(&self, pid: u32, wait: Duration) -> Result<(), ActuatorError> {
        self.send(pid, Signal::SIGKILL)?;
        warn!("Sent SIGKILL to process {}", pid);

        let deadline = Instant::now() + wait;
        loop {
            if self.is_gone(pid) {
                info!("Process {} exited", pid);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ActuatorError::Timeout { pid, waited: wait });
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

/// Information about a process for logging
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    pub comm: String,
    pub exe: Option<PathBuf>,
    pub cmdline: Option<String>,
}

/// Get process info for logging
pub fn get_process_info(pid: u32) -> Option<ProcessInfo> {
    let comm = std::fs::read_to_string(format!("/proc/{}/comm", pid))
        .ok()?
        .trim()
        .to_string();
    let exe = std::fs::read_link(format!("/proc/{}/exe", pid)).ok();
    let cmdline = std::fs::read_to_string(format!("/proc/{}/cmdline", pid))
        .ok()
        .map(|s| s.replace('\0', " ").trim().to_string());

    Some(ProcessInfo {
        pid,
        comm,
        exe,
        cmdline,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Child, Command};

    fn spawn_sleeper() -> Child {
        Command::new("sleep").arg("30").spawn().unwrap()
    }

    fn wait_for_state(controller: &SignalController, pid: u32, stopped: bool) -> bool {
        for _ in 0..100 {
            if controller.is_suspended(pid) == stopped {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_protected_pids_are_refused() {
        let controller = SignalController::new();
        assert_eq!(controller.suspend(1), Err(ActuatorError::Protected(1)));
        assert_eq!(controller.suspend(0), Err(ActuatorError::Protected(0)));
        let own = std::process::id();
        assert_eq!(controller.suspend(own), Err(ActuatorError::Protected(own)));
    }

    #[test]
    fn test_missing_process() {
        let controller = SignalController::new();
        // Above the default pid_max, never allocated
        let pid = 4_194_400;
        assert_eq!(controller.suspend(pid), Err(ActuatorError::NotFound(pid)));
        assert_eq!(controller.resume(pid), Err(ActuatorError::NotFound(pid)));
    }

    #[test]
    fn test_suspend_resume_kill_child() {
        let controller = SignalController::new();
        let mut child = spawn_sleeper();
        let pid = child.id();

        controller.suspend(pid).unwrap();
        assert!(wait_for_state(&controller, pid, true));

        controller.resume(pid).unwrap();
        assert!(wait_for_state(&controller, pid, false));

        // The child turns into a zombie until reaped, which counts as gone
        controller.kill(pid, Duration::from_secs(3)).unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_get_process_info() {
        let pid = std::process::id();
        let info = get_process_info(pid).unwrap();
        assert_eq!(info.pid, pid);
        assert!(!info.comm.is_empty());
    }
}
