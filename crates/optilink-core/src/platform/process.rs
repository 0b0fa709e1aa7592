//! Platform-specific process management.
//!
//! The engine may spawn helper processes of its own. These helpers find a
//! process tree through `sysinfo` and bring it down with SIGTERM followed by
//! SIGKILL on Unix, or a direct kill elsewhere.

use crate::error::{OslError, Result};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, warn};

fn process_snapshot() -> System {
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::new());
    system
}

/// Check if a process with the given PID is alive.
///
/// # Platform Behavior
/// - **Unix**: `kill(pid, 0)` existence check
/// - **Other**: lookup in a fresh process snapshot
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid as NixPid;

        kill(NixPid::from_raw(pid as i32), None).is_ok()
    }

    #[cfg(not(unix))]
    {
        process_snapshot().process(Pid::from_u32(pid)).is_some()
    }
}

/// All descendants of `pid`, depth first.
pub fn descendant_pids(pid: u32) -> Vec<u32> {
    let system = process_snapshot();
    let mut pids = Vec::new();
    collect_descendants(&system, Pid::from_u32(pid), &mut pids);
    pids
}

fn collect_descendants(system: &System, parent: Pid, pids: &mut Vec<u32>) {
    for (child_pid, process) in system.processes() {
        if process.parent() == Some(parent) {
            let child = child_pid.as_u32();
            if !pids.contains(&child) {
                pids.push(child);
                collect_descendants(system, *child_pid, pids);
            }
        }
    }
}

/// Ask a process to exit (SIGTERM on Unix, a kill elsewhere).
///
/// Returns `false` if the process was already gone.
pub fn request_termination(pid: u32) -> Result<bool> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid as NixPid;

        debug!("Sending SIGTERM to process {}", pid);
        match kill(NixPid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => Ok(true),
            Err(nix::errno::Errno::ESRCH) => Ok(false),
            Err(e) => Err(OslError::Other(format!(
                "Failed to send SIGTERM to {}: {}",
                pid, e
            ))),
        }
    }

    #[cfg(not(unix))]
    {
        Ok(force_kill(pid))
    }
}

fn force_kill(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid as NixPid;

        debug!("Sending SIGKILL to process {}", pid);
        kill(NixPid::from_raw(pid as i32), Signal::SIGKILL).is_ok()
    }

    #[cfg(not(unix))]
    {
        match process_snapshot().process(Pid::from_u32(pid)) {
            Some(process) => process.kill(),
            None => false,
        }
    }
}

/// Terminate processes that are not children of this process.
///
/// Each pid gets a termination request; survivors after `grace` are killed.
/// Returns the pids that were still alive after the kill.
pub async fn terminate_processes(pids: &[u32], grace: Duration) -> Vec<u32> {
    let mut pending: Vec<u32> = Vec::new();
    for &pid in pids {
        match request_termination(pid) {
            Ok(true) => pending.push(pid),
            Ok(false) => {}
            Err(e) => {
                warn!("{}", e);
                pending.push(pid);
            }
        }
    }

    let poll = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    while !pending.is_empty() && waited < grace {
        tokio::time::sleep(poll).await;
        waited += poll;
        pending.retain(|&pid| is_process_alive(pid));
    }

    for &pid in &pending {
        debug!("Process {} still running, killing it", pid);
        force_kill(pid);
    }
    if !pending.is_empty() {
        tokio::time::sleep(poll).await;
    }
    pending.retain(|&pid| is_process_alive(pid));
    pending
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_current_process_has_no_unexpected_descendants() {
        let descendants = descendant_pids(std::process::id());
        assert!(!descendants.contains(&std::process::id()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_orphaned_sleeper() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id();
        let reaper = std::thread::spawn(move || child.wait());

        let survivors = terminate_processes(&[pid], Duration::from_secs(2)).await;
        reaper.join().unwrap().unwrap();
        assert!(survivors.is_empty() || !is_process_alive(pid));
    }
}
