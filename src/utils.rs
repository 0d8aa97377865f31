//! Process helpers shared by the hypervisor wrapper and session records.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Check whether `pid` exists by sending it signal 0.
///
/// EPERM means the process exists but belongs to someone else.
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Send SIGTERM. Errors (already gone, not ours) are ignored.
pub fn terminate(pid: u32) {
    if let Ok(raw) = i32::try_from(pid) {
        let _ = kill(Pid::from_raw(raw), Signal::SIGTERM);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_out_of_range_pid() {
        assert!(!is_process_alive(u32::MAX));
    }
}
