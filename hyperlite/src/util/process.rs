//! Process helpers for hypervisor PIDs.

/// Zero and values that wrap to negative pids address process groups.
fn is_valid_pid(pid: u32) -> bool {
    pid != 0 && pid <= i32::MAX as u32
}

/// Kill a process with SIGKILL.
///
/// # Returns
/// * `true` - Process was killed or doesn't exist
/// * `false` - Failed to kill (permission denied)
pub fn kill_process(pid: u32) -> bool {
    if !is_valid_pid(pid) {
        return true;
    }
    unsafe { libc::kill(pid as i32, libc::SIGKILL) == 0 || !is_process_alive(pid) }
}

/// Check if a process with the given PID exists.
///
/// Uses `libc::kill(pid, 0)` which sends a null signal to check existence.
pub fn is_process_alive(pid: u32) -> bool {
    if !is_valid_pid(pid) {
        return false;
    }
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// Verify that a PID still belongs to the hypervisor of the given sandbox.
///
/// Guards against PID reuse after a host reboot or a long control-plane
/// outage. The hypervisor command line carries the sandbox id in its
/// `-name` argument.
pub fn is_same_process(pid: u32, sandbox_id: &str) -> bool {
    #[cfg(target_os = "linux")]
    {
        let cmdline_path = format!("/proc/{}/cmdline", pid);
        match std::fs::read_to_string(&cmdline_path) {
            Ok(cmdline) => {
                let args: Vec<&str> = cmdline.split('\0').collect();
                args.iter().any(|arg| arg.contains("qemu")) && cmdline.contains(sandbox_id)
            }
            Err(_) => false,
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = sandbox_id;
        is_process_alive(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_process_alive_current() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_is_process_alive_invalid() {
        // u32::MAX would become -1 and address every process.
        assert!(!is_process_alive(u32::MAX));
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(999999999));
    }

    #[test]
    fn test_is_same_process_rejects_test_binary() {
        let current_pid = std::process::id();
        #[cfg(target_os = "linux")]
        assert!(!is_same_process(current_pid, "sandbox-under-test"));
        let _ = current_pid;
    }

    #[test]
    fn test_kill_missing_process_reports_gone() {
        assert!(kill_process(999999999));
    }
}
