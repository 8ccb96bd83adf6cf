use hyperlite_shared::{HyperliteError, HyperliteResult};
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::Path;

/// Exclusive lock on a runtime home directory.
///
/// Two control planes driving the same sandboxes would fight over the
/// monitor and init sockets. The lock is released when dropped.
pub(crate) struct RuntimeLock {
    _file: File,
}

impl RuntimeLock {
    pub(crate) fn acquire(home_dir: &Path) -> HyperliteResult<Self> {
        let path = home_dir.join(".lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(HyperliteError::InvalidState(format!(
                "runtime home {} is locked by another process",
                home_dir.display()
            )));
        }

        Ok(Self { _file: file })
    }
}
