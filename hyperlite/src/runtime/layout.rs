//! On-disk layout of the runtime home directory.
//!
//! ```text
//! <home>/
//!   db/hyperlite.db
//!   logs/hyperlite.log.<date>
//!   sandboxes/<id>/
//!     hyper.sock  tty.sock  qmp.sock  console.sock
//!     share_dir/
//!     qemu.log
//! ```

use hyperlite_shared::HyperliteResult;
use hyperlite_shared::constants::sockets;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct FilesystemLayout {
    home_dir: PathBuf,
}

impl FilesystemLayout {
    pub fn new(home_dir: PathBuf) -> Self {
        Self { home_dir }
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn db_dir(&self) -> PathBuf {
        self.home_dir.join("db")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home_dir.join("logs")
    }

    pub fn sandboxes_dir(&self) -> PathBuf {
        self.home_dir.join("sandboxes")
    }

    pub fn sandbox_layout(&self, sandbox_id: &str) -> SandboxLayout {
        SandboxLayout::new(self.sandboxes_dir().join(sandbox_id))
    }

    pub fn prepare(&self) -> HyperliteResult<()> {
        std::fs::create_dir_all(&self.home_dir)?;
        std::fs::create_dir_all(self.db_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(self.sandboxes_dir())?;
        Ok(())
    }
}

/// Per-sandbox working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLayout {
    root: PathBuf,
}

impl SandboxLayout {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn init_socket(&self) -> PathBuf {
        self.root.join(sockets::INIT)
    }

    pub fn tty_socket(&self) -> PathBuf {
        self.root.join(sockets::TTY)
    }

    pub fn monitor_socket(&self) -> PathBuf {
        self.root.join(sockets::MONITOR)
    }

    pub fn console_socket(&self) -> PathBuf {
        self.root.join(sockets::CONSOLE)
    }

    pub fn share_dir(&self) -> PathBuf {
        self.root.join(sockets::SHARE_DIR)
    }

    pub fn hypervisor_log(&self) -> PathBuf {
        self.root.join("qemu.log")
    }

    pub fn prepare(&self) -> HyperliteResult<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.share_dir())?;
        Ok(())
    }

    /// Remove the working directory. Missing directories are not an error.
    pub fn cleanup(&self) -> HyperliteResult<()> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sandbox_layout_paths() {
        let layout = FilesystemLayout::new(PathBuf::from("/srv/hl"));
        let sandbox = layout.sandbox_layout("01ABC");
        assert_eq!(sandbox.root(), Path::new("/srv/hl/sandboxes/01ABC"));
        assert_eq!(
            sandbox.init_socket(),
            PathBuf::from("/srv/hl/sandboxes/01ABC/hyper.sock")
        );
        assert_eq!(
            sandbox.share_dir(),
            PathBuf::from("/srv/hl/sandboxes/01ABC/share_dir")
        );
    }

    #[test]
    fn test_prepare_and_cleanup() {
        let temp = TempDir::new().unwrap();
        let layout = FilesystemLayout::new(temp.path().to_path_buf());
        layout.prepare().unwrap();

        let sandbox = layout.sandbox_layout("box1");
        sandbox.prepare().unwrap();
        assert!(sandbox.share_dir().is_dir());

        sandbox.cleanup().unwrap();
        assert!(!sandbox.root().exists());
        // Second cleanup is a no-op.
        sandbox.cleanup().unwrap();
    }
}
