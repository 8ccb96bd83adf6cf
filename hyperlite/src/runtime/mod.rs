mod core;
pub(crate) mod layout;
mod lock;
pub mod options;
pub mod types;

pub use self::core::{SandboxInfo, SandboxRuntime};
pub use layout::{FilesystemLayout, SandboxLayout};
pub use options::{BootConfig, NetworkOptions, RuntimeOptions, Timeouts};
pub use types::{SandboxId, generate_sandbox_id};
