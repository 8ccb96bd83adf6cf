//! Hypervisor monitor protocol.
//!
//! ## Architecture
//!
//! ```text
//! StateMachine ──submit(Session)──► SessionQueue task ──JSON──► monitor socket
//!      ▲                                  │  ▲
//!      │ completion / DeviceFailed /      │  │ return | error
//!      │ Interrupted events               ▼  │
//!      └──────────────────────────── reader task ◄── event (logged)
//! ```
//!
//! Sessions are served FIFO with one in flight. Each command is retried on
//! an error response according to [`RetryPolicy`]; a broken connection ends
//! the queue.

mod protocol;
mod queue;
mod retry;
mod session;
#[cfg(test)]
pub(crate) mod testing;

pub use protocol::{MonitorCommand, MonitorError, MonitorEvent, MonitorMessage};
pub use queue::SessionQueue;
pub use retry::{RetryCounter, RetryPolicy};
pub use session::{Hotplug, Session, scsi_device_name};
