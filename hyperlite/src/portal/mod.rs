//! Host ends of the guest-facing streams.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────┐  frames   ┌───────────────────┐
//! StateMachine ──►│ InitChannel  │◄────────► │ hyper.sock (init) │
//!      ▲          │ dispatch/ack │           └───────────────────┘
//!      │ events   └──────────────┘
//!      │          ┌──────────────┐  frames   ┌───────────────────┐
//!      └──────────│ TtyMux       │◄────────► │ tty.sock          │
//!                 └──────────────┘           └───────────────────┘
//!                   console logger ◄──────── console.sock
//! ```

mod channel;
mod console;
#[cfg(test)]
pub(crate) mod testing;
mod tty;

pub use channel::{FinishPolicy, GuestCommand, InitChannel, InitChannelConfig, await_ready};
pub use console::spawn_console_logger;
pub use tty::{SessionInfo, TtyClient, TtyEndpoint, TtyMux};
