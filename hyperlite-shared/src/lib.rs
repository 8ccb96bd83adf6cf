//! Types shared between the hyperlite control plane and guest-side agents.
//!
//! - [`errors`]: the crate-wide error type
//! - [`constants`]: guest command codes, socket names and framing limits
//! - [`codec`]: the guest command frame and the TTY multiplex frame

pub mod codec;
pub mod constants;
pub mod errors;

pub use codec::{GuestFrame, TtyFrame};
pub use constants::InitCode;
pub use errors::{HyperliteError, HyperliteResult};
