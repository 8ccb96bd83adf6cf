mod process;
mod socket;

pub use process::{is_process_alive, is_same_process, kill_process};
pub use socket::connect_unix;
