//! Platform abstraction layer.
//!
//! All `#[cfg]` blocks for OS-specific process handling live here.

pub mod process;

pub use process::{descendant_pids, is_process_alive, request_termination, terminate_processes};
