//! Local engine process management.

mod launcher;
mod supervisor;

pub use launcher::{EngineProcess, LaunchConfig, MultiListenerTarget};
pub use supervisor::{LocalServer, ServerState, StartedServer};
