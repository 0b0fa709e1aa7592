//! Optilink Core - client session layer for a remote optimization engine.
//!
//! This crate speaks the engine's framed TCP protocol, receives its push
//! notifications on local listeners, keeps those listeners' leases alive and,
//! when no running engine is given, launches and supervises a local one.
//!
//! # Example
//!
//! ```rust,ignore
//! use optilink_core::OslSession;
//!
//! #[tokio::main]
//! async fn main() -> optilink_core::Result<()> {
//!     let session = OslSession::builder()
//!         .host("127.0.0.1")
//!         .port(49690)
//!         .connect()
//!         .await?;
//!
//!     println!("Engine version: {:?}", session.osl_version());
//!     session.start(true, true).await?;
//!     session.dispose().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod envelope;
pub mod error;
pub mod listener;
pub mod platform;
pub mod policy;
pub mod process;
pub mod session;
pub mod timeout;
pub mod transport;
pub mod version;

// Re-export commonly used types
pub use error::{OslError, Result};
pub use listener::{
    CommandChannel, ListenerRegistry, ListenerSlot, NotificationCallback, PushKind, PushListener,
    ServerNotification,
};
pub use policy::{Operation, PolicyRegisters, RequestPolicy};
pub use process::{LaunchConfig, LocalServer, MultiListenerTarget, ServerState};
pub use session::{
    install_interrupt_handler, CommandClient, Endpoint, OslSession, SessionBuilder, StopRequest,
};
pub use timeout::Deadline;
pub use transport::TcpClient;
pub use version::{OslVersion, ProtocolLevel};
