//! Ctrl-C hook that disposes a session before the process exits.

use super::OslSession;
use crate::error::{OslError, Result};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::warn;

/// Exit status used after an interrupt (128 + SIGINT).
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Dispose `session` on Ctrl-C, then exit the process.
///
/// Must be called from within a tokio runtime; the handler drives
/// [`OslSession::dispose`] on that runtime from the signal thread. Only one
/// handler can be installed per process.
pub fn install_interrupt_handler(session: Arc<OslSession>) -> Result<()> {
    let handle = Handle::try_current()
        .map_err(|e| OslError::Other(format!("No tokio runtime for interrupt handler: {}", e)))?;

    ctrlc::set_handler(move || {
        warn!("Interrupted, disposing session");
        handle.block_on(session.dispose());
        std::process::exit(INTERRUPTED_EXIT_CODE);
    })
    .map_err(|e| OslError::Other(format!("Cannot install interrupt handler: {}", e)))
}
