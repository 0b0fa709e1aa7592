//! Blocking until the engine reports an execution milestone.
//!
//! A waiter owns a transient listener in one registry slot. Its callback
//! resolves the wait on the first target notification, on a failure
//! notification, or on the listener's own timeout. [`Waiter::wait`] then hands
//! the slot back to the registry.

use crate::config::ListenerConfig;
use crate::error::{OslError, Result};
use crate::listener::{ListenerRegistry, ListenerSlot, PushKind, PushListener, ServerNotification};
use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitOutcome {
    Reached(ServerNotification),
    Failed(ServerNotification),
    TimedOut,
}

pub(crate) struct Waiter {
    slot: ListenerSlot,
    phase: &'static str,
    rx: mpsc::UnboundedReceiver<WaitOutcome>,
}

/// Stand up a listener in `slot` that resolves on any of `targets`.
pub(crate) async fn arm(
    registry: &ListenerRegistry,
    slot: ListenerSlot,
    phase: &'static str,
    targets: &[ServerNotification],
    host: Option<IpAddr>,
    timeout: Option<Duration>,
) -> Result<Waiter> {
    registry.release(slot).await;

    let mut notifications = targets.to_vec();
    notifications.extend([ServerNotification::ExecFailed, ServerNotification::CheckFailed]);
    let listener = Arc::new(
        PushListener::bind(
            format!("{:?}", slot),
            host,
            ListenerConfig::PRIVATE_PORTS_RANGE,
        )?
        .with_notifications(notifications),
    );
    registry.insert(slot, listener.clone());
    if let Err(e) = registry.register(&listener, None).await {
        registry.release(slot).await;
        return Err(e);
    }
    listener.set_refresh(true);

    match listener
        .cleanup_notifications(ListenerConfig::CLEANUP_TIMEOUT)
        .await
    {
        Ok(0) => {}
        Ok(discarded) => debug!("Discarded {} stale notifications", discarded),
        Err(e) => debug!("Notification cleanup failed: {}", e),
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let targets = targets.to_vec();
    listener.add_callback(Arc::new(move |listener: &PushListener, payload: &Value| {
        let outcome = match PushKind::of(payload) {
            PushKind::Notification(n) if targets.contains(&n) => WaitOutcome::Reached(n),
            PushKind::Notification(n) if n.is_failure() => WaitOutcome::Failed(n),
            PushKind::Timeout => WaitOutcome::TimedOut,
            _ => return,
        };
        listener.stop_listening();
        listener.clear_callbacks();
        listener.set_refresh(false);
        let _ = tx.send(outcome);
    }));

    if let Err(e) = listener.start_listening(timeout) {
        registry.release(slot).await;
        return Err(e);
    }
    debug!("Waiting for {} listener is armed", phase);
    Ok(Waiter { slot, phase, rx })
}

impl Waiter {
    /// Block until resolved, then release the listener.
    pub(crate) async fn wait(mut self, registry: &ListenerRegistry) -> Result<ServerNotification> {
        info!("Waiting for {}", self.phase);
        let outcome = self.rx.recv().await;
        registry.release(self.slot).await;
        match outcome {
            Some(WaitOutcome::Reached(notification)) => {
                info!("Successfully {}: {}", self.phase, notification);
                Ok(notification)
            }
            Some(WaitOutcome::Failed(notification)) => Err(OslError::Command {
                message: format!(
                    "Waiting for {} failed: server reported {}",
                    self.phase, notification
                ),
            }),
            Some(WaitOutcome::TimedOut) => Err(OslError::WaitTimedOut { phase: self.phase }),
            None => Err(OslError::Other(format!(
                "Listener closed while waiting for {}",
                self.phase
            ))),
        }
    }

    /// Release the listener without waiting.
    pub(crate) async fn cancel(self, registry: &ListenerRegistry) {
        registry.release(self.slot).await;
    }
}
