//! Server-side registration of push listeners and the lease refresher.
//!
//! The engine only pushes to listeners it knows about, and it forgets a
//! listener once its lease expires. The registry registers every listener the
//! session owns, and a background task renews the lease of each listener whose
//! `refresh` flag is set. A listener the engine no longer knows is registered
//! again under the same uid.

use super::notification::ServerNotification;
use super::push::PushListener;
use crate::envelope::commands::{self, RegisterListenerArgs};
use crate::error::Result;
use crate::policy::Operation;
use async_trait::async_trait;
use serde_json::Value;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Channel the registry uses to reach the engine.
///
/// Implemented by the command client; tests substitute a recording mock.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Send a command under the policy of `operation` and return the parsed response.
    async fn send_command(&self, command: &str, operation: Operation) -> Result<Value>;

    /// Password to embed in command envelopes.
    fn password(&self) -> Option<String>;
}

/// The named listeners a session owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerSlot {
    /// Long-lived listener for server up/down.
    Main,
    /// Transient listener while waiting for execution to start.
    ExecStarted,
    /// Transient listener while waiting for execution to finish.
    ExecFinished,
}

impl ListenerSlot {
    pub const ALL: [ListenerSlot; 3] = [Self::Main, Self::ExecStarted, Self::ExecFinished];
}

#[derive(Debug, Default)]
struct ListenerSlots {
    main: Option<Arc<PushListener>>,
    exec_started: Option<Arc<PushListener>>,
    exec_finished: Option<Arc<PushListener>>,
}

impl ListenerSlots {
    fn slot_mut(&mut self, slot: ListenerSlot) -> &mut Option<Arc<PushListener>> {
        match slot {
            ListenerSlot::Main => &mut self.main,
            ListenerSlot::ExecStarted => &mut self.exec_started,
            ListenerSlot::ExecFinished => &mut self.exec_finished,
        }
    }

    fn all(&self) -> Vec<Arc<PushListener>> {
        [&self.main, &self.exec_started, &self.exec_finished]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }
}

struct Refresher {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Tracks listeners and keeps their leases alive.
pub struct ListenerRegistry {
    channel: Arc<dyn CommandChannel>,
    slots: Mutex<ListenerSlots>,
    listener_id: Option<String>,
    lease_default_ms: Option<u32>,
    refresh_interval: Duration,
    refresher: Mutex<Option<Refresher>>,
}

impl ListenerRegistry {
    /// `listener_id` is the uid requested for every registration that has no
    /// explicit one; `lease_default_ms` applies to listeners without their own
    /// lease timeout.
    pub fn new(
        channel: Arc<dyn CommandChannel>,
        listener_id: Option<String>,
        lease_default_ms: Option<u32>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            channel,
            slots: Mutex::new(ListenerSlots::default()),
            listener_id,
            lease_default_ms,
            refresh_interval,
            refresher: Mutex::new(None),
        }
    }

    pub fn listener_id(&self) -> Option<&str> {
        self.listener_id.as_deref()
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Register an endpoint on every address in `host_addresses`.
    ///
    /// The uid is `explicit_id`, else the session listener id, else a fresh
    /// UUID. Returns the uid used.
    pub async fn register_endpoint(
        &self,
        host_addresses: &[IpAddr],
        port: u16,
        timeout_ms: Option<u32>,
        notifications: Option<&[ServerNotification]>,
        explicit_id: Option<&str>,
    ) -> Result<String> {
        let uid = explicit_id
            .map(str::to_string)
            .or_else(|| self.listener_id.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let options = RegisterListenerArgs {
            timeout_ms,
            notifications: notifications.map(<[ServerNotification]>::to_vec),
            listener_uid: Some(uid.clone()),
        };
        let password = self.channel.password();

        for address in host_addresses {
            let command = commands::register_listener(
                &address.to_string(),
                port,
                &options,
                password.as_deref(),
            )?;
            self.channel
                .send_command(&command, Operation::RegisterListener)
                .await?;
        }
        debug!("Registered listener {} on port {}", uid, port);
        Ok(uid)
    }

    /// Register `listener` and store the uid on it.
    pub async fn register(&self, listener: &PushListener, explicit_id: Option<&str>) -> Result<String> {
        let addresses = listener.host_addresses().await;
        let uid = self
            .register_endpoint(
                &addresses,
                listener.port(),
                listener.lease_timeout_ms().or(self.lease_default_ms),
                listener.notifications(),
                explicit_id,
            )
            .await?;
        listener.set_uid(Some(uid.clone()));
        Ok(uid)
    }

    /// Release the lease of `listener`. A listener without uid is left alone.
    pub async fn unregister(&self, listener: &PushListener) -> Result<()> {
        let Some(uid) = listener.uid() else {
            return Ok(());
        };
        let command = commands::unregister_listener(&uid, self.channel.password().as_deref())?;
        self.channel
            .send_command(&command, Operation::UnregisterListener)
            .await?;
        listener.set_uid(None);
        debug!("Unregistered listener {}", uid);
        Ok(())
    }

    /// Renew the lease of every listener flagged for refresh.
    ///
    /// Failures are logged, never returned.
    pub async fn refresh_once(&self) {
        let listeners = self.listeners();
        for listener in listeners.iter().filter(|l| l.refresh()) {
            let Some(uid) = listener.uid() else {
                debug!("Listener '{}' has no uid, nothing to refresh", listener.name());
                continue;
            };
            debug!("Refreshing registration for listener: {}", uid);
            let result = match commands::refresh_listener_registration(
                &uid,
                self.channel.password().as_deref(),
            ) {
                Ok(command) => self
                    .channel
                    .send_command(&command, Operation::RefreshListenerRegistration)
                    .await
                    .map(|_| ()),
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {}
                Err(e) if e.is_no_such_listener() => {
                    debug!("Re-register listener: {}", uid);
                    if let Err(e) = self.register(listener, Some(&uid)).await {
                        warn!("Re-registration of listener {} failed: {}", uid, e);
                    }
                }
                Err(e) => warn!("Refreshing registration for listener {} failed: {}", uid, e),
            }
        }
    }

    /// Spawn the background refresher. A running refresher is left alone.
    pub fn start_refresher(self: &Arc<Self>) {
        let mut refresher = self.refresher.lock().expect("refresher lock poisoned");
        if refresher.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(Self::refresh_loop(
            Arc::downgrade(self),
            self.refresh_interval,
            stop_rx,
        ));
        *refresher = Some(Refresher { stop_tx, handle });
        info!(
            "Listener refresher started (interval {:?})",
            self.refresh_interval
        );
    }

    /// Signal the refresher to stop and wait for it to exit.
    pub async fn stop_refresher(&self) {
        let refresher = self.refresher.lock().expect("refresher lock poisoned").take();
        if let Some(refresher) = refresher {
            let _ = refresher.stop_tx.send(true);
            let _ = refresher.handle.await;
            debug!("Listener refresher stopped");
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.refresher
            .lock()
            .expect("refresher lock poisoned")
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    async fn refresh_loop(
        registry: Weak<ListenerRegistry>,
        interval: Duration,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if *stop_rx.borrow() {
                break;
            }
            match registry.upgrade() {
                Some(registry) => registry.refresh_once().await,
                None => break,
            }
        }
    }

    /// Store `listener` in `slot`, returning the listener it replaces.
    pub fn insert(&self, slot: ListenerSlot, listener: Arc<PushListener>) -> Option<Arc<PushListener>> {
        self.slots
            .lock()
            .expect("listener slots lock poisoned")
            .slot_mut(slot)
            .replace(listener)
    }

    pub fn get(&self, slot: ListenerSlot) -> Option<Arc<PushListener>> {
        self.slots
            .lock()
            .expect("listener slots lock poisoned")
            .slot_mut(slot)
            .clone()
    }

    pub fn take(&self, slot: ListenerSlot) -> Option<Arc<PushListener>> {
        self.slots
            .lock()
            .expect("listener slots lock poisoned")
            .slot_mut(slot)
            .take()
    }

    /// Snapshot of every stored listener.
    pub fn listeners(&self) -> Vec<Arc<PushListener>> {
        self.slots.lock().expect("listener slots lock poisoned").all()
    }

    /// Remove the listener in `slot`: stop refreshing it, release its lease
    /// and close it. Unregistration failures are logged.
    pub async fn release(&self, slot: ListenerSlot) {
        if let Some(listener) = self.take(slot) {
            self.retire(&listener).await;
        }
    }

    async fn retire(&self, listener: &PushListener) {
        listener.set_refresh(false);
        if let Err(e) = self.unregister(listener).await {
            warn!("Cannot unregister listener '{}': {}", listener.name(), e);
        }
        listener.dispose();
    }

    /// Stop the refresher, then release every listener.
    pub async fn dispose_all(&self) {
        self.stop_refresher().await;
        for slot in ListenerSlot::ALL {
            self.release(slot).await;
        }
    }
}
