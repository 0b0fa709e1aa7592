//! Push listener: an inbound TCP endpoint the engine connects to for each
//! notification.
//!
//! Every connection carries exactly one framed JSON payload. The listener
//! acknowledges it with an empty frame and hands the decoded payload to its
//! callbacks, in registration order, on the accept task itself.

use super::notification::{ServerNotification, TIMEOUT_ERROR_TYPE};
use crate::config::{ListenerConfig, ServerConfig};
use crate::error::{OslError, Result};
use crate::timeout::Deadline;
use crate::transport::frame::{read_frame, write_frame};
use serde_json::Value;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Callback invoked for every payload a listener receives.
///
/// Context a callback needs (queues, ids) is captured by the closure.
pub type NotificationCallback = Arc<dyn Fn(&PushListener, &Value) + Send + Sync>;

/// Inbound notification endpoint.
pub struct PushListener {
    name: String,
    local_addr: SocketAddr,
    socket: Mutex<Option<Arc<TcpListener>>>,
    uid: Mutex<Option<String>>,
    refresh: AtomicBool,
    notifications: Option<Vec<ServerNotification>>,
    lease_timeout_ms: Option<u32>,
    callbacks: Mutex<Vec<NotificationCallback>>,
    task: Mutex<Option<JoinHandle<()>>>,
    stop_tx: Mutex<watch::Sender<bool>>,
}

impl std::fmt::Debug for PushListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushListener")
            .field("name", &self.name)
            .field("local_addr", &self.local_addr)
            .field("uid", &self.uid())
            .field("refresh", &self.refresh())
            .finish()
    }
}

impl PushListener {
    /// Bind to the first free port of `port_range` on `host`.
    ///
    /// `None` binds the unspecified IPv4 address. Must be called from within a
    /// tokio runtime.
    pub fn bind(name: impl Into<String>, host: Option<IpAddr>, port_range: (u16, u16)) -> Result<Self> {
        let name = name.into();
        let ip = host.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let (first, last) = port_range;

        for port in first..=last {
            match Self::try_bind(SocketAddr::new(ip, port)) {
                Ok(listener) => {
                    let local_addr = listener.local_addr()?;
                    debug!("Listener '{}' bound to {}", name, local_addr);
                    let (stop_tx, _) = watch::channel(false);
                    return Ok(Self {
                        name,
                        local_addr,
                        socket: Mutex::new(Some(Arc::new(listener))),
                        uid: Mutex::new(None),
                        refresh: AtomicBool::new(false),
                        notifications: None,
                        lease_timeout_ms: None,
                        callbacks: Mutex::new(Vec::new()),
                        task: Mutex::new(None),
                        stop_tx: Mutex::new(stop_tx),
                    });
                }
                Err(_) => continue,
            }
        }

        Err(OslError::CannotBindListener { first, last })
    }

    fn try_bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.bind(addr)?;
        socket.listen(ListenerConfig::ACCEPT_BACKLOG)
    }

    /// Notification kinds to subscribe to when registered.
    pub fn with_notifications(mut self, notifications: Vec<ServerNotification>) -> Self {
        self.notifications = Some(notifications);
        self
    }

    /// Lease timeout in milliseconds to request when registered.
    pub fn with_lease_timeout(mut self, lease_timeout_ms: Option<u32>) -> Self {
        self.lease_timeout_ms = lease_timeout_ms;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn notifications(&self) -> Option<&[ServerNotification]> {
        self.notifications.as_deref()
    }

    pub fn lease_timeout_ms(&self) -> Option<u32> {
        self.lease_timeout_ms
    }

    /// Registration id, once registered.
    pub fn uid(&self) -> Option<String> {
        self.uid.lock().expect("listener uid lock poisoned").clone()
    }

    pub(crate) fn set_uid(&self, uid: Option<String>) {
        *self.uid.lock().expect("listener uid lock poisoned") = uid;
    }

    /// Whether the lease refresher keeps this listener alive.
    pub fn refresh(&self) -> bool {
        self.refresh.load(Ordering::SeqCst)
    }

    pub(crate) fn set_refresh(&self, refresh: bool) {
        self.refresh.store(refresh, Ordering::SeqCst);
    }

    /// Addresses to advertise to the engine.
    ///
    /// A listener on the unspecified address advertises every local IPv4
    /// address of the host plus loopback.
    pub async fn host_addresses(&self) -> Vec<IpAddr> {
        let ip = self.local_addr.ip();
        if !ip.is_unspecified() {
            return vec![ip];
        }

        let mut addresses: Vec<IpAddr> = Vec::new();
        if let Some(host_name) = sysinfo::System::host_name() {
            match tokio::net::lookup_host((host_name.as_str(), 0)).await {
                Ok(resolved) => {
                    for addr in resolved {
                        if addr.is_ipv4() && !addresses.contains(&addr.ip()) {
                            addresses.push(addr.ip());
                        }
                    }
                }
                Err(e) => debug!("Cannot resolve host name '{}': {}", host_name, e),
            }
        }
        let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
        if !addresses.contains(&loopback) {
            addresses.push(loopback);
        }
        addresses
    }

    pub fn add_callback(&self, callback: NotificationCallback) {
        self.callbacks
            .lock()
            .expect("listener callbacks lock poisoned")
            .push(callback);
    }

    pub fn clear_callbacks(&self) {
        self.callbacks
            .lock()
            .expect("listener callbacks lock poisoned")
            .clear();
    }

    /// Spawn the accept loop.
    ///
    /// `timeout` bounds the whole loop. When it expires without a payload,
    /// callbacks receive `{"type": "TimeoutError"}` once and the loop ends.
    pub fn start_listening(self: &Arc<Self>, timeout: Option<Duration>) -> Result<()> {
        let socket = self
            .socket
            .lock()
            .expect("listener socket lock poisoned")
            .clone()
            .ok_or(OslError::Disposed {
                operation: "start listening",
            })?;

        let mut task = self.task.lock().expect("listener task lock poisoned");
        let mut stop_tx = self.stop_tx.lock().expect("listener stop lock poisoned");
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            if !*stop_tx.borrow() {
                debug!("Listener '{}' is already listening", self.name);
                return Ok(());
            }
            debug!("Listener '{}' restarting while the previous loop stops", self.name);
        }

        // The previous loop keeps its own stop flag and exits on its own.
        let (fresh_tx, stop_rx) = watch::channel(false);
        *stop_tx = fresh_tx;
        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            this.accept_loop(socket, timeout, stop_rx).await;
        }));
        info!("Listener '{}' listening on port {}", self.name, self.port());
        Ok(())
    }

    /// Ask the accept loop to exit after the current iteration.
    pub fn stop_listening(&self) {
        self.stop_tx
            .lock()
            .expect("listener stop lock poisoned")
            .send_replace(true);
    }

    /// True while the accept task exists and has not finished.
    pub fn is_listening(&self) -> bool {
        self.task
            .lock()
            .expect("listener task lock poisoned")
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Wait for the accept task to finish.
    pub async fn join(&self) {
        let handle = self.task.lock().expect("listener task lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Accept and discard pending notifications until none arrives within
    /// `timeout`. Returns the number discarded.
    pub async fn cleanup_notifications(&self, timeout: Duration) -> Result<usize> {
        if self.is_listening() {
            warn!(
                "Listener '{}' is listening; skipping notification cleanup",
                self.name
            );
            return Ok(0);
        }
        let socket = self
            .socket
            .lock()
            .expect("listener socket lock poisoned")
            .clone()
            .ok_or(OslError::Disposed {
                operation: "clean up notifications",
            })?;

        let mut discarded = 0;
        loop {
            let deadline = Deadline::new(Some(timeout));
            let (stream, peer) = match deadline.run(socket.accept()).await {
                Ok(accepted) => accepted,
                Err(e) if e.is_timeout() => break,
                Err(e) => return Err(e),
            };
            match Self::receive_payload(stream, &deadline).await {
                Ok(payload) => {
                    debug!("Listener '{}' discarded stale {} from {}", self.name, payload, peer);
                    discarded += 1;
                }
                Err(e) if e.is_timeout() => break,
                Err(e) => debug!("Listener '{}' cleanup receive failed: {}", self.name, e),
            }
        }
        Ok(discarded)
    }

    /// Stop the loop and close the socket. Idempotent.
    pub fn dispose(&self) {
        self.stop_listening();
        self.clear_callbacks();
        if let Some(task) = self.task.lock().expect("listener task lock poisoned").take() {
            task.abort();
        }
        if self
            .socket
            .lock()
            .expect("listener socket lock poisoned")
            .take()
            .is_some()
        {
            debug!("Listener '{}' disposed", self.name);
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.socket
            .lock()
            .expect("listener socket lock poisoned")
            .is_none()
    }

    async fn accept_loop(
        &self,
        socket: Arc<TcpListener>,
        timeout: Option<Duration>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let deadline = Deadline::new(timeout);
        loop {
            if *stop_rx.borrow() {
                break;
            }

            let accepted = tokio::select! {
                _ = stop_rx.changed() => break,
                accepted = deadline.run(socket.accept()) => accepted,
            };

            let outcome = match accepted {
                Ok((stream, _peer)) => Self::receive_payload(stream, &deadline).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(payload) => self.execute_callbacks(&payload),
                Err(e) if e.is_timeout() => {
                    debug!("Listener '{}' timed out", self.name);
                    self.execute_callbacks(&serde_json::json!({ "type": TIMEOUT_ERROR_TYPE }));
                    break;
                }
                Err(e) => {
                    warn!("Listener '{}' failed to receive notification: {}", self.name, e);
                    tokio::select! {
                        _ = stop_rx.changed() => break,
                        _ = tokio::time::sleep(ListenerConfig::ACCEPT_RETRY_DELAY) => {}
                    }
                }
            }
        }
        debug!("Listener '{}' accept loop finished", self.name);
    }

    async fn receive_payload(mut stream: TcpStream, deadline: &Deadline) -> Result<Value> {
        let message = read_frame(&mut stream, deadline).await?;
        let payload: Value = serde_json::from_slice(&message)?;
        write_frame(&mut stream, b"", deadline).await?;
        Ok(payload)
    }

    fn execute_callbacks(&self, payload: &Value) {
        let callbacks: Vec<NotificationCallback> = self
            .callbacks
            .lock()
            .expect("listener callbacks lock poisoned")
            .clone();
        for callback in callbacks {
            callback(self, payload);
        }
    }
}

impl Drop for PushListener {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

/// Bind a listener in the private port range on localhost.
pub fn bind_local(name: impl Into<String>) -> Result<PushListener> {
    let host = ServerConfig::LOCALHOST
        .parse::<IpAddr>()
        .map_err(|e| OslError::validation("host", e.to_string()))?;
    PushListener::bind(name, Some(host), ListenerConfig::PRIVATE_PORTS_RANGE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TcpClient;
    use serde_json::json;
    use tokio::sync::mpsc;

    async fn push(port: u16, payload: &Value) -> String {
        let mut client = TcpClient::new();
        client
            .connect("127.0.0.1", port, Some(Duration::from_secs(2)))
            .await
            .unwrap();
        client
            .send_message(&payload.to_string(), Some(Duration::from_secs(2)))
            .await
            .unwrap();
        match client.receive_message(Some(Duration::from_secs(2))).await {
            Err(OslError::EmptyResponse) => String::new(),
            other => other.unwrap(),
        }
    }

    #[tokio::test]
    async fn test_two_listeners_get_distinct_ports_in_range() {
        let range = ListenerConfig::PRIVATE_PORTS_RANGE;
        let first = bind_local("first").unwrap();
        let second = bind_local("second").unwrap();
        assert_ne!(first.port(), second.port());
        for port in [first.port(), second.port()] {
            assert!(port >= range.0 && port <= range.1);
        }
    }

    #[tokio::test]
    async fn test_bind_fails_when_range_taken() {
        let taken = bind_local("taken").unwrap();
        let port = taken.port();
        let result = PushListener::bind("blocked", Some(taken.local_addr().ip()), (port, port));
        assert!(matches!(result, Err(OslError::CannotBindListener { .. })));
    }

    #[tokio::test]
    async fn test_callbacks_receive_payload_and_ack_is_empty() {
        let listener = Arc::new(bind_local("main").unwrap());
        let (tx, mut rx) = mpsc::unbounded_channel();
        listener.add_callback(Arc::new(move |l: &PushListener, payload: &Value| {
            let _ = tx.send((l.name().to_string(), payload.clone()));
        }));
        listener.start_listening(Some(Duration::from_secs(5))).unwrap();
        assert!(listener.is_listening());

        let ack = push(listener.port(), &json!({"type": "SERVER_UP", "port": 5310})).await;
        assert_eq!(ack, "");
        let (name, payload) = rx.recv().await.unwrap();
        assert_eq!(name, "main");
        assert_eq!(payload["port"], 5310);

        listener.dispose();
        assert!(!listener.is_listening());
        listener.dispose();
    }

    #[tokio::test]
    async fn test_timeout_delivers_sentinel_once_and_stops() {
        let listener = Arc::new(bind_local("waiter").unwrap());
        let (tx, mut rx) = mpsc::unbounded_channel();
        listener.add_callback(Arc::new(move |_: &PushListener, payload: &Value| {
            let _ = tx.send(payload.clone());
        }));
        listener
            .start_listening(Some(Duration::from_millis(200)))
            .unwrap();
        listener.join().await;

        assert_eq!(rx.recv().await.unwrap(), json!({"type": "TimeoutError"}));
        assert!(rx.try_recv().is_err());
        assert!(!listener.is_listening());
    }

    #[tokio::test]
    async fn test_stop_listening_from_callback() {
        let listener = Arc::new(bind_local("once").unwrap());
        let (tx, mut rx) = mpsc::unbounded_channel();
        listener.add_callback(Arc::new(move |l: &PushListener, payload: &Value| {
            l.stop_listening();
            l.clear_callbacks();
            let _ = tx.send(payload.clone());
        }));
        listener.start_listening(None).unwrap();

        push(listener.port(), &json!({"type": "EXECUTION_FINISHED"})).await;
        listener.join().await;
        assert_eq!(rx.recv().await.unwrap()["type"], "EXECUTION_FINISHED");
        assert!(!listener.is_listening());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_restart_while_previous_loop_is_stopping() {
        let listener = Arc::new(bind_local("rearmed").unwrap());
        let (tx, mut rx) = mpsc::unbounded_channel();
        listener.add_callback(Arc::new(move |l: &PushListener, payload: &Value| {
            l.stop_listening();
            let _ = tx.send(payload["type"].clone());
            // Keep the accept task busy so the restart sees it unfinished.
            std::thread::sleep(Duration::from_millis(300));
        }));
        listener.start_listening(None).unwrap();

        push(listener.port(), &json!({"type": "PROCESSING_STARTED"})).await;
        assert_eq!(rx.recv().await.unwrap(), "PROCESSING_STARTED");
        assert!(listener.is_listening());
        listener.start_listening(None).unwrap();

        push(listener.port(), &json!({"type": "EXECUTION_FINISHED"})).await;
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(second.unwrap(), "EXECUTION_FINISHED");
        listener.dispose();
    }

    #[tokio::test]
    async fn test_malformed_connection_does_not_end_loop() {
        use tokio::io::AsyncWriteExt;

        let listener = Arc::new(bind_local("sturdy").unwrap());
        let (tx, mut rx) = mpsc::unbounded_channel();
        listener.add_callback(Arc::new(move |_: &PushListener, payload: &Value| {
            let _ = tx.send(payload.clone());
        }));
        listener.start_listening(Some(Duration::from_secs(5))).unwrap();

        let mut raw = TcpStream::connect(("127.0.0.1", listener.port()))
            .await
            .unwrap();
        let mut header = Vec::new();
        header.extend_from_slice(&3u64.to_be_bytes());
        header.extend_from_slice(&4u64.to_be_bytes());
        raw.write_all(&header).await.unwrap();
        drop(raw);

        assert_eq!(
            push(listener.port(), &json!({"type": "SERVER_UP"})).await,
            ""
        );
        assert_eq!(rx.recv().await.unwrap()["type"], "SERVER_UP");
        assert!(listener.is_listening());

        listener.stop_listening();
        listener.join().await;
        assert!(!listener.is_listening());
    }

    #[tokio::test]
    async fn test_cleanup_discards_backlog() {
        let listener = bind_local("stale").unwrap();
        let port = listener.port();
        let sender = tokio::spawn(async move {
            push(port, &json!({"type": "EXECUTION_FINISHED"})).await;
        });
        let discarded = listener
            .cleanup_notifications(Duration::from_millis(300))
            .await
            .unwrap();
        sender.await.unwrap();
        assert_eq!(discarded, 1);
    }

    #[tokio::test]
    async fn test_specific_address_is_advertised_alone() {
        let listener = bind_local("loopback").unwrap();
        assert_eq!(
            listener.host_addresses().await,
            vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]
        );
    }

    #[tokio::test]
    async fn test_start_after_dispose_fails() {
        let listener = Arc::new(bind_local("gone").unwrap());
        listener.dispose();
        assert!(listener.is_disposed());
        assert!(matches!(
            listener.start_listening(None),
            Err(OslError::Disposed { .. })
        ));
    }
}
