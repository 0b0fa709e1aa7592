//! Local engine supervisor.
//!
//! ```text
//! NotStarted -> Starting -> Running -> ShuttingDown -> Terminated
//! ```
//!
//! The supervisor is the only owner of the engine process handle.

use super::launcher::{EngineProcess, LaunchConfig, MultiListenerTarget};
use crate::config::{ListenerConfig, ProcessConfig, ServerConfig};
use crate::error::{OslError, Result};
use crate::listener::{PushListener, ServerNotification};
use serde_json::Value;
use std::net::IpAddr;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Lifecycle state of the local engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    NotStarted,
    Starting,
    Running,
    ShuttingDown,
    Terminated,
}

/// Result of a successful local start.
#[derive(Debug, Clone)]
pub struct StartedServer {
    /// Port the engine announced.
    pub port: u16,
    /// Listener that received the announcement, kept as the session's main listener.
    pub listener: Arc<PushListener>,
}

/// Launches and owns a local engine process.
#[derive(Debug)]
pub struct LocalServer {
    process: EngineProcess,
    state: ServerState,
    port: Option<u16>,
}

impl LocalServer {
    pub fn new(config: LaunchConfig) -> Result<Self> {
        Ok(Self {
            process: EngineProcess::new(config)?,
            state: ServerState::NotStarted,
            port: None,
        })
    }

    /// Wrap an already started engine listening on `port`.
    #[cfg(test)]
    pub(crate) fn running(process: EngineProcess, port: u16) -> Self {
        Self {
            process,
            state: ServerState::Running,
            port: Some(port),
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn process(&self) -> &EngineProcess {
        &self.process
    }

    pub fn is_running(&mut self) -> bool {
        self.process.is_running()
    }

    /// Launch the engine and wait up to `ini_timeout` for its port.
    ///
    /// A main listener is bound and advertised to the engine on the command
    /// line under `listener_uid`. The engine reports its port to that listener
    /// once its server is up. An engine that exits first is a start failure;
    /// exit code 11 marks a licensing failure.
    pub async fn start(
        &mut self,
        ini_timeout: Option<Duration>,
        listener_uid: &str,
        extra_listeners: &[MultiListenerTarget],
    ) -> Result<StartedServer> {
        if self.state != ServerState::NotStarted {
            return Err(OslError::AlreadyStarted);
        }

        let host: IpAddr = ServerConfig::LOCALHOST
            .parse()
            .map_err(|e: std::net::AddrParseError| OslError::validation("host", e.to_string()))?;
        let notifications = vec![ServerNotification::ServerUp, ServerNotification::ServerDown];
        let listener = Arc::new(
            PushListener::bind("Main", Some(host), ListenerConfig::PRIVATE_PORTS_RANGE)?
                .with_notifications(notifications.clone())
                .with_lease_timeout(self.process.config().listeners_default_timeout_ms),
        );

        let (port_tx, mut port_rx) = mpsc::unbounded_channel::<u16>();
        listener.add_callback(Arc::new(move |listener: &PushListener, payload: &Value| {
            if let Some(port) = payload
                .get("port")
                .and_then(Value::as_u64)
                .and_then(|p| u16::try_from(p).ok())
            {
                listener.stop_listening();
                listener.clear_callbacks();
                let _ = port_tx.send(port);
            }
        }));
        listener.start_listening(ini_timeout)?;

        let config = self.process.config_mut();
        config.multi_listener = extra_listeners.to_vec();
        config
            .multi_listener
            .extend(listener.host_addresses().await.into_iter().map(|address| {
                MultiListenerTarget {
                    host: address.to_string(),
                    port: listener.port(),
                    uid: listener_uid.to_string(),
                }
            }));
        if config.notifications.is_none() {
            config.notifications = Some(notifications);
        }

        self.state = ServerState::Starting;
        if let Err(e) = self.process.start().await {
            listener.dispose();
            self.state = ServerState::Terminated;
            return Err(e);
        }

        match self.wait_for_port(&listener, &mut port_rx).await {
            Ok(Some(port)) => {
                info!("Local engine listening on port {}", port);
                listener.set_uid(Some(listener_uid.to_string()));
                self.port = Some(port);
                self.state = ServerState::Running;
                Ok(StartedServer { port, listener })
            }
            Ok(None) => {
                warn!("Local engine did not announce its port in time");
                listener.dispose();
                if let Err(e) = self.process.terminate().await {
                    warn!("Cannot terminate engine process: {}", e);
                }
                self.state = ServerState::Terminated;
                Err(OslError::StartTimedOut)
            }
            Err(e) => {
                listener.dispose();
                if let Err(e) = self.process.terminate().await {
                    debug!("Cleanup after failed start: {}", e);
                }
                self.state = ServerState::Terminated;
                Err(e)
            }
        }
    }

    async fn wait_for_port(
        &mut self,
        listener: &PushListener,
        port_rx: &mut mpsc::UnboundedReceiver<u16>,
    ) -> Result<Option<u16>> {
        loop {
            if let Ok(port) = port_rx.try_recv() {
                return Ok(Some(port));
            }
            if let Some(status) = self.process.try_exit_status()? {
                return Err(match status.code() {
                    Some(ProcessConfig::LICENSING_EXIT_CODE) => OslError::Licensing {
                        exit_code: ProcessConfig::LICENSING_EXIT_CODE,
                    },
                    exit_code => OslError::ServerStart {
                        exit_code,
                        message: "engine exited before announcing its port".to_string(),
                    },
                });
            }
            if !listener.is_listening() {
                return Ok(port_rx.try_recv().ok());
            }
            tokio::time::sleep(ProcessConfig::START_POLL_INTERVAL).await;
        }
    }

    /// Give the engine up to the shutdown grace period to exit on its own,
    /// then terminate it.
    pub async fn shutdown_process(&mut self) -> Result<()> {
        if matches!(self.state, ServerState::NotStarted | ServerState::Terminated) {
            return Ok(());
        }
        self.state = ServerState::ShuttingDown;

        let status = self
            .process
            .wait_for_finished(Some(ProcessConfig::SHUTDOWN_WAIT))
            .await?;
        match status {
            Some(status) => debug!("Engine process exited with {}", status),
            None => debug!(
                "Engine process still running after {:?}",
                ProcessConfig::SHUTDOWN_WAIT
            ),
        }
        let result = self.process.terminate().await;
        self.state = ServerState::Terminated;
        self.port = None;
        result
    }

    /// Wait up to `grace` for the engine to exit on its own, without killing it.
    ///
    /// Returns the exit status, or `None` if the engine is still running; it
    /// is then left to finish in the background.
    pub async fn release(mut self, grace: Duration) -> Result<Option<ExitStatus>> {
        if matches!(self.state, ServerState::NotStarted | ServerState::Terminated) {
            return Ok(None);
        }
        self.state = ServerState::ShuttingDown;

        match self.process.wait_for_finished(Some(grace)).await? {
            Some(status) => {
                debug!("Engine process exited with {}", status);
                self.process.terminate().await?;
                self.state = ServerState::Terminated;
                Ok(Some(status))
            }
            None => {
                info!("Engine process still running after {:?}, leaving it", grace);
                self.process.detach();
                Ok(None)
            }
        }
    }

    /// Terminate the engine immediately.
    pub async fn terminate(&mut self) -> Result<()> {
        if self.state == ServerState::Terminated {
            return Ok(());
        }
        let result = self.process.terminate().await;
        self.state = ServerState::Terminated;
        self.port = None;
        result
    }
}
