//! The command session.
//!
//! [`OslSession`] is the single entry point for talking to an engine. It owns
//! the command client, the listener registry with its lease refresher and,
//! for a locally started engine, the process supervisor.

mod builder;
mod client;
mod interrupt;
pub mod status;
mod wait;

pub use builder::SessionBuilder;
pub use client::{check_response, CommandClient, Endpoint};
pub use interrupt::install_interrupt_handler;
pub use status::StopRequest;

use crate::config::{ProcessConfig, ServerConfig};
use crate::envelope::{commands, queries};
use crate::error::{OslError, Result};
use crate::listener::{ListenerRegistry, ListenerSlot, ServerNotification};
use crate::policy::{AttributeRegister, Operation, PolicyRegisters, RequestPolicy};
use crate::process::LocalServer;
use crate::version::{OslVersion, ProtocolLevel};
use serde_json::{Map, Value};
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// A connection to a remote or locally started engine.
pub struct OslSession {
    client: Arc<CommandClient>,
    registry: Arc<ListenerRegistry>,
    local: Mutex<Option<LocalServer>>,
    version: RwLock<Option<OslVersion>>,
    listener_host: Option<IpAddr>,
    disposed: AtomicBool,
}

impl std::fmt::Debug for OslSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OslSession")
            .field("endpoint", &self.client.endpoint())
            .field("version", &self.osl_version())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl OslSession {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    pub(crate) fn new(
        client: Arc<CommandClient>,
        registry: Arc<ListenerRegistry>,
        local: Option<LocalServer>,
        listener_host: Option<IpAddr>,
    ) -> Self {
        Self {
            client,
            registry,
            local: Mutex::new(local),
            version: RwLock::new(None),
            listener_host,
            disposed: AtomicBool::new(false),
        }
    }

    fn ensure_alive(&self, operation: &'static str) -> Result<()> {
        if self.is_disposed() {
            Err(OslError::Disposed { operation })
        } else {
            Ok(())
        }
    }

    fn password(&self) -> Option<&str> {
        self.client.password_ref()
    }

    async fn send(&self, command: &str, operation: Operation) -> Result<Value> {
        self.client
            .send_command_with(command, self.client.policy_for(operation))
            .await
    }

    pub fn host(&self) -> Option<String> {
        self.client.endpoint().map(|e| e.host)
    }

    pub fn port(&self) -> Option<u16> {
        self.client.endpoint().map(|e| e.port)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    /// Engine version cached at connect time.
    pub fn osl_version(&self) -> Option<OslVersion> {
        *self.version.read().expect("version lock poisoned")
    }

    /// Protocol level of the engine; engines of unknown version are treated as current.
    pub fn protocol(&self) -> ProtocolLevel {
        self.osl_version()
            .map(|v| v.protocol())
            .unwrap_or(ProtocolLevel::Current)
    }

    /// Current policy registers.
    pub fn policies(&self) -> PolicyRegisters {
        self.client.policies()
    }

    pub fn timeouts_register(&self) -> AttributeRegister<Option<Duration>> {
        self.client.policies().timeouts
    }

    pub fn max_request_attempts_register(&self) -> AttributeRegister<u32> {
        self.client.policies().max_request_attempts
    }

    /// Change the policy registers.
    pub fn update_policies<R>(&self, update: impl FnOnce(&mut PolicyRegisters) -> R) -> R {
        self.client.update_policies(update)
    }

    /// Set the default timeout of every operation without an override.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.client
            .update_policies(|p| p.timeouts.set_default_value(timeout))
    }

    /// Send a raw command or query under the generic policy.
    pub async fn send_command(&self, command: &str) -> Result<Value> {
        self.ensure_alive("send command")?;
        self.send(command, Operation::SendCommand).await
    }

    /// Send a raw command or query under an explicit policy.
    pub async fn send_command_with(&self, command: &str, policy: RequestPolicy) -> Result<Value> {
        self.ensure_alive("send command")?;
        self.client.send_command_with(command, policy).await
    }

    pub async fn server_info(&self) -> Result<Value> {
        self.ensure_alive("get server info")?;
        let query = queries::server_info(self.password())?;
        self.send(&query, Operation::ServerInfo).await
    }

    pub async fn server_is_alive(&self) -> Result<bool> {
        self.ensure_alive("check server")?;
        let query = queries::server_is_alive(self.password())?;
        let response = self.send(&query, Operation::ServerIsAlive).await?;
        Ok(response.get("status").and_then(Value::as_str) == Some("success"))
    }

    pub async fn basic_project_info(&self) -> Result<Value> {
        self.ensure_alive("get project info")?;
        let query = queries::basic_project_info(self.password())?;
        self.send(&query, Operation::BasicProjectInfo).await
    }

    pub async fn full_project_status_info(&self) -> Result<Value> {
        self.ensure_alive("get project status info")?;
        let query = queries::full_project_status_info(self.password())?;
        self.send(&query, Operation::FullProjectStatusInfo).await
    }

    /// State of the loaded project, or `None` if no project is loaded.
    pub async fn project_status(&self) -> Result<Option<String>> {
        let info = self.basic_project_info().await?;
        Ok(info
            .get("projects")
            .and_then(Value::as_array)
            .and_then(|projects| projects.first())
            .and_then(|project| project.get("state"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    /// Raw version string reported by the engine.
    pub async fn osl_version_string(&self) -> Result<String> {
        let info = self.server_info().await?;
        info.get("application")
            .and_then(|a| a.get("version"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| OslError::MalformedResponse("server info lacks application.version".into()))
    }

    /// Query, parse and cache the engine version.
    pub async fn refresh_version(&self) -> Result<OslVersion> {
        let version = OslVersion::parse(&self.osl_version_string().await?)?;
        if !version.is_fully_supported() {
            warn!(
                "Engine version {} is not fully supported; use version {} or newer",
                version,
                ServerConfig::MIN_SUPPORTED_MAJOR
            );
        }
        debug!("Engine version {} ({:?} protocol)", version, version.protocol());
        *self.version.write().expect("version lock poisoned") = Some(version);
        Ok(version)
    }

    fn warn_if_unsupported(&self, operation: &str) {
        if !self.protocol().supports_project_file_commands() {
            error!(
                "{} is not supported by engine version {:?}",
                operation,
                self.osl_version()
            );
        }
    }

    /// Start project execution.
    ///
    /// Nothing is sent if the project is already processing. With
    /// `wait_for_finished`, waiting for the start is implied.
    pub async fn start(&self, wait_for_started: bool, wait_for_finished: bool) -> Result<()> {
        self.ensure_alive("start")?;
        let already_running = self.project_status().await?.as_deref() == Some(status::PROCESSING);
        if already_running {
            warn!("Project is already PROCESSING, START was not sent");
        }
        let listener_timeout = self.client.policy_for(Operation::Start).timeout;

        let started = if !already_running && (wait_for_started || wait_for_finished) {
            Some(
                wait::arm(
                    &self.registry,
                    ListenerSlot::ExecStarted,
                    "started",
                    &[
                        ServerNotification::ProcessingStarted,
                        ServerNotification::NothingProcessed,
                    ],
                    self.listener_host,
                    listener_timeout,
                )
                .await?,
            )
        } else {
            None
        };
        let finished = if wait_for_finished {
            match self.arm_finished(listener_timeout).await {
                Ok(waiter) => Some(waiter),
                Err(e) => {
                    if let Some(started) = started {
                        started.cancel(&self.registry).await;
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        if !already_running {
            let sent = match commands::start(None, None, self.password()) {
                Ok(command) => self.send(&command, Operation::Start).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                if let Some(started) = started {
                    started.cancel(&self.registry).await;
                }
                if let Some(finished) = finished {
                    finished.cancel(&self.registry).await;
                }
                return Err(e);
            }
        }

        if let Some(started) = started {
            if let Err(e) = started.wait(&self.registry).await {
                if let Some(finished) = finished {
                    finished.cancel(&self.registry).await;
                }
                return Err(e);
            }
        }
        if let Some(finished) = finished {
            finished.wait(&self.registry).await?;
        }
        Ok(())
    }

    async fn arm_finished(&self, timeout: Option<Duration>) -> Result<wait::Waiter> {
        wait::arm(
            &self.registry,
            ListenerSlot::ExecFinished,
            "finished",
            &[
                ServerNotification::ExecutionFinished,
                ServerNotification::NothingProcessed,
            ],
            self.listener_host,
            timeout,
        )
        .await
    }

    /// Stop project execution.
    pub async fn stop(&self, wait_for_finished: bool) -> Result<()> {
        self.request_stop(StopRequest::Stop, wait_for_finished).await
    }

    /// Stop project execution after the designs in progress are done.
    pub async fn stop_gently(&self, wait_for_finished: bool) -> Result<()> {
        self.request_stop(StopRequest::StopGently, wait_for_finished).await
    }

    async fn request_stop(&self, request: StopRequest, wait_for_finished: bool) -> Result<()> {
        self.ensure_alive("stop")?;
        let finished = if wait_for_finished {
            let timeout = self.client.policy_for(Operation::Stop).timeout;
            Some(self.arm_finished(timeout).await?)
        } else {
            None
        };

        let status = match self.project_status().await {
            Ok(status) => status,
            Err(e) => {
                if let Some(finished) = finished {
                    finished.cancel(&self.registry).await;
                }
                return Err(e);
            }
        };

        if status::is_stopped(status.as_deref()) {
            debug!("Do not send {:?} request, project status is: {:?}", request, status);
            if let Some(finished) = finished {
                finished.cancel(&self.registry).await;
            }
            return Ok(());
        }

        if status::stop_needed(status.as_deref(), request) {
            let command = match request {
                StopRequest::Stop => commands::stop(None, None, self.password()),
                StopRequest::StopGently => commands::stop_gently(None, None, self.password()),
            };
            let sent = match command {
                Ok(command) => self.send(&command, Operation::Stop).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                if let Some(finished) = finished {
                    finished.cancel(&self.registry).await;
                }
                return Err(e);
            }
        } else {
            debug!("Do not send {:?} request, project status is: {:?}", request, status);
        }

        if let Some(finished) = finished {
            finished.wait(&self.registry).await?;
        }
        Ok(())
    }

    /// Evaluate one design synchronously and return the raw result.
    pub async fn evaluate_design(&self, parameters: &Map<String, Value>) -> Result<Value> {
        self.ensure_alive("evaluate design")?;
        let command = commands::evaluate_design(parameters, self.password())?;
        self.send(&command, Operation::EvaluateDesign).await
    }

    /// Create a new, empty project.
    pub async fn new_project(&self) -> Result<()> {
        self.ensure_alive("create project")?;
        let command = commands::new(self.password())?;
        self.send(&command, Operation::New).await?;
        Ok(())
    }

    pub async fn open(&self, path: &Path, force: bool, restore: bool, reset: bool) -> Result<()> {
        self.ensure_alive("open project")?;
        self.warn_if_unsupported("OPEN");
        let path = project_path_arg(path)?;
        let command = commands::open(&path, force, restore, reset, self.password())?;
        self.send(&command, Operation::Open).await?;
        Ok(())
    }

    pub async fn reset(&self) -> Result<()> {
        self.ensure_alive("reset project")?;
        let command = commands::reset(None, None, self.password())?;
        self.send(&command, Operation::Reset).await?;
        Ok(())
    }

    pub async fn save(&self) -> Result<()> {
        self.ensure_alive("save project")?;
        let command = commands::save(self.password())?;
        self.send(&command, Operation::Save).await?;
        Ok(())
    }

    pub async fn save_as(&self, path: &Path, force: bool, restore: bool, reset: bool) -> Result<()> {
        self.ensure_alive("save project")?;
        let path = project_path_arg(path)?;
        let command = commands::save_as(&path, force, restore, reset, self.password())?;
        self.send(&command, Operation::SaveAs).await?;
        Ok(())
    }

    pub async fn save_copy(&self, path: &Path) -> Result<()> {
        self.ensure_alive("save project copy")?;
        self.warn_if_unsupported("SAVE_COPY");
        let path = project_path_arg(path)?;
        let command = commands::save_copy(&path, self.password())?;
        self.send(&command, Operation::SaveCopy).await?;
        Ok(())
    }

    /// Tear down listeners and ask the engine to shut down.
    ///
    /// A locally started engine gets the shutdown grace period to exit. With
    /// `force` it is killed after that and a failed shutdown command is
    /// tolerated; otherwise it is left running.
    pub async fn shutdown(&self, force: bool) -> Result<()> {
        self.ensure_alive("shutdown")?;
        self.registry.dispose_all().await;

        let mut local = self.local.lock().await;
        let sent = match commands::shutdown(self.password()) {
            Ok(command) => self.send(&command, Operation::Shutdown).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            if !force || local.is_none() {
                return Err(e);
            }
            debug!("Shutdown command failed, forcing local engine down: {}", e);
        }

        if force {
            if let Some(server) = local.as_mut() {
                server.shutdown_process().await?;
            }
            *local = None;
        } else if let Some(server) = local.take() {
            match server.release(ProcessConfig::SHUTDOWN_WAIT).await {
                Ok(Some(status)) => debug!("Local engine exited with {}", status),
                Ok(None) => {}
                Err(e) => warn!("Cannot wait for local engine: {}", e),
            }
        }
        self.client.set_endpoint(None);
        self.disposed.store(true, Ordering::SeqCst);
        info!("Session shut down");
        Ok(())
    }

    /// Stop the refresher, release every listener and let a locally started
    /// engine go. Idempotent; failures are logged.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.registry.dispose_all().await;
        if let Some(mut server) = self.local.lock().await.take() {
            if let Err(e) = server.shutdown_process().await {
                warn!("Cannot terminate local engine: {}", e);
            }
        }
        info!("Session disposed");
    }
}

/// Project file argument; must name an `.opf` file.
fn project_path_arg(path: &Path) -> Result<String> {
    if path.extension().and_then(|e| e.to_str()) != Some(ServerConfig::PROJECT_FILE_EXTENSION) {
        return Err(OslError::validation(
            "path",
            format!("Invalid project file: {}", path.display()),
        ));
    }
    Ok(path.display().to_string())
}
