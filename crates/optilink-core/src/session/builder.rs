//! Builder for opening an [`OslSession`].

use super::client::{CommandClient, Endpoint};
use super::OslSession;
use crate::config::{ListenerConfig, ProcessConfig, ServerConfig};
use crate::error::{OslError, Result};
use crate::listener::{CommandChannel, ListenerRegistry, ListenerSlot, PushListener, ServerNotification};
use crate::policy::PolicyRegisters;
use crate::process::{LaunchConfig, LocalServer, MultiListenerTarget};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Builder for connecting to an engine.
///
/// With both `host` and `port` the session attaches to a running engine.
/// Without either, a local engine is launched and the session owns it.
///
/// # Example
///
/// ```rust,ignore
/// use optilink_core::OslSession;
///
/// let session = OslSession::builder()
///     .executable("/opt/engine/bin/engine")
///     .project("/work/study.opf")
///     .password("secret")
///     .connect()
///     .await?;
/// session.start(true, true).await?;
/// session.dispose().await;
/// ```
pub struct SessionBuilder {
    host: Option<String>,
    port: Option<u16>,
    executable: Option<PathBuf>,
    launch: LaunchConfig,
    password: Option<String>,
    listener_id: Option<String>,
    listener_host: Option<IpAddr>,
    refresh_interval: Duration,
    ini_timeout: Option<Duration>,
    policies: PolicyRegisters,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            host: None,
            port: None,
            executable: None,
            launch: LaunchConfig::new(PathBuf::new()),
            password: None,
            listener_id: None,
            listener_host: None,
            refresh_interval: ListenerConfig::REFRESH_INTERVAL,
            ini_timeout: Some(ProcessConfig::INI_TIMEOUT),
            policies: PolicyRegisters::with_defaults(),
        }
    }

    /// Host of a running engine. Requires [`port`](Self::port).
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Port of a running engine. Requires [`host`](Self::host).
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Engine executable for a local start.
    ///
    /// Default: the `OPTILINK_EXECUTABLE` environment variable.
    pub fn executable(mut self, executable: impl AsRef<Path>) -> Self {
        self.executable = Some(executable.as_ref().to_path_buf());
        self
    }

    /// Project opened by a locally started engine. Default: a new project in
    /// a temporary directory.
    pub fn project(mut self, path: impl AsRef<Path>) -> Self {
        self.launch.project_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Batch mode when `true` (default), service mode otherwise.
    pub fn batch(mut self, batch: bool) -> Self {
        self.launch.batch = batch;
        self
    }

    /// Port range the local engine may choose its server port from.
    pub fn port_range(mut self, first: u16, last: u16) -> Self {
        self.launch.port_range = Some((first, last));
        self
    }

    pub fn no_run(mut self, no_run: bool) -> Self {
        self.launch.no_run = no_run;
        self
    }

    pub fn no_save(mut self, no_save: bool) -> Self {
        self.launch.no_save = no_save;
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.launch.force = force;
        self
    }

    pub fn reset(mut self, reset: bool) -> Self {
        self.launch.reset = reset;
        self
    }

    pub fn auto_relocate(mut self, auto_relocate: bool) -> Self {
        self.launch.auto_relocate = auto_relocate;
        self
    }

    pub fn shutdown_on_finished(mut self, shutdown_on_finished: bool) -> Self {
        self.launch.shutdown_on_finished = shutdown_on_finished;
        self
    }

    /// Uid requested for every listener this session registers.
    pub fn listener_id(mut self, listener_id: impl Into<String>) -> Self {
        self.listener_id = Some(listener_id.into());
        self
    }

    /// Local address push listeners bind to.
    ///
    /// Default: `127.0.0.1` for a local engine, all interfaces otherwise.
    pub fn listener_host(mut self, host: IpAddr) -> Self {
        self.listener_host = Some(host);
        self
    }

    /// Additional listener the local engine pushes to from its first moment.
    pub fn multi_listener(mut self, target: MultiListenerTarget) -> Self {
        self.launch.multi_listener.push(target);
        self
    }

    /// Interval of the lease refresher. Default: 10 s.
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Lease timeout requested for listeners without their own (ms).
    pub fn listeners_default_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.launch.listeners_default_timeout_ms = Some(timeout_ms);
        self
    }

    /// Time allowed for a local engine to announce its port. Default: 60 s.
    pub fn ini_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ini_timeout = timeout;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.launch.env_vars.insert(key.into(), value.into());
        self
    }

    pub fn additional_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.launch.additional_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adjust less common launch options such as import/export files.
    pub fn configure_launch(mut self, configure: impl FnOnce(&mut LaunchConfig)) -> Self {
        configure(&mut self.launch);
        self
    }

    /// Request policies used from the first command on.
    pub fn policies(mut self, policies: PolicyRegisters) -> Self {
        self.policies = policies;
        self
    }

    /// Attach to the configured engine, or launch a local one.
    pub async fn connect(self) -> Result<OslSession> {
        match (self.host.clone(), self.port) {
            (Some(host), Some(port)) => self.connect_remote(host, port).await,
            (None, None) => self.start_local().await,
            _ => Err(OslError::validation(
                "host",
                "host and port must be given together",
            )),
        }
    }

    fn registry(&self, client: &Arc<CommandClient>) -> Arc<ListenerRegistry> {
        let channel: Arc<dyn CommandChannel> = client.clone();
        Arc::new(ListenerRegistry::new(
            channel,
            self.listener_id.clone(),
            self.launch.listeners_default_timeout_ms,
            self.refresh_interval,
        ))
    }

    async fn connect_remote(self, host: String, port: u16) -> Result<OslSession> {
        let client = Arc::new(CommandClient::new(
            Some(Endpoint { host, port }),
            self.password.clone(),
            self.policies.clone(),
        ));
        let registry = self.registry(&client);
        let session = OslSession::new(client, registry.clone(), None, self.listener_host);

        let version = session.refresh_version().await?;
        info!("Connected to engine {} at {}:{}", version, session.host().unwrap_or_default(), port);

        let listener = Arc::new(
            PushListener::bind("Main", self.listener_host, ListenerConfig::PRIVATE_PORTS_RANGE)?
                .with_notifications(vec![ServerNotification::ServerUp, ServerNotification::ServerDown])
                .with_lease_timeout(self.launch.listeners_default_timeout_ms),
        );
        registry.insert(ListenerSlot::Main, listener.clone());
        if let Err(e) = registry.register(&listener, None).await {
            session.dispose().await;
            return Err(e);
        }
        listener.set_refresh(true);
        listener.start_listening(None)?;
        registry.start_refresher();
        Ok(session)
    }

    async fn start_local(self) -> Result<OslSession> {
        let mut launch = self.launch.clone();
        launch.executable = match &self.executable {
            Some(executable) => executable.clone(),
            None => LaunchConfig::from_env()?.executable,
        };
        launch.password = self.password.clone();
        let mut server = LocalServer::new(launch)?;

        let client = Arc::new(CommandClient::new(
            None,
            self.password.clone(),
            self.policies.clone(),
        ));
        let registry = self.registry(&client);
        let listener_uid = self
            .listener_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let extra_listeners = server.process().config().multi_listener.clone();
        let started = server
            .start(self.ini_timeout, &listener_uid, &extra_listeners)
            .await?;
        client.set_endpoint(Some(Endpoint {
            host: ServerConfig::LOCALHOST.to_string(),
            port: started.port,
        }));

        let listener_host = self
            .listener_host
            .or(Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        let session = OslSession::new(client, registry.clone(), Some(server), listener_host);

        let listener = started.listener;
        listener.set_refresh(true);
        registry.insert(ListenerSlot::Main, listener.clone());
        if let Err(e) = listener.start_listening(None) {
            session.dispose().await;
            return Err(e);
        }
        registry.start_refresher();

        match session.refresh_version().await {
            Ok(version) => info!("Local engine {} running on port {}", version, started.port),
            Err(e) => {
                warn!("Cannot query local engine version: {}", e);
                session.dispose().await;
                return Err(e);
            }
        }
        Ok(session)
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
