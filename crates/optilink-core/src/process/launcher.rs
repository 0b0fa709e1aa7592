//! Engine process launching.

use crate::config::{ProcessConfig, ServerConfig};
use crate::error::{OslError, Result};
use crate::listener::ServerNotification;
use crate::platform;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A listener the engine should push notifications to from its first moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiListenerTarget {
    pub host: String,
    pub port: u16,
    pub uid: String,
}

impl MultiListenerTarget {
    fn to_arg(&self) -> String {
        format!("--register-multi-listener={}:{}:{}", self.host, self.port, self.uid)
    }
}

/// Configuration for launching a local engine.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Engine executable.
    pub executable: PathBuf,
    /// Project file. `None` creates a new project in a temporary directory.
    pub project_path: Option<PathBuf>,
    /// Batch mode (`-b`) instead of service mode.
    pub batch: bool,
    /// Port range the engine server may pick its port from.
    pub port_range: Option<(u16, u16)>,
    pub password: Option<String>,
    /// Do not run the project on open (batch mode only).
    pub no_run: bool,
    /// Process incomplete or damaged projects (batch mode only).
    pub force: bool,
    pub reset: bool,
    pub auto_relocate: bool,
    pub no_save: bool,
    pub server_info: Option<PathBuf>,
    pub log_server_events: bool,
    pub multi_listener: Vec<MultiListenerTarget>,
    /// Lease timeout the engine applies to listeners registered at start (ms).
    pub listeners_default_timeout_ms: Option<u32>,
    pub notifications: Option<Vec<ServerNotification>>,
    pub import_project_properties: Option<PathBuf>,
    pub export_project_properties: Option<PathBuf>,
    pub import_placeholders: Option<PathBuf>,
    pub export_placeholders: Option<PathBuf>,
    pub output_file: Option<PathBuf>,
    pub dump_project_state: Option<PathBuf>,
    pub opx_project_definition_file: Option<PathBuf>,
    pub additional_args: Vec<String>,
    pub shutdown_on_finished: bool,
    /// Extra environment variables on top of the inherited environment.
    pub env_vars: HashMap<String, String>,
    pub log_process_stdout: bool,
    pub log_process_stderr: bool,
    /// Remove `.ini` server information files next to the project before start.
    pub remove_ini_files: bool,
}

impl LaunchConfig {
    pub fn new(executable: impl AsRef<Path>) -> Self {
        Self {
            executable: executable.as_ref().to_path_buf(),
            project_path: None,
            batch: true,
            port_range: None,
            password: None,
            no_run: true,
            force: true,
            reset: false,
            auto_relocate: false,
            no_save: false,
            server_info: None,
            log_server_events: false,
            multi_listener: Vec::new(),
            listeners_default_timeout_ms: None,
            notifications: None,
            import_project_properties: None,
            export_project_properties: None,
            import_placeholders: None,
            export_placeholders: None,
            output_file: None,
            dump_project_state: None,
            opx_project_definition_file: None,
            additional_args: Vec::new(),
            shutdown_on_finished: true,
            env_vars: HashMap::new(),
            log_process_stdout: true,
            log_process_stderr: true,
            remove_ini_files: true,
        }
    }

    /// Use the executable named by `OPTILINK_EXECUTABLE`.
    pub fn from_env() -> Result<Self> {
        let executable = std::env::var_os(ProcessConfig::EXECUTABLE_ENV_VAR).ok_or_else(|| {
            OslError::validation(
                "executable",
                format!(
                    "No engine executable given and {} is not set",
                    ProcessConfig::EXECUTABLE_ENV_VAR
                ),
            )
        })?;
        Ok(Self::new(PathBuf::from(executable)))
    }

    pub fn with_project(mut self, path: impl AsRef<Path>) -> Self {
        self.project_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    pub fn with_multi_listener(mut self, target: MultiListenerTarget) -> Self {
        self.multi_listener.push(target);
        self
    }

    /// Command line arguments for a project at `project_path`.
    pub fn args(&self, project_path: &Path) -> Vec<String> {
        let mut args = Vec::new();

        if self.batch {
            args.push("-b".to_string());
        } else {
            args.push("--service".to_string());
        }

        if project_path.is_file() {
            args.push(project_path.display().to_string());
        } else {
            args.push(format!("--new={}", project_path.display()));
        }

        if self.batch {
            if self.no_run {
                args.push("--no-run".to_string());
            }
            if self.force {
                args.push("--force".to_string());
            }
        }
        if self.reset {
            args.push("--reset".to_string());
        }
        if self.auto_relocate {
            args.push("--autorelocate".to_string());
        }

        match self.port_range {
            Some((first, last)) => args.push(format!("--enable-tcp-server={}-{}", first, last)),
            None => args.push("--enable-tcp-server".to_string()),
        }
        if let Some(password) = &self.password {
            args.push(format!("--server-password={}", password));
        }
        if let Some(server_info) = &self.server_info {
            args.push(format!("--write-server-info={}", server_info.display()));
        }
        if self.no_save {
            args.push("--no-save".to_string());
        }
        if self.log_server_events {
            args.push("--log-server-events".to_string());
        }

        args.extend(self.multi_listener.iter().map(MultiListenerTarget::to_arg));
        if let Some(timeout) = self.listeners_default_timeout_ms {
            args.push(format!("--listeners-default-timeout={}", timeout));
        }
        if let Some(notifications) = &self.notifications {
            args.push("--enable-notifications".to_string());
            args.extend(notifications.iter().map(|n| n.as_str().to_string()));
        }

        let paths = [
            ("--import-project-properties", &self.import_project_properties),
            ("--export-project-properties", &self.export_project_properties),
            ("--import-placeholders", &self.import_placeholders),
            ("--export-placeholders", &self.export_placeholders),
            ("--output-file", &self.output_file),
            ("--dump-project-state", &self.dump_project_state),
            ("--import-opx", &self.opx_project_definition_file),
        ];
        for (flag, path) in paths {
            if let Some(path) = path {
                args.push(format!("{}={}", flag, path.display()));
            }
        }

        args.extend(self.additional_args.iter().cloned());

        if self.shutdown_on_finished {
            args.push("--shutdown-on-finished".to_string());
        }
        args
    }
}

/// A local engine child process.
///
/// Owns the OS handle, the output forwarding tasks and, when no project was
/// given, the temporary project directory.
#[derive(Debug)]
pub struct EngineProcess {
    config: LaunchConfig,
    project_path: PathBuf,
    tempdir: Option<TempDir>,
    child: Option<Child>,
    output_tasks: Vec<JoinHandle<()>>,
}

impl EngineProcess {
    /// Validate `config` and resolve the project path.
    pub fn new(config: LaunchConfig) -> Result<Self> {
        if !config.executable.is_file() {
            return Err(OslError::FileNotFound(config.executable.clone()));
        }

        let (project_path, tempdir) = match &config.project_path {
            Some(path) => (path.clone(), None),
            None => {
                let tempdir = tempfile::Builder::new().prefix("optilink-").tempdir()?;
                (tempdir.path().join(ServerConfig::DEFAULT_PROJECT_FILE), Some(tempdir))
            }
        };
        if project_path.extension().and_then(|e| e.to_str())
            != Some(ServerConfig::PROJECT_FILE_EXTENSION)
        {
            return Err(OslError::validation(
                "project_path",
                format!("Invalid project file: {}", project_path.display()),
            ));
        }

        Ok(Self {
            config,
            project_path,
            tempdir,
            child: None,
            output_tasks: Vec::new(),
        })
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut LaunchConfig {
        &mut self.config
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    pub fn args(&self) -> Vec<String> {
        self.config.args(&self.project_path)
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Launch the engine.
    pub async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(OslError::AlreadyStarted);
        }
        if self.config.remove_ini_files {
            self.remove_server_info_files().await;
        }

        let args = self.args();
        let mut command = Command::new(&self.config.executable);
        command
            .args(&args)
            .envs(&self.config.env_vars)
            .env_remove("LD_LIBRARY_PATH")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!("Executing {} {:?}", self.config.executable.display(), args);
        let mut child = command
            .spawn()
            .map_err(|e| OslError::io_with_path(e, &self.config.executable))?;
        info!("Engine process started with PID {:?}", child.id());

        if let Some(stdout) = child.stdout.take() {
            let enabled = self.config.log_process_stdout;
            self.output_tasks
                .push(tokio::spawn(forward_output(stdout, "stdout", enabled)));
        }
        if let Some(stderr) = child.stderr.take() {
            let enabled = self.config.log_process_stderr;
            self.output_tasks
                .push(tokio::spawn(forward_output(stderr, "stderr", enabled)));
        }
        self.child = Some(child);
        Ok(())
    }

    /// Exit status, if the process has exited.
    pub fn try_exit_status(&mut self) -> Result<Option<ExitStatus>> {
        match self.child.as_mut() {
            Some(child) => Ok(child.try_wait()?),
            None => Ok(None),
        }
    }

    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Wait for the process to exit, returning `None` if `timeout` expires first.
    pub async fn wait_for_finished(&mut self, timeout: Option<Duration>) -> Result<Option<ExitStatus>> {
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };
        match timeout {
            None => Ok(Some(child.wait().await?)),
            Some(timeout) => match tokio::time::timeout(timeout, child.wait()).await {
                Ok(status) => Ok(Some(status?)),
                Err(_) => Ok(None),
            },
        }
    }

    /// Terminate helper processes, then the engine itself.
    ///
    /// The engine gets a termination request first and is killed if it is
    /// still running after the grace period.
    pub async fn terminate(&mut self) -> Result<()> {
        if let Some(pid) = self.pid() {
            let helpers = platform::descendant_pids(pid);
            if !helpers.is_empty() {
                let survivors =
                    platform::terminate_processes(&helpers, ProcessConfig::CHILD_TERMINATE_TIMEOUT)
                        .await;
                if !survivors.is_empty() {
                    warn!("Engine helper processes survived termination: {:?}", survivors);
                }
            }

            if self.is_running() {
                platform::request_termination(pid)?;
                let status = self
                    .wait_for_finished(Some(ProcessConfig::CHILD_TERMINATE_TIMEOUT))
                    .await?;
                if status.is_none() {
                    if let Some(child) = self.child.as_mut() {
                        debug!("Engine process {} still running, killing it", pid);
                        child.kill().await?;
                    }
                }
            }
            info!("Engine process {} terminated", pid);
        }

        for task in self.output_tasks.drain(..) {
            let _ = task.await;
        }
        self.tempdir = None;
        Ok(())
    }

    /// Give up the handle and leave the engine running.
    ///
    /// Output forwarding continues while the runtime lives, and a temporary
    /// project directory is kept on disk for the engine.
    pub fn detach(mut self) {
        if let Some(tempdir) = self.tempdir.take() {
            let path = tempdir.into_path();
            debug!("Keeping project directory {}", path.display());
        }
        match self.pid() {
            Some(pid) => info!("Engine process {} left running", pid),
            None => debug!("Detached engine process has already exited"),
        }
    }

    async fn remove_server_info_files(&self) {
        let Some(dir) = self.project_path.parent() else {
            return;
        };
        let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("ini") {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => info!("Removed server information file {}", path.display()),
                    Err(e) => warn!("Cannot remove {}: {}", path.display(), e),
                }
            }
        }
    }
}

async fn forward_output<R>(stream: R, name: &'static str, enabled: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if enabled => {
                if name == "stderr" {
                    warn!("engine {}: {}", name, line);
                } else {
                    debug!("engine {}: {}", name, line);
                }
            }
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(e) => {
                debug!("engine {} closed: {}", name, e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LaunchConfig {
        LaunchConfig::new("/opt/engine/bin/engine")
    }

    #[test]
    fn test_batch_args_for_new_project() {
        let args = config().args(Path::new("/nonexistent/p.opf"));
        assert_eq!(
            args,
            vec![
                "-b",
                "--new=/nonexistent/p.opf",
                "--no-run",
                "--force",
                "--enable-tcp-server",
                "--shutdown-on-finished",
            ]
        );
    }

    #[test]
    fn test_listener_and_notification_args() {
        let mut config = config().with_multi_listener(MultiListenerTarget {
            host: "127.0.0.1".into(),
            port: 50001,
            uid: "main-uid".into(),
        });
        config.batch = false;
        config.port_range = Some((5310, 5320));
        config.password = Some("pw".into());
        config.listeners_default_timeout_ms = Some(60_000);
        config.notifications = Some(vec![
            ServerNotification::ServerUp,
            ServerNotification::ServerDown,
        ]);
        config.shutdown_on_finished = false;
        config.additional_args = vec!["--custom=1".into()];

        let args = config.args(Path::new("/nonexistent/p.opf"));
        assert_eq!(args[0], "--service");
        assert!(!args.contains(&"--no-run".to_string()));
        assert!(args.contains(&"--enable-tcp-server=5310-5320".to_string()));
        assert!(args.contains(&"--server-password=pw".to_string()));
        assert!(args.contains(&"--register-multi-listener=127.0.0.1:50001:main-uid".to_string()));
        assert!(args.contains(&"--listeners-default-timeout=60000".to_string()));
        let at = args.iter().position(|a| a == "--enable-notifications").unwrap();
        assert_eq!(&args[at + 1..at + 3], &["SERVER_UP", "SERVER_DOWN"]);
        assert_eq!(args.last().unwrap(), "--custom=1");
    }

    #[test]
    fn test_existing_project_is_opened() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("existing.opf");
        std::fs::write(&project, b"").unwrap();
        let args = config().args(&project);
        assert_eq!(args[1], project.display().to_string());
    }

    #[test]
    fn test_missing_executable_rejected() {
        let result = EngineProcess::new(config());
        assert!(matches!(result, Err(OslError::FileNotFound(_))));
    }

    #[test]
    fn test_default_project_lives_in_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("engine");
        std::fs::write(&exe, b"").unwrap();
        let process = EngineProcess::new(LaunchConfig::new(&exe)).unwrap();
        assert!(process.project_path().ends_with(ServerConfig::DEFAULT_PROJECT_FILE));
        assert!(process.project_path().parent().unwrap().is_dir());
    }

    #[test]
    fn test_project_must_be_opf() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("engine");
        std::fs::write(&exe, b"").unwrap();
        let result = EngineProcess::new(LaunchConfig::new(&exe).with_project(dir.path().join("p.txt")));
        assert!(matches!(result, Err(OslError::Validation { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_wait_and_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("engine.sh");
        std::fs::write(&exe, "#!/bin/sh\necho started\nexit 3\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut process = EngineProcess::new(LaunchConfig::new(&exe)).unwrap();
        process.start().await.unwrap();
        assert!(process.pid().is_some());
        let status = process
            .wait_for_finished(Some(Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.code(), Some(3));
        assert!(!process.is_running());
        process.terminate().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dropped_handle_does_not_kill_engine() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("saved");
        let exe = dir.path().join("engine.sh");
        std::fs::write(
            &exe,
            format!("#!/bin/sh
sleep 1
echo ok > {}
", marker.display()),
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut process =
            EngineProcess::new(LaunchConfig::new(&exe).with_project(dir.path().join("p.opf")))
                .unwrap();
        process.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(process);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(marker.exists());
    }
}
