//! Centralized configuration for optilink.
//!
//! This module provides configuration constants for the framed transport, push
//! listeners, request policies and the local engine process.

use std::time::Duration;

/// Session-level configuration.
pub struct ServerConfig;

impl ServerConfig {
    pub const LOCALHOST: &'static str = "127.0.0.1";
    /// Default timeout for a single attempt of a command.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_MAX_REQUEST_ATTEMPTS: u32 = 2;
    /// Engines below this major version are not fully supported.
    pub const MIN_SUPPORTED_MAJOR: u32 = 23;
    /// First major version with reliable project file commands and direct slot connections.
    pub const CURRENT_PROTOCOL_MAJOR: u32 = 24;
    pub const DEFAULT_PROJECT_FILE: &'static str = "project.opf";
    pub const PROJECT_FILE_EXTENSION: &'static str = "opf";
}

/// Push listener configuration.
pub struct ListenerConfig;

impl ListenerConfig {
    /// IANA dynamic/private port range.
    pub const PRIVATE_PORTS_RANGE: (u16, u16) = (49152, 65535);
    pub const REFRESH_INTERVAL: Duration = Duration::from_secs(10);
    /// Backlog drain budget used before a fresh wait.
    pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(1);
    pub const ACCEPT_BACKLOG: u32 = 5;
    /// Pause after a failed accept or receive before accepting again.
    pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);
}

/// Framed transport configuration.
pub struct TransportConfig;

impl TransportConfig {
    /// Chunk size for socket reads and file streaming.
    pub const BUFFER_SIZE: usize = 1024;
    /// Size of one of the two length fields in a frame header.
    pub const LENGTH_FIELD_SIZE: usize = 8;
}

/// Local engine process configuration.
pub struct ProcessConfig;

impl ProcessConfig {
    /// Time allowed for the engine to announce its port.
    pub const INI_TIMEOUT: Duration = Duration::from_secs(60);
    /// Grace period for the engine to exit on its own before it is killed.
    pub const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);
    /// Poll interval while waiting for the port announcement.
    pub const START_POLL_INTERVAL: Duration = Duration::from_millis(100);
    /// Grace period for child processes after SIGTERM.
    pub const CHILD_TERMINATE_TIMEOUT: Duration = Duration::from_secs(3);
    /// Exit code the engine uses to report a licensing failure.
    pub const LICENSING_EXIT_CODE: i32 = 11;
    /// Environment variable consulted when no executable is configured.
    pub const EXECUTABLE_ENV_VAR: &'static str = "OPTILINK_EXECUTABLE";
}
