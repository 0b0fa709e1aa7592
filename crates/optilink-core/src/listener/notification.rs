//! Push notification vocabulary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of event the engine pushes to a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerNotification {
    ServerUp,
    ServerDown,
    LogInfo,
    LogWarning,
    LogError,
    LogDebug,
    ExecutionStarted,
    ProcessingStarted,
    ExecutionFinished,
    NothingProcessed,
    CheckFailed,
    ExecFailed,
    ActorStateChanged,
    ActorActiveChanged,
    ActorNameChanged,
    ActorContentsChanged,
    ActorDataChanged,
    All,
}

impl ServerNotification {
    pub const VALUES: [ServerNotification; 18] = [
        Self::ServerUp,
        Self::ServerDown,
        Self::LogInfo,
        Self::LogWarning,
        Self::LogError,
        Self::LogDebug,
        Self::ExecutionStarted,
        Self::ProcessingStarted,
        Self::ExecutionFinished,
        Self::NothingProcessed,
        Self::CheckFailed,
        Self::ExecFailed,
        Self::ActorStateChanged,
        Self::ActorActiveChanged,
        Self::ActorNameChanged,
        Self::ActorContentsChanged,
        Self::ActorDataChanged,
        Self::All,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServerUp => "SERVER_UP",
            Self::ServerDown => "SERVER_DOWN",
            Self::LogInfo => "LOG_INFO",
            Self::LogWarning => "LOG_WARNING",
            Self::LogError => "LOG_ERROR",
            Self::LogDebug => "LOG_DEBUG",
            Self::ExecutionStarted => "EXECUTION_STARTED",
            Self::ProcessingStarted => "PROCESSING_STARTED",
            Self::ExecutionFinished => "EXECUTION_FINISHED",
            Self::NothingProcessed => "NOTHING_PROCESSED",
            Self::CheckFailed => "CHECK_FAILED",
            Self::ExecFailed => "EXEC_FAILED",
            Self::ActorStateChanged => "ACTOR_STATE_CHANGED",
            Self::ActorActiveChanged => "ACTOR_ACTIVE_CHANGED",
            Self::ActorNameChanged => "ACTOR_NAME_CHANGED",
            Self::ActorContentsChanged => "ACTOR_CONTENTS_CHANGED",
            Self::ActorDataChanged => "ACTOR_DATA_CHANGED",
            Self::All => "ALL",
        }
    }

    /// Whether this notification reports a failed execution.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::ExecFailed | Self::CheckFailed)
    }
}

impl fmt::Display for ServerNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerNotification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::VALUES
            .iter()
            .copied()
            .find(|n| n.as_str() == s)
            .ok_or_else(|| format!("Unknown server notification: {}", s))
    }
}

/// Kind carried in the `type` field of a pushed payload.
///
/// Besides the engine vocabulary, a listener synthesizes `TimeoutError` when
/// its overall timeout expires without a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushKind {
    Notification(ServerNotification),
    Timeout,
    Unknown(String),
}

pub const TIMEOUT_ERROR_TYPE: &str = "TimeoutError";

impl PushKind {
    pub fn of(payload: &serde_json::Value) -> Self {
        match payload.get("type").and_then(|t| t.as_str()) {
            Some(TIMEOUT_ERROR_TYPE) => Self::Timeout,
            Some(name) => name
                .parse()
                .map(Self::Notification)
                .unwrap_or_else(|_| Self::Unknown(name.to_string())),
            None => Self::Unknown(String::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_string_roundtrip_for_all_values() {
        for value in ServerNotification::VALUES {
            assert_eq!(value.as_str().parse::<ServerNotification>().unwrap(), value);
            let encoded = serde_json::to_value(value).unwrap();
            assert_eq!(encoded, json!(value.as_str()));
        }
    }

    #[test]
    fn test_unknown_name() {
        assert!("SERVER_SIDEWAYS".parse::<ServerNotification>().is_err());
    }

    #[test]
    fn test_push_kind() {
        assert_eq!(
            PushKind::of(&json!({"type": "EXECUTION_FINISHED"})),
            PushKind::Notification(ServerNotification::ExecutionFinished)
        );
        assert_eq!(PushKind::of(&json!({"type": "TimeoutError"})), PushKind::Timeout);
        assert_eq!(
            PushKind::of(&json!({"type": "SOMETHING_NEW"})),
            PushKind::Unknown("SOMETHING_NEW".into())
        );
        assert!(ServerNotification::ExecFailed.is_failure());
        assert!(!ServerNotification::NothingProcessed.is_failure());
    }
}
