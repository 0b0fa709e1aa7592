//! Engine version parsing and protocol gating.

use crate::config::ServerConfig;
use crate::error::{OslError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

// MAJOR.MINOR.MAINT, free text, then the revision in parentheses
static VERSION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\.(\d+)\.(\d+).*\((\d+)M?\)$").expect("version pattern is valid")
});

/// Engine version as reported by the `SERVER_INFO` query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OslVersion {
    pub major: u32,
    pub minor: u32,
    pub maintenance: u32,
    pub revision: u32,
}

impl OslVersion {
    /// Parse strings such as `"24.1.0 (12345M)"`.
    pub fn parse(version: &str) -> Result<Self> {
        let captures = VERSION_PATTERN
            .captures(version.trim())
            .ok_or_else(|| OslError::InvalidVersion(version.to_string()))?;

        let field = |index: usize| -> Result<u32> {
            captures[index]
                .parse()
                .map_err(|_| OslError::InvalidVersion(version.to_string()))
        };

        Ok(Self {
            major: field(1)?,
            minor: field(2)?,
            maintenance: field(3)?,
            revision: field(4)?,
        })
    }

    pub fn as_tuple(&self) -> (u32, u32, u32, u32) {
        (self.major, self.minor, self.maintenance, self.revision)
    }

    pub fn protocol(&self) -> ProtocolLevel {
        if self.major >= ServerConfig::CURRENT_PROTOCOL_MAJOR {
            ProtocolLevel::Current
        } else {
            ProtocolLevel::Legacy
        }
    }

    pub fn is_fully_supported(&self) -> bool {
        self.major >= ServerConfig::MIN_SUPPORTED_MAJOR
    }
}

impl fmt::Display for OslVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{} ({})",
            self.major, self.minor, self.maintenance, self.revision
        )
    }
}

/// Protocol differences between engine generations, decided once at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolLevel {
    /// Engines before 24.x: project file commands unreliable.
    Legacy,
    Current,
}

impl ProtocolLevel {
    /// Whether `OPEN` and `SAVE_COPY` behave correctly.
    pub fn supports_project_file_commands(&self) -> bool {
        matches!(self, ProtocolLevel::Current)
    }
}
