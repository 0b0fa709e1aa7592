//! JSON request envelopes.
//!
//! Commands are wrapped as
//! `{"projects": [{"commands": [{"type": "builtin", "command": ...}]}]}` and
//! queries as `{"What": ...}`. Both may carry a top-level `Password`. Keys are
//! emitted in sorted order.

pub mod commands;
pub mod queries;

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const BUILTIN: &str = "builtin";

/// A single built-in command inside a command envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerCommand {
    #[serde(rename = "type")]
    pub kind: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Map<String, Value>>,
}

impl ServerCommand {
    pub fn builtin(command: impl Into<String>) -> Self {
        Self {
            kind: BUILTIN.to_string(),
            command: command.into(),
            actor_uid: None,
            hid: None,
            args: None,
        }
    }

    pub fn with_args(mut self, args: Map<String, Value>) -> Self {
        if !args.is_empty() {
            self.args = Some(args);
        }
        self
    }

    pub fn with_actor(mut self, actor_uid: Option<&str>, hid: Option<&str>) -> Self {
        self.actor_uid = actor_uid.filter(|s| !s.is_empty()).map(str::to_string);
        self.hid = hid.filter(|s| !s.is_empty()).map(str::to_string);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectCommands {
    pub commands: Vec<ServerCommand>,
}

/// `{"projects": [{"commands": [...]}], "Password"?: ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub projects: Vec<ProjectCommands>,
    #[serde(rename = "Password", default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl CommandEnvelope {
    pub fn single(command: ServerCommand, password: Option<&str>) -> Self {
        Self {
            projects: vec![ProjectCommands {
                commands: vec![command],
            }],
            password: password.filter(|p| !p.is_empty()).map(str::to_string),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        to_sorted_json(self)
    }
}

/// `{"What": ..., "Password"?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryEnvelope {
    #[serde(rename = "What")]
    pub what: String,
    #[serde(rename = "Password", default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl QueryEnvelope {
    pub fn what(what: impl Into<String>, password: Option<&str>) -> Self {
        Self {
            what: what.into(),
            password: password.map(str::to_string),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        to_sorted_json(self)
    }
}

/// Serialize through `serde_json::Value`, whose maps keep keys sorted.
fn to_sorted_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(&serde_json::to_value(value)?)?)
}
