//! Builders for the commands the session itself issues.

use super::{CommandEnvelope, ServerCommand};
use crate::error::{OslError, Result};
use crate::listener::ServerNotification;
use serde_json::{json, Map, Value};

pub const EVALUATE_DESIGN: &str = "EVALUATE_DESIGN";
pub const NEW: &str = "NEW";
pub const OPEN: &str = "OPEN";
pub const REFRESH_LISTENER_REGISTRATION: &str = "REFRESH_LISTENER_REGISTRATION";
pub const REGISTER_LISTENER: &str = "REGISTER_LISTENER";
pub const RESET: &str = "RESET";
pub const SAVE: &str = "SAVE";
pub const SAVE_AS: &str = "SAVE_AS";
pub const SAVE_COPY: &str = "SAVE_COPY";
pub const SHUTDOWN: &str = "SHUTDOWN";
pub const START: &str = "START";
pub const STOP: &str = "STOP";
pub const STOP_GENTLY: &str = "STOP_GENTLY";
pub const UNREGISTER_LISTENER: &str = "UNREGISTER_LISTENER";

/// Options of a `REGISTER_LISTENER` command.
#[derive(Debug, Clone, Default)]
pub struct RegisterListenerArgs {
    /// Lease timeout in milliseconds.
    pub timeout_ms: Option<u32>,
    pub notifications: Option<Vec<ServerNotification>>,
    /// Explicitly requested listener uid.
    pub listener_uid: Option<String>,
}

fn build(command: ServerCommand, password: Option<&str>) -> Result<String> {
    CommandEnvelope::single(command, password).to_json()
}

fn args_of(pairs: impl IntoIterator<Item = (&'static str, Value)>) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

/// `actor_uid` and `hid` address a single node state and must come together.
fn check_actor_and_hid(actor_uid: Option<&str>, hid: Option<&str>) -> Result<()> {
    match (actor_uid, hid) {
        (Some(_), None) => Err(OslError::validation(
            "hid",
            "The hierarchical ID (hid) is required.",
        )),
        (None, Some(_)) => Err(OslError::validation("actor_uid", "The actor uid is required.")),
        _ => Ok(()),
    }
}

/// Ask the engine to push notifications to `host:port`.
pub fn register_listener(
    host: &str,
    port: u16,
    options: &RegisterListenerArgs,
    password: Option<&str>,
) -> Result<String> {
    let mut args = args_of([("host", json!(host)), ("port", json!(port))]);
    if let Some(timeout) = options.timeout_ms {
        args.insert("timeout".into(), json!(timeout));
    }
    if let Some(notifications) = &options.notifications {
        let names: Vec<&str> = notifications.iter().map(|n| n.as_str()).collect();
        args.insert("notifications".into(), json!(names));
    }
    if let Some(uid) = &options.listener_uid {
        args.insert("uid".into(), json!(uid));
    }
    build(ServerCommand::builtin(REGISTER_LISTENER).with_args(args), password)
}

pub fn refresh_listener_registration(uid: &str, password: Option<&str>) -> Result<String> {
    build(
        ServerCommand::builtin(REFRESH_LISTENER_REGISTRATION).with_args(args_of([("uid", json!(uid))])),
        password,
    )
}

pub fn unregister_listener(uid: &str, password: Option<&str>) -> Result<String> {
    build(
        ServerCommand::builtin(UNREGISTER_LISTENER).with_args(args_of([("uid", json!(uid))])),
        password,
    )
}

pub fn evaluate_design(parameters: &Map<String, Value>, password: Option<&str>) -> Result<String> {
    build(
        ServerCommand::builtin(EVALUATE_DESIGN)
            .with_args(args_of([("parameters", Value::Object(parameters.clone()))])),
        password,
    )
}

pub fn new(password: Option<&str>) -> Result<String> {
    build(ServerCommand::builtin(NEW), password)
}

pub fn open(
    path: &str,
    do_force: bool,
    do_restore: bool,
    do_reset: bool,
    password: Option<&str>,
) -> Result<String> {
    build(
        ServerCommand::builtin(OPEN).with_args(args_of([
            ("path", json!(path)),
            ("do_force", json!(do_force)),
            ("do_restore", json!(do_restore)),
            ("do_reset", json!(do_reset)),
        ])),
        password,
    )
}

pub fn reset(actor_uid: Option<&str>, hid: Option<&str>, password: Option<&str>) -> Result<String> {
    check_actor_and_hid(actor_uid, hid)?;
    build(ServerCommand::builtin(RESET).with_actor(actor_uid, hid), password)
}

pub fn save(password: Option<&str>) -> Result<String> {
    build(ServerCommand::builtin(SAVE), password)
}

pub fn save_as(
    path: &str,
    do_force: bool,
    do_restore: bool,
    do_reset: bool,
    password: Option<&str>,
) -> Result<String> {
    build(
        ServerCommand::builtin(SAVE_AS).with_args(args_of([
            ("path", json!(path)),
            ("do_force", json!(do_force)),
            ("do_restore", json!(do_restore)),
            ("do_reset", json!(do_reset)),
        ])),
        password,
    )
}

pub fn save_copy(path: &str, password: Option<&str>) -> Result<String> {
    build(
        ServerCommand::builtin(SAVE_COPY).with_args(args_of([("path", json!(path))])),
        password,
    )
}

pub fn shutdown(password: Option<&str>) -> Result<String> {
    build(ServerCommand::builtin(SHUTDOWN), password)
}

pub fn start(actor_uid: Option<&str>, hid: Option<&str>, password: Option<&str>) -> Result<String> {
    check_actor_and_hid(actor_uid, hid)?;
    build(ServerCommand::builtin(START).with_actor(actor_uid, hid), password)
}

pub fn stop(actor_uid: Option<&str>, hid: Option<&str>, password: Option<&str>) -> Result<String> {
    check_actor_and_hid(actor_uid, hid)?;
    build(ServerCommand::builtin(STOP).with_actor(actor_uid, hid), password)
}

pub fn stop_gently(
    actor_uid: Option<&str>,
    hid: Option<&str>,
    password: Option<&str>,
) -> Result<String> {
    check_actor_and_hid(actor_uid, hid)?;
    build(
        ServerCommand::builtin(STOP_GENTLY).with_actor(actor_uid, hid),
        password,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_command(text: &str) -> ServerCommand {
        let envelope: CommandEnvelope = serde_json::from_str(text).unwrap();
        envelope.projects[0].commands[0].clone()
    }

    #[test]
    fn test_start_envelope_shape() {
        let text = start(None, None, Some("secret")).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["Password"], "secret");
        assert_eq!(value["projects"][0]["commands"][0]["type"], "builtin");
        assert_eq!(value["projects"][0]["commands"][0]["command"], "START");
        assert!(value["projects"][0]["commands"][0].get("args").is_none());
    }

    #[test]
    fn test_actor_and_hid_must_come_together() {
        assert!(stop(Some("uid"), None, None).is_err());
        assert!(stop(None, Some("0.1"), None).is_err());
        let cmd = first_command(&stop(Some("uid"), Some("0.1"), None).unwrap());
        assert_eq!(cmd.actor_uid.as_deref(), Some("uid"));
        assert_eq!(cmd.hid.as_deref(), Some("0.1"));
    }

    #[test]
    fn test_register_listener_by_address() {
        let options = RegisterListenerArgs {
            timeout_ms: Some(60_000),
            notifications: Some(vec![
                ServerNotification::ServerUp,
                ServerNotification::ServerDown,
            ]),
            listener_uid: Some("abc".into()),
        };
        let cmd = first_command(&register_listener("127.0.0.1", 50000, &options, None).unwrap());
        let args = cmd.args.unwrap();
        assert_eq!(args["host"], "127.0.0.1");
        assert_eq!(args["port"], 50000);
        assert_eq!(args["timeout"], 60_000);
        assert_eq!(args["uid"], "abc");
        assert_eq!(args["notifications"], json!(["SERVER_UP", "SERVER_DOWN"]));
    }

    #[test]
    fn test_keys_are_sorted() {
        let text = open("/tmp/p.opf", true, false, false, None).unwrap();
        let do_force = text.find("do_force").unwrap();
        let do_reset = text.find("do_reset").unwrap();
        let path = text.find("\"path\"").unwrap();
        assert!(do_force < do_reset && do_reset < path);
    }
}
