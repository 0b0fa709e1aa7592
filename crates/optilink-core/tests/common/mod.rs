//! In-process mock engine speaking the framed protocol.

#![allow(dead_code)]

use optilink_core::transport::frame::{read_frame, read_header, write_frame};
use optilink_core::Deadline;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const ENGINE_VERSION: &str = "24.1.0 (12345M)";

/// A listener registration as seen by the engine.
#[derive(Debug, Clone)]
pub struct Registration {
    pub host: String,
    pub port: u16,
    pub uid: Option<String>,
    pub notifications: Vec<String>,
}

#[derive(Debug, Default)]
pub struct EngineState {
    pub project_state: Option<String>,
    pub commands: Vec<String>,
    pub queries: Vec<String>,
    pub registrations: Vec<Registration>,
    pub failing_commands: Vec<String>,
}

/// Answers queries and commands; records everything it receives.
pub struct MockEngine {
    pub addr: SocketAddr,
    pub state: Arc<Mutex<EngineState>>,
    task: JoinHandle<()>,
}

impl MockEngine {
    pub async fn start(project_state: Option<&str>) -> Self {
        Self::start_on("127.0.0.1:0", project_state).await
    }

    pub async fn start_on(addr: &str, project_state: Option<&str>) -> Self {
        let listener = TcpListener::bind(addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(EngineState {
            project_state: project_state.map(str::to_string),
            ..Default::default()
        }));

        let shared = state.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = shared.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, state).await;
                });
            }
        });

        Self { addr, state, task }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn set_project_state(&self, project_state: &str) {
        self.state.lock().unwrap().project_state = Some(project_state.to_string());
    }

    pub fn fail_command(&self, command: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_commands
            .push(command.to_string());
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn registrations(&self) -> Vec<Registration> {
        self.state.lock().unwrap().registrations.clone()
    }

    /// Wait until a listener subscribed to `notification` is registered.
    pub async fn wait_for_registration(&self, notification: &str) -> Registration {
        for _ in 0..200 {
            if let Some(registration) = self
                .registrations()
                .into_iter()
                .find(|r| r.notifications.iter().any(|n| n == notification))
            {
                return registration;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("No listener registered for {}", notification);
    }
}

impl Drop for MockEngine {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut stream: TcpStream, state: Arc<Mutex<EngineState>>) -> optilink_core::Result<()> {
    let deadline = Deadline::new(Some(Duration::from_secs(5)));
    let request: Value = serde_json::from_slice(&read_frame(&mut stream, &deadline).await?)?;
    let response = respond(&request, &state);
    write_frame(&mut stream, response.to_string().as_bytes(), &deadline).await
}

fn respond(request: &Value, state: &Mutex<EngineState>) -> Value {
    let mut state = state.lock().unwrap();

    if let Some(what) = request.get("What").and_then(Value::as_str) {
        state.queries.push(what.to_string());
        return match what {
            "SERVER_INFO" => json!({
                "status": "success",
                "application": {"version": ENGINE_VERSION},
            }),
            "SERVER_IS_ALIVE" => json!({"status": "success"}),
            "BASIC_PROJECT_INFO" => match &state.project_state {
                Some(project_state) => json!({
                    "status": "success",
                    "projects": [{"state": project_state}],
                }),
                None => json!({"status": "success", "projects": []}),
            },
            _ => json!({"status": "failure", "message": format!("Unknown query {}", what)}),
        };
    }

    let command = &request["projects"][0]["commands"][0];
    let name = command["command"].as_str().unwrap_or_default().to_string();
    state.commands.push(name.clone());

    if state.failing_commands.contains(&name) {
        return json!({"status": "failure", "message": format!("{} rejected", name), "std_err": "mock"});
    }

    if name == "REGISTER_LISTENER" {
        let args = &command["args"];
        state.registrations.push(Registration {
            host: args["host"].as_str().unwrap_or_default().to_string(),
            port: args["port"].as_u64().unwrap_or_default() as u16,
            uid: args["uid"].as_str().map(str::to_string),
            notifications: args["notifications"]
                .as_array()
                .map(|n| {
                    n.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        });
        return json!({"status": "success", "uid": args["uid"]});
    }
    json!({"status": "success"})
}

/// Push `payload` to a listener and consume its empty ack.
pub async fn push(host: &str, port: u16, payload: &Value) -> optilink_core::Result<()> {
    let deadline = Deadline::new(Some(Duration::from_secs(2)));
    let mut stream = deadline.run(TcpStream::connect((host, port))).await?;
    write_frame(&mut stream, payload.to_string().as_bytes(), &deadline).await?;
    let ack = read_header(&mut stream, &deadline).await?;
    assert_eq!(ack, 0);
    Ok(())
}
