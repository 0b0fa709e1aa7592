//! Request/response exchange with the engine under per-operation policies.
//!
//! Every attempt uses a fresh [`TcpClient`]: connect, send one frame, read one
//! frame, disconnect. Timeouts are retried until the last attempt; every other
//! transport failure is reported at once as a communication error.

use crate::error::{OslError, Result};
use crate::listener::CommandChannel;
use crate::policy::{Operation, PolicyRegisters, RequestPolicy};
use crate::timeout::Deadline;
use crate::transport::TcpClient;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::RwLock;
use tracing::{debug, warn};

/// Endpoint of a running engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

/// Sends commands and queries to the engine.
#[derive(Debug)]
pub struct CommandClient {
    endpoint: RwLock<Option<Endpoint>>,
    password: Option<String>,
    policies: RwLock<PolicyRegisters>,
}

impl CommandClient {
    pub fn new(endpoint: Option<Endpoint>, password: Option<String>, policies: PolicyRegisters) -> Self {
        Self {
            endpoint: RwLock::new(endpoint),
            password,
            policies: RwLock::new(policies),
        }
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.endpoint.read().expect("endpoint lock poisoned").clone()
    }

    pub fn set_endpoint(&self, endpoint: Option<Endpoint>) {
        *self.endpoint.write().expect("endpoint lock poisoned") = endpoint;
    }

    pub fn password_ref(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn policy_for(&self, operation: Operation) -> RequestPolicy {
        self.policies
            .read()
            .expect("policy lock poisoned")
            .policy_for(operation)
    }

    /// Read the policy registers.
    pub fn policies(&self) -> PolicyRegisters {
        self.policies.read().expect("policy lock poisoned").clone()
    }

    /// Modify the policy registers in place.
    pub fn update_policies<R>(&self, update: impl FnOnce(&mut PolicyRegisters) -> R) -> R {
        update(&mut self.policies.write().expect("policy lock poisoned"))
    }

    /// Send `command` under `policy` and return the parsed, checked response.
    pub async fn send_command_with(&self, command: &str, policy: RequestPolicy) -> Result<Value> {
        let endpoint = self.endpoint().ok_or(OslError::NotStarted)?;
        let attempts = policy.max_attempts.max(1);

        let mut response = None;
        for attempt in 1..=attempts {
            let deadline = Deadline::new(policy.timeout);
            match Self::exchange(&endpoint, command, &deadline).await {
                Ok(text) => {
                    response = Some(text);
                    break;
                }
                Err(e) if e.is_retryable() => {
                    if attempt == attempts {
                        return Err(e);
                    }
                    warn!(
                        "Timeout on request attempt {} of {}, retrying",
                        attempt, attempts
                    );
                }
                Err(e) => return Err(OslError::Communication { source: Box::new(e) }),
            }
        }

        let text = response.ok_or_else(|| OslError::Other("no request attempt was made".into()))?;
        debug!("Response: {}", text);
        let value: Value = serde_json::from_str(&text)?;
        check_response(&value)?;
        Ok(value)
    }

    async fn exchange(endpoint: &Endpoint, command: &str, deadline: &Deadline) -> Result<String> {
        let mut client = TcpClient::new();
        client
            .connect(&endpoint.host, endpoint.port, deadline.remaining()?)
            .await?;
        client.send_message(command, deadline.remaining()?).await?;
        let text = client.receive_message(deadline.remaining()?).await;
        client.disconnect();
        text
    }
}

#[async_trait]
impl CommandChannel for CommandClient {
    async fn send_command(&self, command: &str, operation: Operation) -> Result<Value> {
        self.send_command_with(command, self.policy_for(operation))
            .await
    }

    fn password(&self) -> Option<String> {
        self.password.clone()
    }
}

/// Fail with a command error if the response, or any element of a list
/// response, reports `status: failure`.
pub fn check_response(response: &Value) -> Result<()> {
    match response {
        Value::Array(items) => items.iter().try_for_each(check_single),
        other => check_single(other),
    }
}

fn check_single(response: &Value) -> Result<()> {
    if response.get("status").and_then(Value::as_str) != Some("failure") {
        return Ok(());
    }
    let mut message = match response.get("message").and_then(Value::as_str) {
        Some(message) => message.to_string(),
        None => format!("Command error: {}", response),
    };
    if let Some(std_err) = response.get("std_err").and_then(Value::as_str) {
        message = format!("{}; {}", message, std_err);
    }
    Err(OslError::Command { message })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::frame::{read_frame, write_frame};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[test]
    fn test_failure_status_in_list() {
        let response = json!([
            {"status": "success"},
            {"status": "failure", "message": "Cannot open", "std_err": "file locked"}
        ]);
        match check_response(&response) {
            Err(OslError::Command { message }) => assert_eq!(message, "Cannot open; file locked"),
            other => panic!("Expected Command error, got: {:?}", other),
        }
    }

    #[test]
    fn test_failure_without_message() {
        let err = check_response(&json!({"status": "failure"})).unwrap_err();
        assert!(err.to_string().contains("Command error"));
        assert!(check_response(&json!({"status": "success"})).is_ok());
    }

    /// Engine that ignores the first `silent` requests and answers the rest.
    async fn flaky_engine(silent: usize, counter: Arc<AtomicUsize>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                let seen = counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let _ = read_frame(&mut socket, &Deadline::unbounded()).await;
                    if seen < silent {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        return;
                    }
                    write_frame(&mut socket, br#"{"status": "success"}"#, &Deadline::unbounded())
                        .await
                        .unwrap();
                });
            }
        });
        port
    }

    fn client(port: u16) -> CommandClient {
        CommandClient::new(
            Some(Endpoint {
                host: "127.0.0.1".into(),
                port,
            }),
            None,
            PolicyRegisters::with_defaults(),
        )
    }

    #[tokio::test]
    async fn test_timeout_retried_until_success() {
        let counter = Arc::new(AtomicUsize::new(0));
        let port = flaky_engine(1, counter.clone()).await;
        let policy = RequestPolicy {
            timeout: Some(Duration::from_millis(300)),
            max_attempts: 2,
        };
        let response = client(port)
            .send_command_with("{\"What\":\"SERVER_IS_ALIVE\"}", policy)
            .await
            .unwrap();
        assert_eq!(response["status"], "success");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_timeout_on_last_attempt_propagates() {
        let counter = Arc::new(AtomicUsize::new(0));
        let port = flaky_engine(usize::MAX, counter.clone()).await;
        let policy = RequestPolicy {
            timeout: Some(Duration::from_millis(200)),
            max_attempts: 3,
        };
        let result = client(port).send_command_with("{}", policy).await;
        assert!(matches!(result, Err(OslError::Timeout(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_refused_connection_is_communication_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let policy = RequestPolicy {
            timeout: Some(Duration::from_secs(1)),
            max_attempts: 2,
        };
        let result = client(port).send_command_with("{}", policy).await;
        match result {
            Err(OslError::Communication { source }) => {
                assert!(matches!(*source, OslError::ConnectionRefused { .. }))
            }
            other => panic!("Expected Communication error, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_endpoint() {
        let client = CommandClient::new(None, None, PolicyRegisters::with_defaults());
        let result = client.send_command("{}", Operation::ServerInfo).await;
        assert!(matches!(result, Err(OslError::NotStarted)));
    }
}
