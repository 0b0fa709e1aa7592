//! Per-operation request policies.
//!
//! Every logical server operation has two independent policies: the timeout of
//! a single request attempt and the maximum number of attempts. Both live in an
//! [`AttributeRegister`] that holds a global default plus optional overrides
//! keyed by [`Operation`].

use crate::config::ServerConfig;
use crate::error::{OslError, Result};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Logical server operations that carry their own request policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    SendCommand,
    ServerInfo,
    ServerIsAlive,
    BasicProjectInfo,
    FullProjectStatusInfo,
    RegisterListener,
    RefreshListenerRegistration,
    UnregisterListener,
    EvaluateDesign,
    New,
    Open,
    Reset,
    Save,
    SaveAs,
    SaveCopy,
    Start,
    Stop,
    Shutdown,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::SendCommand => "send_command",
            Operation::ServerInfo => "server_info",
            Operation::ServerIsAlive => "server_is_alive",
            Operation::BasicProjectInfo => "basic_project_info",
            Operation::FullProjectStatusInfo => "full_project_status_info",
            Operation::RegisterListener => "register_listener",
            Operation::RefreshListenerRegistration => "refresh_listener_registration",
            Operation::UnregisterListener => "unregister_listener",
            Operation::EvaluateDesign => "evaluate_design",
            Operation::New => "new",
            Operation::Open => "open",
            Operation::Reset => "reset",
            Operation::Save => "save",
            Operation::SaveAs => "save_as",
            Operation::SaveCopy => "save_copy",
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Shutdown => "shutdown",
        }
    }

    /// Long-running, non-idempotent operations that must run exactly once.
    pub fn exactly_once() -> &'static [Operation] {
        &[
            Operation::EvaluateDesign,
            Operation::FullProjectStatusInfo,
            Operation::Open,
            Operation::Reset,
            Operation::Save,
            Operation::SaveAs,
            Operation::SaveCopy,
            Operation::Start,
            Operation::Stop,
        ]
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stores a policy value per operation with a validated global default.
#[derive(Debug, Clone)]
pub struct AttributeRegister<T: Clone> {
    name: &'static str,
    default_value: T,
    values: HashMap<Operation, T>,
    validator: fn(&T) -> bool,
}

impl<T: Clone + fmt::Debug> AttributeRegister<T> {
    /// Create a register; fails if `default_value` does not pass `validator`.
    pub fn new(name: &'static str, default_value: T, validator: fn(&T) -> bool) -> Result<Self> {
        let register = Self {
            name,
            default_value: default_value.clone(),
            values: HashMap::new(),
            validator,
        };
        register.validate(&default_value)?;
        Ok(register)
    }

    pub fn default_value(&self) -> T {
        self.default_value.clone()
    }

    pub fn set_default_value(&mut self, value: T) -> Result<()> {
        self.validate(&value)?;
        self.default_value = value;
        Ok(())
    }

    /// Value registered for `operation`, or the default.
    pub fn get_value(&self, operation: Operation) -> T {
        self.values
            .get(&operation)
            .cloned()
            .unwrap_or_else(|| self.default_value.clone())
    }

    pub fn is_registered(&self, operation: Operation) -> bool {
        self.values.contains_key(&operation)
    }

    pub fn register(&mut self, operation: Operation, value: T) -> Result<()> {
        self.validate(&value)?;
        self.values.insert(operation, value);
        Ok(())
    }

    pub fn unregister(&mut self, operation: Operation) {
        self.values.remove(&operation);
    }

    pub fn unregister_all(&mut self) {
        self.values.clear();
    }

    fn validate(&self, value: &T) -> Result<()> {
        if (self.validator)(value) {
            Ok(())
        } else {
            Err(OslError::validation(
                self.name,
                format!("invalid value {:?}", value),
            ))
        }
    }
}

/// Timeouts must be unbounded or strictly positive.
pub fn validate_timeout(value: &Option<Duration>) -> bool {
    value.map_or(true, |timeout| !timeout.is_zero())
}

/// Attempt counts must be positive.
pub fn validate_max_attempts(value: &u32) -> bool {
    *value > 0
}

/// Timeout and attempt policy for a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestPolicy {
    pub timeout: Option<Duration>,
    pub max_attempts: u32,
}

/// The two policy registers used by a session.
#[derive(Debug, Clone)]
pub struct PolicyRegisters {
    pub timeouts: AttributeRegister<Option<Duration>>,
    pub max_request_attempts: AttributeRegister<u32>,
}

impl PolicyRegisters {
    /// Global defaults with unlimited-timeout, single-attempt overrides for
    /// exactly-once operations.
    pub fn with_defaults() -> Self {
        let mut timeouts = AttributeRegister {
            name: "timeout",
            default_value: Some(ServerConfig::DEFAULT_TIMEOUT),
            values: HashMap::new(),
            validator: validate_timeout,
        };
        let mut max_request_attempts = AttributeRegister {
            name: "max_request_attempts",
            default_value: ServerConfig::DEFAULT_MAX_REQUEST_ATTEMPTS,
            values: HashMap::new(),
            validator: validate_max_attempts,
        };
        for &operation in Operation::exactly_once() {
            timeouts.values.insert(operation, None);
            max_request_attempts.values.insert(operation, 1);
        }
        Self {
            timeouts,
            max_request_attempts,
        }
    }

    pub fn policy_for(&self, operation: Operation) -> RequestPolicy {
        RequestPolicy {
            timeout: self.timeouts.get_value(operation),
            max_attempts: self.max_request_attempts.get_value(operation),
        }
    }
}

impl Default for PolicyRegisters {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_for_unregistered_operation() {
        let registers = PolicyRegisters::with_defaults();
        let policy = registers.policy_for(Operation::ServerInfo);
        assert_eq!(policy.timeout, Some(Duration::from_secs(30)));
        assert_eq!(policy.max_attempts, 2);
    }

    #[test]
    fn test_exactly_once_operations_are_unbounded_single_attempt() {
        let registers = PolicyRegisters::with_defaults();
        for op in [Operation::EvaluateDesign, Operation::Open, Operation::Save] {
            let policy = registers.policy_for(op);
            assert_eq!(policy.timeout, None, "{}", op);
            assert_eq!(policy.max_attempts, 1, "{}", op);
        }
    }

    #[test]
    fn test_register_rejects_invalid_values() {
        let mut registers = PolicyRegisters::with_defaults();
        assert!(registers
            .timeouts
            .register(Operation::ServerInfo, Some(Duration::ZERO))
            .is_err());
        assert!(registers
            .max_request_attempts
            .register(Operation::ServerInfo, 0)
            .is_err());
        assert!(registers.timeouts.set_default_value(Some(Duration::ZERO)).is_err());
        assert!(registers.timeouts.set_default_value(None).is_ok());
    }

    #[test]
    fn test_register_and_unregister_override() {
        let mut register =
            AttributeRegister::new("max_request_attempts", 2, validate_max_attempts).unwrap();
        register.register(Operation::Shutdown, 5).unwrap();
        assert!(register.is_registered(Operation::Shutdown));
        assert_eq!(register.get_value(Operation::Shutdown), 5);

        register.unregister(Operation::Shutdown);
        assert_eq!(register.get_value(Operation::Shutdown), 2);

        register.register(Operation::Start, 3).unwrap();
        register.unregister_all();
        assert!(!register.is_registered(Operation::Start));
    }

    #[test]
    fn test_new_validates_default() {
        assert!(AttributeRegister::new("max_request_attempts", 0, validate_max_attempts).is_err());
    }
}
