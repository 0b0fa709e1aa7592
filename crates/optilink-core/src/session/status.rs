//! Project execution states and stop request arbitration.

/// Project states in which there is nothing left to stop.
pub const STOPPED_STATES: [&str; 4] = ["IDLE", "FINISHED", "STOPPED", "ABORTED"];

pub const PROCESSING: &str = "PROCESSING";

/// A stop request, ordered by strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopRequest {
    StopGently,
    Stop,
}

impl StopRequest {
    pub fn priority(&self) -> u8 {
        match self {
            StopRequest::StopGently => 10,
            StopRequest::Stop => 20,
        }
    }
}

/// Priority of a state that reports an outstanding stop request.
pub fn requested_state_priority(status: &str) -> Option<u8> {
    match status {
        "ABORT_REQUESTED" => Some(30),
        "STOP_REQUESTED" => Some(20),
        "GENTLE_STOP_REQUESTED" => Some(10),
        _ => None,
    }
}

pub fn is_stopped(status: Option<&str>) -> bool {
    status.is_some_and(|s| STOPPED_STATES.contains(&s))
}

/// Whether `request` must be sent given the current project `status`.
///
/// Nothing is sent to a stopped project, nor when an equal or stronger
/// request is already outstanding.
pub fn stop_needed(status: Option<&str>, request: StopRequest) -> bool {
    if is_stopped(status) {
        return false;
    }
    match status.and_then(requested_state_priority) {
        Some(outstanding) => request.priority() > outstanding,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stopped_states_send_nothing() {
        for state in STOPPED_STATES {
            assert!(!stop_needed(Some(state), StopRequest::Stop));
        }
    }

    #[test]
    fn test_stronger_request_overrides_gentle_stop() {
        assert!(stop_needed(Some("GENTLE_STOP_REQUESTED"), StopRequest::Stop));
        assert!(!stop_needed(Some("GENTLE_STOP_REQUESTED"), StopRequest::StopGently));
        assert!(!stop_needed(Some("STOP_REQUESTED"), StopRequest::Stop));
        assert!(!stop_needed(Some("ABORT_REQUESTED"), StopRequest::Stop));
    }

    #[test]
    fn test_running_or_unknown_project_is_stopped() {
        assert!(stop_needed(Some("PROCESSING"), StopRequest::StopGently));
        assert!(stop_needed(None, StopRequest::Stop));
    }
}
