//! Wall-clock budgets for blocking operations.
//!
//! Every blocking call takes an `Option<Duration>`:
//! - `None` blocks indefinitely
//! - `Some(Duration::ZERO)` polls once and never waits
//! - any positive value is a hard budget measured from the moment the call
//!   started
//!
//! A [`Deadline`] captures the start instant once and re-derives the remaining
//! budget before every suspension point, so partial progress on a slow peer
//! never extends the caller's total timeout.

use crate::error::{OslError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// A timeout budget anchored at a fixed start instant.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    budget: Option<Duration>,
    start: Instant,
}

impl Deadline {
    /// Start counting down `budget` from now.
    pub fn new(budget: Option<Duration>) -> Self {
        Self {
            budget,
            start: Instant::now(),
        }
    }

    /// A deadline that never expires.
    pub fn unbounded() -> Self {
        Self::new(None)
    }

    /// The full budget.
    pub fn budget(&self) -> Option<Duration> {
        self.budget
    }

    /// Time spent since the deadline was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Remaining budget, or `Timeout` if a positive budget has been used up.
    ///
    /// Unbounded and non-blocking budgets are returned unchanged.
    pub fn remaining(&self) -> Result<Option<Duration>> {
        match self.budget {
            None => Ok(None),
            Some(budget) if budget.is_zero() => Ok(Some(Duration::ZERO)),
            Some(budget) => {
                let elapsed = self.start.elapsed();
                if elapsed >= budget {
                    Err(OslError::Timeout(budget))
                } else {
                    Ok(Some(budget - elapsed))
                }
            }
        }
    }

    /// Whether a positive budget has been used up.
    pub fn is_expired(&self) -> bool {
        self.remaining().is_err()
    }

    /// Drive `fut` to completion within the remaining budget.
    ///
    /// A zero budget still polls `fut` once, so data that is already available
    /// is returned without waiting.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = std::io::Result<T>>,
    {
        match self.remaining()? {
            None => Ok(fut.await?),
            Some(remaining) => match tokio::time::timeout(remaining, fut).await {
                Ok(result) => Ok(result?),
                Err(_) => Err(OslError::Timeout(self.budget.unwrap_or_default())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_never_expires() {
        let deadline = Deadline::unbounded();
        assert_eq!(deadline.remaining().unwrap(), None);
        assert!(!deadline.is_expired());
    }

    #[test]
    fn test_zero_budget_is_non_blocking() {
        let deadline = Deadline::new(Some(Duration::ZERO));
        assert_eq!(deadline.remaining().unwrap(), Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_counts_down_from_start() {
        let deadline = Deadline::new(Some(Duration::from_secs(10)));
        tokio::time::advance(Duration::from_secs(4)).await;
        let remaining = deadline.remaining().unwrap().unwrap();
        assert!(remaining <= Duration::from_secs(6));

        tokio::time::advance(Duration::from_secs(7)).await;
        match deadline.remaining() {
            Err(OslError::Timeout(budget)) => assert_eq!(budget, Duration::from_secs(10)),
            other => panic!("Expected Timeout, got: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_times_out_pending_future() {
        let deadline = Deadline::new(Some(Duration::from_millis(200)));
        let result = deadline
            .run(std::future::pending::<std::io::Result<()>>())
            .await;
        assert!(matches!(result, Err(OslError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_run_zero_budget_returns_ready_value() {
        let deadline = Deadline::new(Some(Duration::ZERO));
        let value = deadline.run(async { Ok::<_, std::io::Error>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }
}
