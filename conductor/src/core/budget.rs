//! Cooperative deadlines for in-process work.
//!
//! Stage code cannot be interrupted safely while it holds partial state, so a
//! deadline is passed down and checked at safe points instead. Subprocesses keep
//! their own out-of-process timeout (see `io::process`).

use std::fmt;
use std::time::{Duration, Instant};

use anyhow::Result;

/// Raised when a cooperative deadline has passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlineExceeded {
    pub budget: Duration,
}

impl fmt::Display for DeadlineExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "deadline of {}ms exceeded", self.budget.as_millis())
    }
}

impl std::error::Error for DeadlineExceeded {}

/// A wall-clock deadline checked at safe points.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn is_expired(&self) -> bool {
        self.started.elapsed() >= self.budget
    }

    /// Return the remaining time, or `DeadlineExceeded` once it has run out.
    pub fn remaining(&self) -> Result<Duration> {
        let remaining = self.budget.saturating_sub(self.started.elapsed());
        if remaining.is_zero() {
            return Err(DeadlineExceeded {
                budget: self.budget,
            }
            .into());
        }
        Ok(remaining)
    }

    /// Fail with `DeadlineExceeded` if the deadline has passed.
    pub fn check(&self) -> Result<()> {
        self.remaining().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_deadline_has_time_left() {
        let deadline = Deadline::after(Duration::from_secs(5));
        assert!(!deadline.is_expired());
        assert!(deadline.check().is_ok());
    }

    #[test]
    fn zero_budget_is_expired_and_downcastable() {
        let deadline = Deadline::after(Duration::ZERO);
        assert!(deadline.is_expired());
        let err = deadline.check().expect_err("expired");
        assert!(err.downcast_ref::<DeadlineExceeded>().is_some());
    }
}
