//! Cooperative step timeout.
//!
//! # Invariants
//! - `check_step_timeout` never blocks and never fires on a disarmed guard.
//! - Expiry is reported as `StepTimeoutAbort`, distinct from every store fault.

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant};

/// Wall-clock budget of one analysis step.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutGuard {
    started_at: Instant,
    budget: Option<Duration>,
}

impl TimeoutGuard {
    pub fn new(budget: Duration) -> Self {
        Self {
            started_at: Instant::now(),
            budget: Some(budget),
        }
    }

    /// Guard that never expires.
    pub fn disarmed() -> Self {
        Self {
            started_at: Instant::now(),
            budget: None,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.budget.is_some()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Fails with `StepTimeoutAbort` once the budget is spent.
    pub fn check_step_timeout(&self) -> Result<(), StepTimeoutAbort> {
        match self.budget {
            Some(budget) if self.started_at.elapsed() >= budget => Err(StepTimeoutAbort {
                budget,
                elapsed: self.started_at.elapsed(),
            }),
            _ => Ok(()),
        }
    }
}

/// Step budget exceeded; the caller stops at its last commit point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepTimeoutAbort {
    pub budget: Duration,
    pub elapsed: Duration,
}

impl Display for StepTimeoutAbort {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "step timeout: {}ms elapsed, budget {}ms",
            self.elapsed.as_millis(),
            self.budget.as_millis()
        )
    }
}

impl Error for StepTimeoutAbort {}

#[cfg(test)]
mod tests {
    use super::TimeoutGuard;
    use std::time::Duration;

    #[test]
    fn zero_budget_expires_immediately() {
        let guard = TimeoutGuard::new(Duration::ZERO);
        let abort = guard.check_step_timeout().unwrap_err();
        assert_eq!(abort.budget, Duration::ZERO);
    }

    #[test]
    fn generous_budget_and_disarmed_guard_pass() {
        assert!(TimeoutGuard::new(Duration::from_secs(3600))
            .check_step_timeout()
            .is_ok());
        let disarmed = TimeoutGuard::disarmed();
        assert!(!disarmed.is_armed());
        assert!(disarmed.check_step_timeout().is_ok());
    }
}
