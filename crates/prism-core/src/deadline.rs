//! Deadline-bounded execution.
//!
//! Every stage of the pipeline that waits on external I/O (lanes, the
//! guided-prompt call, LLM synthesis) runs under [`run_with_deadline`] so a
//! single coordinator can enforce budgets even when the underlying client
//! library ignores cancellation.

use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Why a deadline-bounded task did not produce a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineError {
    TimedOut,
    Cancelled,
}

impl std::fmt::Display for DeadlineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TimedOut => f.write_str("timed out"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Run `fut` until it resolves, the budget elapses, or `cancel` fires,
/// whichever comes first. The future is dropped on timeout or cancellation;
/// its result, if it arrives later on some other task, is never observed.
pub async fn run_with_deadline<F, T>(
    budget: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> Result<T, DeadlineError>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DeadlineError::Cancelled),
        _ = tokio::time::sleep(budget) => Err(DeadlineError::TimedOut),
        out = fut => Ok(out),
    }
}

/// A running total budget, handed down the pipeline so each stage can clamp
/// its own allowance to whatever is left.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn new(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn from_millis(budget_ms: u64) -> Self {
        Self::new(Duration::from_millis(budget_ms))
    }

    /// Time left, saturating at zero.
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }

    pub fn remaining_ms(&self) -> u64 {
        self.remaining().as_millis() as u64
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// A stage's allowance: its own default, clamped to the remaining total.
    pub fn clamp(&self, stage_budget: Duration) -> Duration {
        stage_budget.min(self.remaining())
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}
