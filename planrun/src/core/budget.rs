//! Shared time budget helpers for sandbox invocations under a plan deadline.

use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};

/// Return the remaining time budget until the provided deadline.
pub fn remaining_budget(deadline: Instant) -> Result<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return Err(anyhow!("plan time budget exhausted"));
    }
    Ok(remaining)
}

/// Clamp a per-invocation timeout so it never outlives the plan deadline.
///
/// An exhausted budget yields a zero timeout; the process runner then kills the child
/// immediately and the invocation reports `timed_out`.
pub fn effective_timeout(requested: Duration, deadline: Option<Instant>) -> Duration {
    match deadline {
        Some(deadline) => remaining_budget(deadline)
            .map(|left| left.min(requested))
            .unwrap_or(Duration::ZERO),
        None => requested,
    }
}
