//! Stable exit codes for planrun CLI commands.

use crate::core::types::PlanExecutionResult;

/// Command succeeded; for `run`, every node completed.
pub const OK: i32 = 0;
/// Invalid plan/config or a system error (including a stalled scheduler).
pub const INVALID: i32 = 1;
/// `planrun run` finished with failed or skipped nodes.
pub const FAILED: i32 = 2;
/// `planrun run` was cancelled (plan timeout) before every node finished.
pub const CANCELLED: i32 = 3;

pub fn for_run(result: &PlanExecutionResult) -> i32 {
    if result.cancelled {
        CANCELLED
    } else if result.success() {
        OK
    } else {
        FAILED
    }
}
