//! Plan execution engine.
//!
//! A plan is a graph of nodes linked by dependencies and parent/child edges. The
//! engine runs every node in dependency order: each node is classified, optionally
//! probes for missing information, generates code (or a direct answer), and runs
//! that code in a sandbox with a bounded repair loop. Results are persisted per
//! node so an interrupted run resumes where it stopped.
//!
//! - **[`core`]**: Pure logic (wait graph, context assembly, invariants, records).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side effects (plan store, sandboxes, agent commands, events, report).
//!   Collaborators sit behind traits so tests can script them.
//!
//! [`scheduler`] and [`executor`] coordinate the two; [`run`], [`status`],
//! [`reset`], and [`validate`] implement CLI commands.

pub mod core;
pub mod executor;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod plan;
pub mod reset;
pub mod run;
pub mod scheduler;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
