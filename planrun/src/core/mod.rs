//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod cancel;
pub mod classifier;
pub mod context;
pub mod graph;
pub mod invariants;
pub mod response;
pub mod types;
