//! Side-effecting layer: filesystem, subprocesses, sandboxes, and agent commands.

pub mod agent;
pub mod command_agent;
pub mod config;
pub mod data_files;
pub mod docker;
pub mod events;
pub mod fsutil;
pub mod init;
pub mod plan_file;
pub mod process;
pub mod prompt;
pub mod report;
pub mod sandbox;
pub mod snapshot;
pub mod store;
