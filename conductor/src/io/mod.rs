//! Side-effecting adapters: filesystem state, git, child processes, and model backends.

pub mod backlog;
pub mod config;
pub mod generator;
pub mod git;
pub mod process;
pub mod resume;
pub mod sandbox;
pub mod test_runner;
