//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod command_policy;
pub mod ledger;
pub mod pruning;
pub mod routing;
pub mod tokens;
pub mod types;
pub mod violations;
