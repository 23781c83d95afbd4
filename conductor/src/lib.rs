//! Orchestration engine for LLM-backed agent tasks.
//!
//! The engine bounds cost and risk around untrusted model output: it routes
//! each task to a model, iterates with escalation under token budgets, runs a
//! multi-stage pipeline behind a circuit breaker, and commits artifacts to git
//! exactly once. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (routing, pruning, command policy,
//!   call ledger). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (config, git, processes, sandbox
//!   worktrees, backlog and resume files).
//!
//! Orchestration modules ([`iterate`], [`conductor`], [`handshake`], [`tools`])
//! coordinate core logic with I/O and back the CLI commands.

pub mod agents;
pub mod conductor;
pub mod core;
pub mod exit_codes;
pub mod handshake;
pub mod io;
pub mod iterate;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tools;
