//! Execution runtime for AI agent commands.
//!
//! A run goes to the primary backend (a streaming HTTP agent service or a
//! command-line agent process) under a tool policy and resource limits. A
//! structural fault in the primary restarts the run once on the fallback.
//! Sessions keyed by user and working directory carry the backend's resume
//! id across runs.

pub mod assembler;
pub mod backends;
pub mod config;
pub mod errors;
pub mod model;
pub mod permission;
pub mod runtime;
pub mod session;
pub mod supervisor;

pub use errors::{BackendError, ConduitError};
pub use model::{BackendKind, RunResult, TerminationReason};
pub use runtime::{AgentRuntime, StatsSnapshot};
