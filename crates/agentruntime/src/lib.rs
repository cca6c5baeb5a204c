//! Agent workflow execution runtime
//!
//! This crate provides the engine that runs agent graphs: loading and
//! validating graph definitions, the node registry, DAG scheduling with
//! bounded parallelism, retries, human-review suspension and the public
//! run lifecycle.

mod config;
mod engine;
mod loader;
mod registry;
mod retry;
mod review;
mod runtime;
mod schedule;

pub use config::RuntimeConfig;
pub use engine::{ExecutionEngine, RunOutcome};
pub use loader::{Graph, GraphCache, GraphLoader};
pub use registry::{NodeFactory, NodeMetadata, NodeRegistry};
pub use review::{pending_from_snapshot, HumanReviewGate, ResumeResult};
pub use runtime::AgentRuntime;
pub use schedule::{Firing, Replay, Schedule};
