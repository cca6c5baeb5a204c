//! Core abstractions for the agent workflow engine
//!
//! Graph definitions, the node executor trait, the shared execution context,
//! run state, stream events and the collaborator contracts that the runtime
//! and the node library build on.

pub mod context;
mod error;
pub mod events;
mod graph;
mod node;
pub mod run;
pub mod services;
pub mod store;
pub mod template;

pub use context::{
    node_key, ContextSnapshot, ExecutionContext, NodeExecutionRecord, NodeStatus, FINAL_OUTPUT,
    USER_MESSAGE,
};
pub use error::{EngineError, GraphFormatError, NodeError, StoreError};
pub use events::{NodeEmitter, RunEvent, RunFailure, StreamSink};
pub use graph::{
    EdgeDef, EntrySpec, FailurePolicy, GraphDefinition, GraphSettings, NodeDef, NodeId, NodeKind,
    RetryPolicy,
};
pub use node::{NodeContext, NodeExecutor, NodeOutcome, NodeOutput};
pub use run::{ExecutionId, PendingReview, ReviewDecision, RunState, RunStatus};

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
