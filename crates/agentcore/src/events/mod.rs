// crates/agentcore/src/events/mod.rs

mod event;
mod sink;

pub use event::{RunEvent, RunFailure};
pub use sink::{NodeEmitter, StreamSink};
