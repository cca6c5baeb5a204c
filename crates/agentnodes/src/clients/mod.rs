//! Concrete service clients for the built-in nodes.
//!
//! `EchoLlmClient` and `KeywordRetriever` need no network and back the
//! offline mode; the HTTP clients talk to real endpoints.

mod echo;
mod http_tool;
mod keyword;
mod openai;

pub use echo::EchoLlmClient;
pub use http_tool::HttpToolClient;
pub use keyword::KeywordRetriever;
pub use openai::{OpenAiCompatClient, SseParser};

use agentcore::NodeError;
use reqwest::StatusCode;

/// Rate limits and server errors are worth retrying; other statuses are not.
pub(crate) fn status_error(service: &str, status: StatusCode, body: &str) -> NodeError {
    let message = format!("{} returned {}: {}", service, status, body.trim());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        NodeError::Transient(message)
    } else {
        NodeError::ExecutionFailed(message)
    }
}

pub(crate) fn transport_error(service: &str, err: reqwest::Error) -> NodeError {
    let message = format!("{} request failed: {}", service, err);
    if err.is_timeout() || err.is_connect() {
        NodeError::Transient(message)
    } else {
        NodeError::ExecutionFailed(message)
    }
}
