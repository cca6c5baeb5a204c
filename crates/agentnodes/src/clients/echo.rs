use agentcore::services::{LlmClient, LlmRequest, TokenStream};
use agentcore::NodeError;
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;

/// Offline model that streams the prompt back one word at a time.
#[derive(Debug, Clone, Default)]
pub struct EchoLlmClient {
    delay: Duration,
}

impl EchoLlmClient {
    /// Pause between tokens, to make streaming visible.
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl LlmClient for EchoLlmClient {
    async fn stream(&self, request: LlmRequest) -> Result<TokenStream, NodeError> {
        let tokens: Vec<String> = request
            .prompt
            .split_inclusive(char::is_whitespace)
            .map(str::to_string)
            .collect();

        let delay = self.delay;
        let stream = futures::stream::iter(tokens).then(move |token| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok::<_, NodeError>(token)
        });
        Ok(stream.boxed())
    }
}
