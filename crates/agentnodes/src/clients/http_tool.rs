use super::{status_error, transport_error};
use agentcore::services::ToolClient;
use agentcore::NodeError;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Tool served over HTTP: arguments are POSTed as JSON, the response body
/// is the result.
pub struct HttpToolClient {
    name: String,
    url: String,
    client: reqwest::Client,
    headers: Vec<(String, String)>,
}

impl HttpToolClient {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            client: reqwest::Client::new(),
            headers: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, NodeError> {
        self.client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NodeError::config(format!("HTTP client: {}", e)))?;
        Ok(self)
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl ToolClient for HttpToolClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, arguments: Value) -> Result<Value, NodeError> {
        let mut request = self.client.post(&self.url).json(&arguments);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(&self.name, e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(&self.name, e))?;

        if !status.is_success() {
            return Err(status_error(&self.name, status, &body));
        }
        tracing::debug!(tool = %self.name, %status, bytes = body.len(), "Tool responded");

        // Plain-text bodies come back as a string
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }
}
