use super::{status_error, transport_error};
use agentcore::services::{LlmClient, LlmRequest, TokenStream};
use agentcore::NodeError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::VecDeque;

const SERVICE: &str = "chat completions";

/// Splits a server-sent-events byte stream into `data:` payloads.
///
/// Bytes are buffered until a blank line closes the event, so payloads
/// split across network chunks (even mid UTF-8 sequence) come out whole.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning the data of every event now complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some((pos, len)) = event_boundary(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..pos + len).take(pos).collect();
            let block = String::from_utf8_lossy(&block);

            let data: Vec<&str> = block
                .lines()
                .filter_map(|line| line.trim_end_matches('\r').strip_prefix("data:"))
                .map(|data| data.strip_prefix(' ').unwrap_or(data))
                .collect();
            if !data.is_empty() {
                events.push(data.join("\n"));
            }
        }

        events
    }
}

fn event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let find = |pattern: &[u8]| buffer.windows(pattern.len()).position(|w| w == pattern);
    match (find(b"\n\n"), find(b"\r\n\r\n")) {
        (Some(lf), Some(crlf)) if crlf < lf => Some((crlf, 4)),
        (Some(lf), _) => Some((lf, 2)),
        (None, Some(crlf)) => Some((crlf, 4)),
        (None, None) => None,
    }
}

enum Delta {
    Text(String),
    Done,
    Empty,
}

fn parse_delta(data: &str) -> Result<Delta, NodeError> {
    if data.trim() == "[DONE]" {
        return Ok(Delta::Done);
    }
    let chunk: Value = serde_json::from_str(data)
        .map_err(|e| NodeError::ExecutionFailed(format!("Malformed stream chunk: {}", e)))?;
    if let Some(error) = chunk.get("error") {
        return Err(NodeError::ExecutionFailed(format!("Model error: {}", error)));
    }

    match chunk["choices"][0]["delta"]["content"].as_str() {
        Some(text) if !text.is_empty() => Ok(Delta::Text(text.to_string())),
        _ => Ok(Delta::Empty),
    }
}

struct SseState {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    parser: SseParser,
    pending: VecDeque<Result<String, NodeError>>,
    done: bool,
}

impl SseState {
    fn push(&mut self, data: &str) {
        match parse_delta(data) {
            Ok(Delta::Text(text)) => self.pending.push_back(Ok(text)),
            Ok(Delta::Empty) => {}
            Ok(Delta::Done) => self.done = true,
            Err(e) => {
                self.pending.push_back(Err(e));
                self.done = true;
            }
        }
    }
}

/// Client for OpenAI-compatible `/chat/completions` endpoints with
/// streaming enabled.
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
}

impl OpenAiCompatClient {
    pub fn new(base_url: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: None,
            default_model: default_model.into(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn body(&self, request: &LlmRequest) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": request.prompt }));

        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(&self.default_model),
            "messages": messages,
            "stream": true,
        });
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn stream(&self, request: LlmRequest) -> Result<TokenStream, NodeError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let mut http = self.client.post(&url).json(&self.body(&request));
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }

        let response = http.send().await.map_err(|e| transport_error(SERVICE, e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(SERVICE, status, &body));
        }

        let state = SseState {
            body: response.bytes_stream().map(|r| r.map(|b| b.to_vec())).boxed(),
            parser: SseParser::new(),
            pending: VecDeque::new(),
            done: false,
        };

        let tokens = futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(item) = state.pending.pop_front() {
                    return Some((item, state));
                }
                if state.done {
                    return None;
                }
                match state.body.next().await {
                    Some(Ok(bytes)) => {
                        for data in state.parser.feed(&bytes) {
                            state.push(&data);
                            if state.done {
                                break;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        state.done = true;
                        return Some((Err(NodeError::Transient(format!("Stream interrupted: {}", e))), state));
                    }
                    None => state.done = true,
                }
            }
        });
        Ok(tokens.boxed())
    }
}
