use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::stream::{
    NdjsonDecoder, PROGRESS_CHANNEL_CAPACITY, ProgressSequence, PullUpdate, TOKEN_CHANNEL_CAPACITY, TokenEvent,
    TokenSequence, forward,
};

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "qwen2.5:7b";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    System,
    User,
    Assistant,
}

/// One role/content pair sent to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: TurnRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: TurnRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: TurnRole::Assistant, content: content.into() }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server returned {status}: {body}")]
    Status { status: reqwest::StatusCode, body: String },
    #[error("invalid response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("{0}")]
    Server(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

/// Capabilities the pipeline needs from a model-serving backend.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn chat_stream(&self, cancel: CancellationToken, messages: Vec<ChatTurn>) -> Result<TokenSequence, ModelError>;
    async fn list_models(&self) -> Result<Vec<String>, ModelError>;
    async fn pull_model(&self, cancel: CancellationToken, name: &str) -> Result<ProgressSequence, ModelError>;
    /// Takes effect for the next call; in-flight streams keep their model.
    fn set_model(&self, name: &str);
    fn model(&self) -> String;
    fn timeout(&self) -> Duration;
}

pub struct OllamaClient {
    base_url: String,
    model: RwLock<String>,
    timeout: Duration,
    http: reqwest::Client,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Result<Self, ModelError> {
        let http = reqwest::Client::builder().connect_timeout(timeout).build()?;
        Ok(Self { base_url: base_url.into(), model: RwLock::new(model.into()), timeout, http })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn send(&self, cancel: &CancellationToken, rb: reqwest::RequestBuilder) -> Result<reqwest::Response, ModelError> {
        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(ModelError::Cancelled),
            resp = rb.send() => resp?,
        };
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ModelError::Status { status, body: server_error_text(&body) });
        }
        Ok(resp)
    }
}

fn server_error_text(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: String,
    }
    serde_json::from_str::<ErrorBody>(body).map(|b| b.error).unwrap_or_else(|_| body.trim().to_string())
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatTurn],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

#[derive(Debug, Serialize)]
struct PullRequest<'a> {
    model: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct PullChunk {
    #[serde(default)]
    status: String,
    #[serde(default)]
    completed: Option<u64>,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

impl From<PullChunk> for PullUpdate {
    fn from(c: PullChunk) -> Self {
        PullUpdate { status: c.status, completed: c.completed, total: c.total, error: c.error }
    }
}

/// Map one decoded chat line to the events it produces. Returns true once
/// the stream is finished.
fn chat_events(chunk: serde_json::Result<ChatChunk>, out: &mut Vec<TokenEvent>) -> bool {
    match chunk {
        Err(e) => {
            out.push(TokenEvent::Error(format!("invalid stream chunk: {e}")));
            true
        }
        Ok(ChatChunk { error: Some(err), .. }) => {
            out.push(TokenEvent::Error(err));
            true
        }
        Ok(c) => {
            if let Some(msg) = c.message.filter(|m| !m.content.is_empty()) {
                out.push(TokenEvent::Token(msg.content));
            }
            if c.done {
                out.push(TokenEvent::Done);
            }
            c.done
        }
    }
}

#[async_trait]
impl ModelClient for OllamaClient {
    async fn chat_stream(&self, cancel: CancellationToken, messages: Vec<ChatTurn>) -> Result<TokenSequence, ModelError> {
        let model = self.model();
        let body = ChatRequest { model: &model, messages: &messages, stream: true };
        let resp = self.send(&cancel, self.http.post(self.endpoint("chat")).json(&body)).await?;
        tracing::debug!(model = %model, turns = messages.len(), "chat stream opened");

        let (tx, seq) = TokenSequence::channel(TOKEN_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut body = resp.bytes_stream();
            let mut decoder = NdjsonDecoder::default();
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => return,
                    chunk = body.next() => chunk,
                };
                let mut events = Vec::new();
                let finished = match chunk {
                    Some(Ok(bytes)) => decoder.push(&bytes).into_iter().any(|line| chat_events(line, &mut events)),
                    Some(Err(e)) => {
                        events.push(TokenEvent::Error(e.to_string()));
                        true
                    }
                    None => {
                        let tail = decoder.finish().is_some_and(|line| chat_events(line, &mut events));
                        if !tail {
                            events.push(TokenEvent::Error("stream ended before completion".into()));
                        }
                        true
                    }
                };
                for ev in events {
                    let terminal = !matches!(ev, TokenEvent::Token(_));
                    if !forward(&tx, &cancel, ev).await || terminal {
                        return;
                    }
                }
                if finished {
                    return;
                }
            }
        });
        Ok(seq)
    }

    async fn list_models(&self) -> Result<Vec<String>, ModelError> {
        let resp = self.http.get(self.endpoint("tags")).timeout(self.timeout).send().await.map_err(|e| {
            if e.is_timeout() { ModelError::Timeout(self.timeout) } else { ModelError::Request(e) }
        })?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ModelError::Status { status, body: server_error_text(&body) });
        }
        let tags: TagsResponse = resp.json().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    async fn pull_model(&self, cancel: CancellationToken, name: &str) -> Result<ProgressSequence, ModelError> {
        let body = PullRequest { model: name, stream: true };
        let resp = self.send(&cancel, self.http.post(self.endpoint("pull")).json(&body)).await?;
        tracing::info!(model = %name, "pull started");

        let (tx, seq) = ProgressSequence::channel(PROGRESS_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut body = resp.bytes_stream();
            let mut decoder = NdjsonDecoder::default();
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => return,
                    chunk = body.next() => chunk,
                };
                let lines: Vec<serde_json::Result<PullChunk>> = match chunk {
                    Some(Ok(bytes)) => decoder.push(&bytes),
                    Some(Err(e)) => {
                        let update = PullUpdate { error: Some(e.to_string()), ..Default::default() };
                        forward(&tx, &cancel, update).await;
                        return;
                    }
                    None => {
                        if let Some(Ok(last)) = decoder.finish::<PullChunk>() {
                            forward(&tx, &cancel, last.into()).await;
                        }
                        return;
                    }
                };
                for line in lines {
                    let update = match line {
                        Ok(c) => PullUpdate::from(c),
                        Err(e) => PullUpdate { error: Some(format!("invalid progress chunk: {e}")), ..Default::default() },
                    };
                    let stop = update.error.is_some();
                    if !forward(&tx, &cancel, update).await || stop {
                        return;
                    }
                }
            }
        });
        Ok(seq)
    }

    fn set_model(&self, name: &str) {
        *self.model.write().unwrap_or_else(PoisonError::into_inner) = name.to_string();
    }

    fn model(&self) -> String {
        self.model.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelSelector;

impl ModelSelector {
    pub fn select(model_override: Option<String>, last_used: Option<String>, config_default: Option<String>) -> String {
        model_override
            .or(last_used)
            .or(config_default)
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }

    /// Resolve `name` against locally available models. A bare name matches
    /// any local tag of the same model; `name:latest` is preferred.
    pub fn find_local(name: &str, local: &[String]) -> Option<String> {
        if let Some(exact) = local.iter().find(|m| m.as_str() == name) {
            return Some(exact.clone());
        }
        if name.contains(':') {
            return None;
        }
        let latest = format!("{name}:latest");
        local
            .iter()
            .find(|m| **m == latest)
            .or_else(|| local.iter().find(|m| m.split(':').next() == Some(name)))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_precedence() {
        assert_eq!(ModelSelector::select(Some("a".into()), Some("b".into()), Some("c".into())), "a");
        assert_eq!(ModelSelector::select(None, Some("b".into()), Some("c".into())), "b");
        assert_eq!(ModelSelector::select(None, None, Some("c".into())), "c");
        assert_eq!(ModelSelector::select(None, Some("  ".into()), None), DEFAULT_MODEL);
    }

    #[test]
    fn find_local_matches_bare_names() {
        let local = vec!["qwen2.5:7b".to_string(), "llama3.2:1b".to_string(), "llama3.2:latest".to_string()];
        assert_eq!(ModelSelector::find_local("llama3.2", &local).as_deref(), Some("llama3.2:latest"));
        assert_eq!(ModelSelector::find_local("qwen2.5", &local).as_deref(), Some("qwen2.5:7b"));
        assert_eq!(ModelSelector::find_local("llama3.2:1b", &local).as_deref(), Some("llama3.2:1b"));
        assert_eq!(ModelSelector::find_local("llama3.2:3b", &local), None);
        assert_eq!(ModelSelector::find_local("llama3", &local), None);
    }

    #[test]
    fn chat_chunks_map_to_events() {
        let mut out = Vec::new();
        let done = chat_events(serde_json::from_str(r#"{"message":{"role":"assistant","content":"SEL"},"done":false}"#), &mut out);
        assert!(!done);
        let done = chat_events(serde_json::from_str(r#"{"message":{"role":"assistant","content":""},"done":true}"#), &mut out);
        assert!(done);
        assert_eq!(out, vec![TokenEvent::Token("SEL".into()), TokenEvent::Done]);

        let mut out = Vec::new();
        assert!(chat_events(serde_json::from_str(r#"{"error":"model 'x' not found"}"#), &mut out));
        assert_eq!(out, vec![TokenEvent::Error("model 'x' not found".into())]);
    }

    #[test]
    fn server_error_body_is_unwrapped() {
        assert_eq!(server_error_text(r#"{"error":"pull model manifest: file does not exist"}"#), "pull model manifest: file does not exist");
        assert_eq!(server_error_text(" plain text \n"), "plain text");
    }

    #[test]
    fn set_model_affects_later_calls() {
        let client = OllamaClient::new(DEFAULT_BASE_URL, "a", DEFAULT_TIMEOUT).unwrap();
        assert_eq!(client.model(), "a");
        client.set_model("b");
        assert_eq!(client.model(), "b");
        assert_eq!(client.timeout(), DEFAULT_TIMEOUT);
    }
}
