//! Scripted stand-ins for the model backend and persistence.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::models::{ChatTurn, ModelClient, ModelError};
use crate::storage::ChatPersistence;
use crate::stream::{EventSequence, ProgressSequence, PullUpdate, TokenEvent, TokenSequence, forward};

/// How the fake answers one `chat_stream` call.
#[derive(Debug, Clone)]
pub enum ChatScript {
    /// Emit these events, then close the sequence.
    Events(Vec<TokenEvent>),
    /// Fail to open the stream.
    Fail(String),
    /// Open the stream but never produce anything until cancelled.
    Hang,
}

impl ChatScript {
    /// A well-formed answer: one token per piece, then `Done`.
    pub fn answer(pieces: &[&str]) -> Self {
        let mut events: Vec<TokenEvent> = pieces.iter().map(|p| TokenEvent::Token(p.to_string())).collect();
        events.push(TokenEvent::Done);
        ChatScript::Events(events)
    }
}

pub struct FakeModel {
    chats: Mutex<VecDeque<ChatScript>>,
    calls: Mutex<Vec<Vec<ChatTurn>>>,
    local: Mutex<Result<Vec<String>, String>>,
    pull_script: Mutex<Vec<PullUpdate>>,
    pulls: Mutex<Vec<String>>,
    model: Mutex<String>,
}

impl FakeModel {
    pub fn new(chats: Vec<ChatScript>) -> Self {
        Self {
            chats: Mutex::new(chats.into()),
            calls: Mutex::new(Vec::new()),
            local: Mutex::new(Ok(Vec::new())),
            pull_script: Mutex::new(Vec::new()),
            pulls: Mutex::new(Vec::new()),
            model: Mutex::new("qwen2.5:7b".to_string()),
        }
    }

    pub fn with_local(self, names: &[&str]) -> Self {
        *self.local.lock().unwrap() = Ok(names.iter().map(|n| n.to_string()).collect());
        self
    }

    pub fn with_pull(self, updates: Vec<PullUpdate>) -> Self {
        *self.pull_script.lock().unwrap() = updates;
        self
    }

    /// Messages passed to each `chat_stream` call, in call order.
    pub fn calls(&self) -> Vec<Vec<ChatTurn>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn pulls(&self) -> Vec<String> {
        self.pulls.lock().unwrap().clone()
    }
}

fn spawn_events<T: Send + 'static>(events: Vec<T>, cancel: CancellationToken, capacity: usize) -> EventSequence<T> {
    let (tx, seq) = EventSequence::channel(capacity);
    tokio::spawn(async move {
        for ev in events {
            if !forward(&tx, &cancel, ev).await {
                return;
            }
        }
    });
    seq
}

#[async_trait]
impl ModelClient for FakeModel {
    async fn chat_stream(&self, cancel: CancellationToken, messages: Vec<ChatTurn>) -> Result<TokenSequence, ModelError> {
        self.calls.lock().unwrap().push(messages);
        let script = self.chats.lock().unwrap().pop_front();
        match script {
            Some(ChatScript::Events(events)) => Ok(spawn_events(events, cancel, 4)),
            Some(ChatScript::Fail(msg)) => Err(ModelError::Server(msg)),
            Some(ChatScript::Hang) => {
                let (tx, seq) = TokenSequence::channel(1);
                tokio::spawn(async move {
                    cancel.cancelled().await;
                    drop(tx);
                });
                Ok(seq)
            }
            None => Err(ModelError::Server("no scripted response".into())),
        }
    }

    async fn list_models(&self) -> Result<Vec<String>, ModelError> {
        self.local.lock().unwrap().clone().map_err(ModelError::Server)
    }

    async fn pull_model(&self, cancel: CancellationToken, name: &str) -> Result<ProgressSequence, ModelError> {
        self.pulls.lock().unwrap().push(name.to_string());
        let updates = self.pull_script.lock().unwrap().clone();
        Ok(spawn_events(updates, cancel, 4))
    }

    fn set_model(&self, name: &str) {
        *self.model.lock().unwrap() = name.to_string();
    }

    fn model(&self) -> String {
        self.model.lock().unwrap().clone()
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(2)
    }
}

#[derive(Default)]
pub struct FakePersistence {
    inputs: Mutex<Vec<String>>,
    last_model: Mutex<Option<String>>,
}

impl FakePersistence {
    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().unwrap().clone()
    }

    pub fn stored_model(&self) -> Option<String> {
        self.last_model.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatPersistence for FakePersistence {
    async fn append_chat_input(&self, text: &str) -> anyhow::Result<()> {
        self.inputs.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn load_chat_history(&self, limit: usize) -> anyhow::Result<Vec<String>> {
        let inputs = self.inputs.lock().unwrap();
        Ok(inputs[inputs.len().saturating_sub(limit)..].to_vec())
    }

    async fn put_last_model(&self, name: &str) -> anyhow::Result<()> {
        *self.last_model.lock().unwrap() = Some(name.to_string());
        Ok(())
    }

    async fn last_model(&self) -> anyhow::Result<Option<String>> {
        Ok(self.last_model.lock().unwrap().clone())
    }
}
