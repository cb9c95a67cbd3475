//! The question-answering pipeline and model provisioning.
//!
//! Everything here is synchronous: operations mutate the session and return
//! [`Effect`]s. The runtime performs each effect on a background task and
//! feeds the outcome back as an [`Event`].

use tokio_util::sync::CancellationToken;

use crate::models::ChatTurn;
use crate::query_store::QueryResult;
use crate::stream::{ProgressSequence, PullUpdate, TokenEvent, TokenSequence};

pub mod engine;
pub mod extract;
pub mod history;
pub mod prompts;
pub mod provision;

/// What a model stream should be asked, before store-dependent context is added.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamRequest {
    Sql { question: String, history: Vec<ChatTurn> },
    Summary { question: String, sql: String, table: String, history: Vec<ChatTurn> },
    Fallback { question: String, history: Vec<ChatTurn> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListPurpose {
    Display,
    Switch(String),
}

#[derive(Debug)]
pub enum Effect {
    StartStream { stream_id: u64, request: StreamRequest, cancel: CancellationToken },
    ReadToken { stream_id: u64, sequence: TokenSequence },
    ExecuteQuery { stream_id: u64, sql: String },
    ListModels { purpose: ListPurpose },
    StartPull { pull_id: u64, name: String, cancel: CancellationToken },
    ReadProgress { pull_id: u64, sequence: ProgressSequence },
    ActivateModel { name: String },
    PersistInput { text: String },
}

#[derive(Debug)]
pub enum Event {
    StreamStarted { stream_id: u64, sequence: TokenSequence },
    StreamFailed { stream_id: u64, error: String },
    Token { stream_id: u64, token: TokenEvent },
    QueryFinished { stream_id: u64, result: Result<QueryResult, String> },
    ModelsListed { purpose: ListPurpose, result: Result<Vec<String>, String> },
    PullStarted { pull_id: u64, sequence: ProgressSequence },
    PullFailed { pull_id: u64, error: String },
    /// `None` once the progress sequence is exhausted.
    PullProgress { pull_id: u64, update: Option<PullUpdate> },
}
