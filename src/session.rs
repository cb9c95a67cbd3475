use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::ChatTurn;
use crate::stream::{CancellationController, ProgressSequence, PullUpdate, TokenSequence, UNKNOWN_PERCENT};

pub const NOTICE_GENERATING: &str = "generating query";
pub const NOTICE_FALLBACK: &str = "query failed, answering from the full data set";
pub const NOTICE_INTERRUPTED: &str = "Interrupted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Error,
    Notice,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    /// Assistant only; filled during SQL generation, before `content`.
    pub sql: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self { id: Uuid::new_v4(), role, content: content.into(), sql: String::new(), created_at: Utc::now() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant_placeholder() -> Self {
        Self::new(Role::Assistant, "")
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(Role::Error, content)
    }

    pub fn notice(content: impl Into<String>) -> Self {
        Self::new(Role::Notice, content)
    }

    pub fn is_notice(&self, text: &str) -> bool {
        self.role == Role::Notice && self.content == text
    }
}

/// Which part of the pipeline currently owns the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stage {
    #[default]
    Idle,
    GeneratingSql,
    ExecutingQuery,
    StreamingSummary,
    StreamingFallback,
}

impl Stage {
    pub fn is_active(self) -> bool {
        self != Stage::Idle
    }

    /// Whether tokens for this stage accumulate into `sql` rather than `content`.
    pub fn streams_sql(self) -> bool {
        self == Stage::GeneratingSql
    }

    pub fn label(self) -> &'static str {
        match self {
            Stage::Idle => "",
            Stage::GeneratingSql => "generating query",
            Stage::ExecutingQuery => "running query",
            Stage::StreamingSummary => "summarizing",
            Stage::StreamingFallback => "answering",
        }
    }
}

/// An in-flight model download.
#[derive(Debug)]
pub struct ModelPullState {
    pub pull_id: u64,
    pub model_name: String,
    pub cancel: CancellationToken,
    pub progress: Option<ProgressSequence>,
    pub status: String,
    /// High-water mark of the observed fraction; never decreases within a pull.
    pub peak_percent: f64,
    pub succeeded: bool,
}

impl ModelPullState {
    pub fn new(pull_id: u64, model_name: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            pull_id,
            model_name: model_name.into(),
            cancel,
            progress: None,
            status: String::new(),
            peak_percent: UNKNOWN_PERCENT,
            succeeded: false,
        }
    }

    /// Fold one update into the display state and return the percentage to
    /// render. Unknown totals render as [`UNKNOWN_PERCENT`] until a known
    /// fraction has been seen; after that the peak is kept.
    pub fn observe(&mut self, update: &PullUpdate) -> f64 {
        if !update.status.is_empty() {
            self.status = update.status.clone();
        }
        if update.is_success() {
            self.succeeded = true;
            self.peak_percent = 1.0;
        }
        let fraction = update.fraction();
        if fraction > self.peak_percent {
            self.peak_percent = fraction;
        }
        self.peak_percent
    }

    pub fn display_text(&self) -> String {
        if self.status.is_empty() {
            format!("pulling {}", self.model_name)
        } else {
            format!("pulling {}: {}", self.model_name, self.status)
        }
    }

    /// Percentage for a progress bar, or `None` when it should not be drawn.
    pub fn display_percent(&self) -> Option<f64> {
        (self.peak_percent >= 0.0).then_some(self.peak_percent * 100.0)
    }

    /// Status text with the percentage appended once it is known.
    pub fn display_line(&self) -> String {
        match self.display_percent() {
            Some(pct) => format!("{} {pct:.0}%", self.display_text()),
            None => self.display_text(),
        }
    }
}

/// Previously submitted questions, for input recall only.
#[derive(Debug, Default)]
pub struct InputHistory {
    entries: Vec<String>,
    cursor: Option<usize>,
}

impl InputHistory {
    pub fn from_entries(entries: Vec<String>) -> Self {
        Self { entries, cursor: None }
    }

    pub fn push(&mut self, text: &str) {
        if self.entries.last().map(String::as_str) != Some(text) {
            self.entries.push(text.to_string());
        }
        self.cursor = None;
    }

    pub fn previous(&mut self) -> Option<&str> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = match self.cursor {
            None => self.entries.len() - 1,
            Some(0) => 0,
            Some(i) => i - 1,
        };
        self.cursor = Some(idx);
        self.entries.get(idx).map(String::as_str)
    }

    pub fn next(&mut self) -> Option<&str> {
        let idx = self.cursor? + 1;
        if idx >= self.entries.len() {
            self.cursor = None;
            return None;
        }
        self.cursor = Some(idx);
        self.entries.get(idx).map(String::as_str)
    }

    pub fn reset_cursor(&mut self) {
        self.cursor = None;
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}

#[derive(Debug, Default)]
pub struct ChatSession {
    pub messages: Vec<ChatMessage>,
    pub stage: Stage,
    /// Token for the active stage; held iff `stage` is not Idle.
    pub cancel: CancellationController,
    pub tokens: Option<TokenSequence>,
    /// Identity of the stream or query the session is waiting on.
    pub stream_id: u64,
    pub current_question: Option<String>,
    /// Prior exchanges captured at submission, reused by every stage of the run.
    pub current_history: Vec<ChatTurn>,
    pub pull: Option<ModelPullState>,
    pub history: InputHistory,
    pub visible: bool,
}

impl ChatSession {
    pub fn new(history: Vec<String>) -> Self {
        Self { history: InputHistory::from_entries(history), visible: true, ..Default::default() }
    }

    pub fn show(&mut self) {
        self.visible = true;
    }

    pub fn hide(&mut self) {
        self.visible = false;
    }

    pub fn push(&mut self, msg: ChatMessage) {
        self.messages.push(msg);
    }

    /// Append a message that is not part of the active run. While a run is
    /// streaming it goes just before the placeholder so the placeholder stays last.
    pub fn push_aside(&mut self, msg: ChatMessage) {
        let before_placeholder =
            self.stage.is_active() && self.messages.last().is_some_and(|m| m.role == Role::Assistant);
        if before_placeholder {
            let at = self.messages.len() - 1;
            self.messages.insert(at, msg);
        } else {
            self.messages.push(msg);
        }
    }

    /// The in-progress assistant message, which is always the last message.
    pub fn placeholder_mut(&mut self) -> Option<&mut ChatMessage> {
        if !self.stage.is_active() {
            return None;
        }
        self.messages.last_mut().filter(|m| m.role == Role::Assistant)
    }

    pub fn take_placeholder(&mut self) -> Option<ChatMessage> {
        if self.messages.last().is_some_and(|m| m.role == Role::Assistant) {
            self.messages.pop()
        } else {
            None
        }
    }

    pub fn remove_notices(&mut self, text: &str) {
        self.messages.retain(|m| !m.is_notice(text));
    }

    /// Drop notices matching any of `texts` that belong to the current run,
    /// i.e. everything after the most recent user message.
    pub fn remove_run_notices(&mut self, texts: &[&str]) {
        let start = self.messages.iter().rposition(|m| m.role == Role::User).map_or(0, |i| i + 1);
        let mut index = 0;
        self.messages.retain(|m| {
            let keep = index < start || !texts.iter().any(|t| m.is_notice(t));
            index += 1;
            keep
        });
    }

    pub fn is_busy(&self) -> bool {
        self.stage.is_active()
    }

    /// Return to Idle and release everything tied to the finished run.
    pub fn reset_stage(&mut self) {
        self.stage = Stage::Idle;
        self.cancel.release();
        self.tokens = None;
        self.current_question = None;
        self.current_history.clear();
    }
}
