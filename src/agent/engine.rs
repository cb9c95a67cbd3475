use crate::agent::extract::extract_sql;
use crate::agent::history::build_history;
use crate::agent::provision::ModelManager;
use crate::agent::{Effect, Event, StreamRequest};
use crate::query_store::{QueryResult, format_table};
use crate::session::{
    ChatMessage, ChatSession, NOTICE_FALLBACK, NOTICE_GENERATING, NOTICE_INTERRUPTED, Stage,
};
use crate::stream::{TokenEvent, TokenSequence};

pub const EMPTY_SQL_ERROR: &str = "model returned empty SQL";
pub const EMPTY_ANSWER_ERROR: &str = "model returned an empty answer";

/// Drives one chat session through SQL generation, query execution and
/// answer streaming. All session mutation happens here, on the loop.
pub struct Orchestrator {
    pub session: ChatSession,
    pub models: ModelManager,
    max_result_rows: usize,
}

impl Orchestrator {
    pub fn new(session: ChatSession, max_result_rows: usize) -> Self {
        Self { session, models: ModelManager::default(), max_result_rows }
    }

    /// Start answering `question`. Ignored when blank or while a run is active.
    pub fn submit(&mut self, question: &str) -> Vec<Effect> {
        let question = question.trim();
        if question.is_empty() || self.session.is_busy() {
            return Vec::new();
        }
        self.session.remove_notices(NOTICE_INTERRUPTED);
        let history = build_history(&self.session.messages, false);

        self.session.history.push(question);
        self.session.push(ChatMessage::user(question));
        self.session.push(ChatMessage::notice(NOTICE_GENERATING));
        self.session.push(ChatMessage::assistant_placeholder());
        self.session.current_question = Some(question.to_string());
        self.session.current_history = history.clone();
        self.session.stage = Stage::GeneratingSql;
        let cancel = self.session.cancel.begin();
        let stream_id = self.next_stream_id();

        metrics::counter!("query_pilot_questions_total").increment(1);
        tracing::info!(stream_id, turns = history.len(), "question submitted");

        vec![
            Effect::PersistInput { text: question.to_string() },
            Effect::StartStream {
                stream_id,
                request: StreamRequest::Sql { question: question.to_string(), history },
                cancel,
            },
        ]
    }

    /// Interrupt the active run. Safe to call at any time; returns whether
    /// anything was interrupted.
    pub fn cancel(&mut self) -> bool {
        if !self.session.stage.is_active() {
            self.session.cancel.cancel();
            return false;
        }
        let stage = self.session.stage;
        self.session.cancel.cancel();
        self.session.take_placeholder();
        self.session.remove_run_notices(&[NOTICE_GENERATING, NOTICE_FALLBACK]);
        self.session.push(ChatMessage::notice(NOTICE_INTERRUPTED));
        self.session.reset_stage();

        metrics::counter!("query_pilot_cancellations_total").increment(1);
        tracing::info!(?stage, stream_id = self.session.stream_id, "run interrupted");
        true
    }

    pub fn switch_model(&mut self, name: &str) -> Vec<Effect> {
        self.models.switch_model(&mut self.session, name)
    }

    pub fn list_models(&mut self) -> Vec<Effect> {
        self.models.list_models()
    }

    pub fn cancel_pull(&mut self) -> bool {
        self.models.cancel_pull(&mut self.session)
    }

    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        match event {
            Event::StreamStarted { stream_id, sequence } => self.on_stream_started(stream_id, sequence),
            Event::StreamFailed { stream_id, error } => {
                if self.is_current(stream_id) {
                    self.fail_run(error);
                }
                Vec::new()
            }
            Event::Token { stream_id, token } => self.on_token(stream_id, token),
            Event::QueryFinished { stream_id, result } => self.on_query_finished(stream_id, result),
            Event::ModelsListed { purpose, result } => self.models.on_models_listed(&mut self.session, purpose, result),
            Event::PullStarted { pull_id, sequence } => self.models.on_pull_started(&mut self.session, pull_id, sequence),
            Event::PullFailed { pull_id, error } => {
                self.models.on_pull_failed(&mut self.session, pull_id, &error);
                Vec::new()
            }
            Event::PullProgress { pull_id, update } => self.models.on_pull_progress(&mut self.session, pull_id, update),
        }
    }

    fn next_stream_id(&mut self) -> u64 {
        self.session.stream_id += 1;
        self.session.stream_id
    }

    /// Events for anything but the stream the session is waiting on are late
    /// arrivals from an interrupted or superseded run.
    fn is_current(&self, stream_id: u64) -> bool {
        let current = self.session.stage.is_active() && self.session.stream_id == stream_id;
        if !current {
            tracing::debug!(stream_id, active = self.session.stream_id, stage = ?self.session.stage, "dropping stale event");
        }
        current
    }

    fn on_stream_started(&mut self, stream_id: u64, sequence: TokenSequence) -> Vec<Effect> {
        if !self.is_current(stream_id) || self.session.stage == Stage::ExecutingQuery {
            return Vec::new();
        }
        self.session.tokens = Some(sequence.clone());
        vec![Effect::ReadToken { stream_id, sequence }]
    }

    fn on_token(&mut self, stream_id: u64, token: TokenEvent) -> Vec<Effect> {
        if !self.is_current(stream_id) {
            return Vec::new();
        }
        match token {
            TokenEvent::Token(text) => {
                let into_sql = self.session.stage.streams_sql();
                if let Some(msg) = self.session.placeholder_mut() {
                    if into_sql { msg.sql.push_str(&text) } else { msg.content.push_str(&text) }
                }
                match &self.session.tokens {
                    Some(sequence) => vec![Effect::ReadToken { stream_id, sequence: sequence.clone() }],
                    None => Vec::new(),
                }
            }
            TokenEvent::Done => match self.session.stage {
                Stage::GeneratingSql => self.finish_sql(),
                Stage::StreamingSummary | Stage::StreamingFallback => {
                    self.finish_answer();
                    Vec::new()
                }
                Stage::Idle | Stage::ExecutingQuery => Vec::new(),
            },
            TokenEvent::Error(e) => {
                self.fail_run(format!("model error: {e}"));
                Vec::new()
            }
        }
    }

    fn finish_sql(&mut self) -> Vec<Effect> {
        self.session.tokens = None;
        let raw = self.session.placeholder_mut().map(|m| m.sql.clone()).unwrap_or_default();
        let sql = extract_sql(&raw);
        if sql.is_empty() {
            metrics::counter!("query_pilot_empty_sql_total").increment(1);
            tracing::warn!(raw_len = raw.len(), "no SQL in model output");
            self.session.remove_notices(NOTICE_GENERATING);
            self.session.take_placeholder();
            self.session.push(ChatMessage::error(EMPTY_SQL_ERROR));
            self.session.reset_stage();
            return Vec::new();
        }
        if let Some(msg) = self.session.placeholder_mut() {
            msg.sql = sql.clone();
        }
        self.session.stage = Stage::ExecutingQuery;
        let stream_id = self.next_stream_id();
        tracing::info!(stream_id, %sql, "executing generated query");
        vec![Effect::ExecuteQuery { stream_id, sql }]
    }

    fn on_query_finished(&mut self, stream_id: u64, result: Result<QueryResult, String>) -> Vec<Effect> {
        if !self.is_current(stream_id) || self.session.stage != Stage::ExecutingQuery {
            return Vec::new();
        }
        self.session.remove_notices(NOTICE_GENERATING);
        let question = self.session.current_question.clone().unwrap_or_default();
        let history = self.session.current_history.clone();

        let request = match result {
            Ok(rows) => {
                let sql = self.session.placeholder_mut().map(|m| m.sql.clone()).unwrap_or_default();
                let table = format_table(&rows, self.max_result_rows);
                self.session.stage = Stage::StreamingSummary;
                StreamRequest::Summary { question, sql, table, history }
            }
            Err(error) => {
                metrics::counter!("query_pilot_fallbacks_total").increment(1);
                tracing::warn!(%error, "query failed, falling back to full data prompt");
                self.session.take_placeholder();
                self.session.push(ChatMessage::notice(NOTICE_FALLBACK));
                self.session.push(ChatMessage::assistant_placeholder());
                self.session.stage = Stage::StreamingFallback;
                StreamRequest::Fallback { question, history }
            }
        };
        self.session.cancel.release();
        let cancel = self.session.cancel.begin();
        let stream_id = self.next_stream_id();
        vec![Effect::StartStream { stream_id, request, cancel }]
    }

    fn finish_answer(&mut self) {
        let empty = self.session.placeholder_mut().is_none_or(|m| m.content.trim().is_empty());
        if empty {
            self.session.take_placeholder();
            self.session.push(ChatMessage::error(EMPTY_ANSWER_ERROR));
        }
        tracing::info!(stream_id = self.session.stream_id, "answer complete");
        self.session.reset_stage();
    }

    /// Transport or model failure: surface it and return to Idle.
    fn fail_run(&mut self, message: String) {
        tracing::warn!(stage = ?self.session.stage, %message, "run failed");
        self.session.remove_notices(NOTICE_GENERATING);
        // partial answers are dropped
        self.session.take_placeholder();
        self.session.push(ChatMessage::error(message));
        self.session.reset_stage();
    }
}
