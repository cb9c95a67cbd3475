use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::agent::engine::Orchestrator;
use crate::agent::prompts::{SchemaInfo, fallback_messages, sql_messages, summary_messages};
use crate::agent::{Effect, Event, StreamRequest};
use crate::models::{ModelClient, ModelError};
use crate::query_store::{QueryStore, StoreError};
use crate::session::ChatSession;
use crate::storage::ChatPersistence;
use crate::stream::TokenSequence;

#[derive(Debug, thiserror::Error)]
enum OpenError {
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("could not read data set: {0}")]
    Store(#[from] StoreError),
    #[error("no data set is open")]
    NoDataSet,
}

/// Performs effects on background tasks and reports each outcome as one
/// [`Event`]. Never touches session state.
#[derive(Clone)]
pub struct Runtime {
    model: Arc<dyn ModelClient>,
    store: Option<Arc<dyn QueryStore>>,
    persistence: Arc<dyn ChatPersistence>,
    events: UnboundedSender<Event>,
    writes: TaskTracker,
}

impl Runtime {
    pub fn new(
        model: Arc<dyn ModelClient>,
        store: Option<Arc<dyn QueryStore>>,
        persistence: Arc<dyn ChatPersistence>,
    ) -> (Self, UnboundedReceiver<Event>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { model, store, persistence, events, writes: TaskTracker::new() }, rx)
    }

    /// Wait for outstanding persistence writes.
    pub async fn shutdown(&self) {
        self.writes.close();
        self.writes.wait().await;
    }

    pub fn model(&self) -> &Arc<dyn ModelClient> {
        &self.model
    }

    pub fn dispatch(&self, effects: Vec<Effect>) {
        for effect in effects {
            self.perform(effect);
        }
    }

    fn emit(events: &UnboundedSender<Event>, event: Event) {
        if events.send(event).is_err() {
            tracing::debug!("event loop gone, dropping event");
        }
    }

    fn perform(&self, effect: Effect) {
        let events = self.events.clone();
        match effect {
            Effect::StartStream { stream_id, request, cancel } => {
                let model = Arc::clone(&self.model);
                let store = self.store.clone();
                tokio::spawn(async move {
                    let event = match open_stream(model.as_ref(), store.as_deref(), request, cancel).await {
                        Ok(Some(sequence)) => Event::StreamStarted { stream_id, sequence },
                        Ok(None) | Err(OpenError::Model(ModelError::Cancelled)) => return,
                        Err(e) => Event::StreamFailed { stream_id, error: e.to_string() },
                    };
                    Self::emit(&events, event);
                });
            }
            Effect::ReadToken { stream_id, sequence } => {
                tokio::spawn(async move {
                    // an exhausted sequence means the stream was cancelled
                    if let Some(token) = sequence.next().await {
                        Self::emit(&events, Event::Token { stream_id, token });
                    }
                });
            }
            Effect::ExecuteQuery { stream_id, sql } => {
                let store = self.store.clone();
                tokio::spawn(async move {
                    let result = match store {
                        Some(store) => store.read_only_query(&sql).await.map_err(|e| e.to_string()),
                        None => Err(OpenError::NoDataSet.to_string()),
                    };
                    Self::emit(&events, Event::QueryFinished { stream_id, result });
                });
            }
            Effect::ListModels { purpose } => {
                let model = Arc::clone(&self.model);
                tokio::spawn(async move {
                    let limit = model.timeout();
                    let result = match tokio::time::timeout(limit, model.list_models()).await {
                        Ok(listed) => listed.map_err(|e| e.to_string()),
                        Err(_) => Err(ModelError::Timeout(limit).to_string()),
                    };
                    Self::emit(&events, Event::ModelsListed { purpose, result });
                });
            }
            Effect::StartPull { pull_id, name, cancel } => {
                let model = Arc::clone(&self.model);
                tokio::spawn(async move {
                    let event = match model.pull_model(cancel, &name).await {
                        Ok(sequence) => Event::PullStarted { pull_id, sequence },
                        Err(ModelError::Cancelled) => return,
                        Err(e) => Event::PullFailed { pull_id, error: e.to_string() },
                    };
                    Self::emit(&events, event);
                });
            }
            Effect::ReadProgress { pull_id, sequence } => {
                tokio::spawn(async move {
                    let update = sequence.next().await;
                    Self::emit(&events, Event::PullProgress { pull_id, update });
                });
            }
            Effect::ActivateModel { name } => {
                self.model.set_model(&name);
                tracing::info!(model = %name, "active model changed");
                let persistence = Arc::clone(&self.persistence);
                self.writes.spawn(async move {
                    if let Err(e) = persistence.put_last_model(&name).await {
                        tracing::warn!(error = %e, "failed to remember model");
                    }
                });
            }
            Effect::PersistInput { text } => {
                let persistence = Arc::clone(&self.persistence);
                self.writes.spawn(async move {
                    if let Err(e) = persistence.append_chat_input(&text).await {
                        tracing::warn!(error = %e, "failed to save chat input");
                    }
                });
            }
        }
    }
}

/// Build the prompt for `request` and open the model stream. `None` when
/// the run was cancelled while the prompt was being built.
async fn open_stream(
    model: &dyn ModelClient,
    store: Option<&dyn QueryStore>,
    request: StreamRequest,
    cancel: CancellationToken,
) -> Result<Option<TokenSequence>, OpenError> {
    let store = store.ok_or(OpenError::NoDataSet)?;
    let messages = match request {
        StreamRequest::Sql { question, history } => {
            let schema = SchemaInfo::load(store).await?;
            sql_messages(&schema, &history, &question)
        }
        StreamRequest::Summary { question, sql, table, history } => summary_messages(&question, &sql, &table, &history),
        StreamRequest::Fallback { question, history } => {
            let dump = store.data_dump().await?;
            fallback_messages(&dump, &history, &question)
        }
    };
    if cancel.is_cancelled() {
        return Ok(None);
    }
    Ok(Some(model.chat_stream(cancel, messages).await?))
}

/// Single owner of the session. Front ends call the operations and feed
/// events back through [`EventLoop::apply`].
pub struct EventLoop {
    pub orchestrator: Orchestrator,
    runtime: Runtime,
    events: UnboundedReceiver<Event>,
}

impl EventLoop {
    pub fn new(
        model: Arc<dyn ModelClient>,
        store: Arc<dyn QueryStore>,
        persistence: Arc<dyn ChatPersistence>,
        session: ChatSession,
        max_result_rows: usize,
    ) -> Self {
        let (runtime, events) = Runtime::new(model, Some(store), persistence);
        Self { orchestrator: Orchestrator::new(session, max_result_rows), runtime, events }
    }

    /// An event loop for model management alone. Questions fail with
    /// "no data set is open".
    pub fn without_data_set(model: Arc<dyn ModelClient>, persistence: Arc<dyn ChatPersistence>) -> Self {
        let (runtime, events) = Runtime::new(model, None, persistence);
        Self { orchestrator: Orchestrator::new(ChatSession::new(Vec::new()), 0), runtime, events }
    }

    pub fn session(&self) -> &ChatSession {
        &self.orchestrator.session
    }

    pub fn session_mut(&mut self) -> &mut ChatSession {
        &mut self.orchestrator.session
    }

    pub fn model(&self) -> &Arc<dyn ModelClient> {
        self.runtime.model()
    }

    pub fn submit(&mut self, question: &str) {
        let effects = self.orchestrator.submit(question);
        self.runtime.dispatch(effects);
    }

    pub fn cancel(&mut self) -> bool {
        self.orchestrator.cancel()
    }

    pub fn switch_model(&mut self, name: &str) {
        let effects = self.orchestrator.switch_model(name);
        self.runtime.dispatch(effects);
    }

    pub fn list_models(&mut self) {
        let effects = self.orchestrator.list_models();
        self.runtime.dispatch(effects);
    }

    pub fn pull_model(&mut self, name: &str) {
        let effects = self.orchestrator.models.pull_model(&mut self.orchestrator.session, name);
        self.runtime.dispatch(effects);
    }

    pub fn cancel_pull(&mut self) -> bool {
        self.orchestrator.cancel_pull()
    }

    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    pub fn apply(&mut self, event: Event) {
        let effects = self.orchestrator.handle(event);
        self.runtime.dispatch(effects);
    }

    /// Nothing is running: no query stage, no pull, no outstanding listing.
    pub fn is_settled(&self) -> bool {
        let session = self.session();
        !session.is_busy() && session.pull.is_none() && self.orchestrator.models.is_settled()
    }

    pub async fn shutdown(&self) {
        self.runtime.shutdown().await;
    }

    pub async fn run_until_settled(&mut self) {
        while !self.is_settled() {
            match self.events.recv().await {
                Some(event) => self.apply(event),
                None => break,
            }
        }
    }
}
