use tokio_util::sync::CancellationToken;

use crate::agent::{Effect, ListPurpose};
use crate::models::ModelSelector;
use crate::session::{ChatMessage, ChatSession, ModelPullState};
use crate::stream::{ProgressSequence, PullUpdate};

/// Lists, switches and downloads models. Works on the session's `pull`
/// sub-state only; the query pipeline's stage is never touched.
#[derive(Debug, Default)]
pub struct ModelManager {
    next_pull_id: u64,
    pending_lists: usize,
}

impl ModelManager {
    /// No listing is outstanding.
    pub fn is_settled(&self) -> bool {
        self.pending_lists == 0
    }

    pub fn list_models(&mut self) -> Vec<Effect> {
        self.pending_lists += 1;
        vec![Effect::ListModels { purpose: ListPurpose::Display }]
    }

    /// Activate `name` if it is available locally, otherwise pull it.
    pub fn switch_model(&mut self, session: &mut ChatSession, name: &str) -> Vec<Effect> {
        let name = name.trim();
        if name.is_empty() {
            session.push_aside(ChatMessage::notice("usage: /model <name>"));
            return Vec::new();
        }
        if reject_while_pulling(session) {
            return Vec::new();
        }
        self.pending_lists += 1;
        vec![Effect::ListModels { purpose: ListPurpose::Switch(name.to_string()) }]
    }

    pub fn on_models_listed(
        &mut self,
        session: &mut ChatSession,
        purpose: ListPurpose,
        result: Result<Vec<String>, String>,
    ) -> Vec<Effect> {
        self.pending_lists = self.pending_lists.saturating_sub(1);
        match (purpose, result) {
            (ListPurpose::Display, Ok(names)) if names.is_empty() => {
                session.push_aside(ChatMessage::notice("no local models"));
                Vec::new()
            }
            (ListPurpose::Display, Ok(names)) => {
                session.push_aside(ChatMessage::notice(format!("local models: {}", names.join(", "))));
                Vec::new()
            }
            (ListPurpose::Display, Err(e)) => {
                session.push_aside(ChatMessage::error(format!("could not list models: {e}")));
                Vec::new()
            }
            (ListPurpose::Switch(name), Err(e)) => {
                tracing::warn!(model = %name, error = %e, "model listing failed during switch");
                session.push_aside(ChatMessage::error(format!("could not switch to {name}: {e}")));
                Vec::new()
            }
            (ListPurpose::Switch(name), Ok(names)) => {
                if reject_while_pulling(session) {
                    return Vec::new();
                }
                match ModelSelector::find_local(&name, &names) {
                    Some(local) => {
                        tracing::info!(requested = %name, model = %local, "switching to local model");
                        session.push_aside(ChatMessage::notice(format!("switched to {local}")));
                        vec![Effect::ActivateModel { name: local }]
                    }
                    None => self.pull_model(session, &name),
                }
            }
        }
    }

    /// Begin downloading `name`. Only one pull may be in flight.
    pub fn pull_model(&mut self, session: &mut ChatSession, name: &str) -> Vec<Effect> {
        if reject_while_pulling(session) {
            return Vec::new();
        }
        self.next_pull_id += 1;
        let pull_id = self.next_pull_id;
        let cancel = CancellationToken::new();
        session.pull = Some(ModelPullState::new(pull_id, name, cancel.clone()));
        tracing::info!(pull_id, model = %name, "pulling model");
        vec![Effect::StartPull { pull_id, name: name.to_string(), cancel }]
    }

    pub fn on_pull_started(&mut self, session: &mut ChatSession, pull_id: u64, sequence: ProgressSequence) -> Vec<Effect> {
        let Some(pull) = current_pull(session, pull_id) else { return Vec::new() };
        pull.progress = Some(sequence.clone());
        vec![Effect::ReadProgress { pull_id, sequence }]
    }

    pub fn on_pull_failed(&mut self, session: &mut ChatSession, pull_id: u64, error: &str) {
        if let Some(name) = end_pull(session, pull_id, "failed") {
            session.push_aside(ChatMessage::error(format!("pull of {name} failed: {error}")));
        }
    }

    pub fn on_pull_progress(&mut self, session: &mut ChatSession, pull_id: u64, update: Option<PullUpdate>) -> Vec<Effect> {
        let Some(pull) = current_pull(session, pull_id) else { return Vec::new() };
        let mut update = match update {
            Some(update) => update,
            None => {
                if let Some(name) = end_pull(session, pull_id, "failed") {
                    session.push_aside(ChatMessage::error(format!("pull of {name} ended before completion")));
                }
                return Vec::new();
            }
        };
        if let Some(error) = update.error.take() {
            if let Some(name) = end_pull(session, pull_id, "failed") {
                session.push_aside(ChatMessage::error(format!("pull of {name} failed: {error}")));
            }
            return Vec::new();
        }

        let percent = pull.observe(&update);
        tracing::debug!(pull_id, status = %pull.status, percent, "pull progress");
        if !pull.succeeded {
            return match pull.progress.clone() {
                Some(sequence) => vec![Effect::ReadProgress { pull_id, sequence }],
                None => Vec::new(),
            };
        }
        match end_pull(session, pull_id, "success") {
            Some(name) => {
                session.push_aside(ChatMessage::notice(format!("pulled {name}")));
                vec![Effect::ActivateModel { name }]
            }
            None => Vec::new(),
        }
    }

    /// Stop the in-flight pull, if any.
    pub fn cancel_pull(&mut self, session: &mut ChatSession) -> bool {
        let Some(pull) = session.pull.as_ref() else { return false };
        let pull_id = pull.pull_id;
        let Some(name) = end_pull(session, pull_id, "cancelled") else { return false };
        if session.visible {
            session.push_aside(ChatMessage::notice(format!("pull of {name} cancelled")));
        }
        true
    }
}

fn current_pull(session: &mut ChatSession, pull_id: u64) -> Option<&mut ModelPullState> {
    let pull = session.pull.as_mut().filter(|p| p.pull_id == pull_id);
    if pull.is_none() {
        tracing::debug!(pull_id, "dropping stale pull event");
    }
    pull
}

/// Clear the pull state and stop its producer. Returns the model name.
fn end_pull(session: &mut ChatSession, pull_id: u64, outcome: &'static str) -> Option<String> {
    let pull = session.pull.take_if(|p| p.pull_id == pull_id)?;
    pull.cancel.cancel();
    metrics::counter!("query_pilot_pulls_total", "outcome" => outcome).increment(1);
    tracing::info!(pull_id, model = %pull.model_name, outcome, "pull finished");
    Some(pull.model_name)
}

fn reject_while_pulling(session: &mut ChatSession) -> bool {
    let Some(name) = session.pull.as_ref().map(|p| p.model_name.clone()) else { return false };
    session.push_aside(ChatMessage::notice(format!("already pulling {name}")));
    true
}
