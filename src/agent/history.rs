use crate::models::ChatTurn;
use crate::session::{ChatMessage, Role};

/// Prior exchanges to re-submit as model context. Errors and notices are
/// UI-only; assistant turns count once they have content; a trailing
/// placeholder of an active stage is skipped. `messages` is not modified.
pub fn build_history(messages: &[ChatMessage], stage_active: bool) -> Vec<ChatTurn> {
    let end = match messages.last() {
        Some(last) if stage_active && last.role == Role::Assistant && last.content.is_empty() => messages.len() - 1,
        _ => messages.len(),
    };
    messages[..end]
        .iter()
        .filter_map(|m| match m.role {
            Role::User => Some(ChatTurn::user(m.content.clone())),
            Role::Assistant if !m.content.is_empty() => Some(ChatTurn::assistant(m.content.clone())),
            _ => None,
        })
        .collect()
}

/// System prompt, then prior turns, then the new user turn.
pub fn assemble(system: String, history: &[ChatTurn], question: String) -> Vec<ChatTurn> {
    let mut turns = Vec::with_capacity(history.len() + 2);
    turns.push(ChatTurn::system(system));
    turns.extend_from_slice(history);
    turns.push(ChatTurn::user(question));
    turns
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TurnRole;

    fn answered(content: &str) -> ChatMessage {
        let mut m = ChatMessage::assistant_placeholder();
        m.sql = "SELECT 1".into();
        m.content = content.into();
        m
    }

    #[test]
    fn excludes_ui_only_roles() {
        let msgs = vec![
            ChatMessage::user("q1"),
            ChatMessage::notice("generating query"),
            ChatMessage::error("model returned empty SQL"),
            ChatMessage::user("q2"),
            answered("a2"),
        ];
        let turns = build_history(&msgs, false);
        assert_eq!(turns, vec![ChatTurn::user("q1"), ChatTurn::user("q2"), ChatTurn::assistant("a2")]);
    }

    #[test]
    fn excludes_only_the_active_placeholder() {
        let mut partial = ChatMessage::assistant_placeholder();
        partial.sql = "SELECT".into();
        let msgs = vec![ChatMessage::user("q1"), answered("done"), ChatMessage::user("q2"), partial];
        let before = msgs.clone();

        let turns = build_history(&msgs, true);

        assert_eq!(turns, vec![ChatTurn::user("q1"), ChatTurn::assistant("done"), ChatTurn::user("q2")]);
        assert_eq!(msgs, before);
    }

    #[test]
    fn sql_only_assistant_is_not_a_turn() {
        let mut sql_only = ChatMessage::assistant_placeholder();
        sql_only.sql = "SELECT 1".into();
        let msgs = vec![ChatMessage::user("q"), sql_only, ChatMessage::error("boom")];
        assert_eq!(build_history(&msgs, false), vec![ChatTurn::user("q")]);
    }

    #[test]
    fn assemble_orders_system_history_question() {
        let turns = assemble("sys".into(), &[ChatTurn::user("old"), ChatTurn::assistant("ans")], "new".into());
        let roles: Vec<TurnRole> = turns.iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![TurnRole::System, TurnRole::User, TurnRole::Assistant, TurnRole::User]);
        assert_eq!(turns[3].content, "new");
    }
}
