use chrono::Local;

use super::history::assemble;
use crate::models::ChatTurn;
use crate::query_store::{ColumnInfo, QueryStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

/// Store metadata used only to build the SQL-generation prompt.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SchemaInfo {
    pub tables: Vec<TableSchema>,
    pub hints: Vec<String>,
}

impl SchemaInfo {
    pub async fn load(store: &dyn QueryStore) -> Result<Self, StoreError> {
        let mut tables = Vec::new();
        for name in store.table_names().await? {
            let columns = store.table_columns(&name).await?;
            tables.push(TableSchema { name, columns });
        }
        let hints = store.column_hints().await?;
        Ok(Self { tables, hints })
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for t in &self.tables {
            let cols: Vec<String> = t
                .columns
                .iter()
                .map(|c| if c.decl_type.is_empty() { c.name.clone() } else { format!("{} {}", c.name, c.decl_type) })
                .collect();
            out.push_str(&format!("{}({})\n", t.name, cols.join(", ")));
        }
        if !self.hints.is_empty() {
            out.push_str("\nColumn notes:\n");
            for h in &self.hints {
                out.push_str(&format!("- {h}\n"));
            }
        }
        out
    }
}

fn today() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

pub fn sql_messages(schema: &SchemaInfo, history: &[ChatTurn], question: &str) -> Vec<ChatTurn> {
    let system = format!(
        "You translate questions about a SQLite database into one SQLite SELECT statement.\n\
         Reply with the SQL only. Never modify data.\n\
         Today's date is {}.\n\n\
         Tables:\n{}",
        today(),
        schema.render()
    );
    assemble(system, history, question.to_string())
}

pub fn summary_messages(question: &str, sql: &str, table: &str, history: &[ChatTurn]) -> Vec<ChatTurn> {
    let system = "You answer questions about the user's data from query results. \
                  Answer in plain language and keep it short. Do not show the SQL unless asked."
        .to_string();
    let user = format!("Question: {question}\n\nQuery:\n{sql}\n\nResults:\n{table}");
    assemble(system, history, user)
}

pub fn fallback_messages(dump: &str, history: &[ChatTurn], question: &str) -> Vec<ChatTurn> {
    let system = format!(
        "You answer questions about the user's data. The complete data set follows.\n\
         Today's date is {}.\n\n{dump}",
        today()
    );
    assemble(system, history, question.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TurnRole;

    fn schema() -> SchemaInfo {
        SchemaInfo {
            tables: vec![TableSchema {
                name: "service_log".into(),
                columns: vec![
                    ColumnInfo { name: "category".into(), decl_type: "TEXT".into() },
                    ColumnInfo { name: "cost_cents".into(), decl_type: "INTEGER".into() },
                ],
            }],
            hints: vec!["service_log.category: one of 'HVAC'".into()],
        }
    }

    #[test]
    fn sql_prompt_carries_schema_and_hints() {
        let turns = sql_messages(&schema(), &[ChatTurn::user("earlier")], "how much on HVAC?");
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].role, TurnRole::System);
        assert!(turns[0].content.contains("service_log(category TEXT, cost_cents INTEGER)"));
        assert!(turns[0].content.contains("- service_log.category: one of 'HVAC'"));
        assert_eq!(turns[2], ChatTurn::user("how much on HVAC?"));
    }

    #[test]
    fn summary_prompt_embeds_results() {
        let turns = summary_messages("q?", "SELECT 1", "n\n---\n1", &[]);
        assert_eq!(turns.len(), 2);
        assert!(turns[1].content.contains("Query:\nSELECT 1"));
        assert!(turns[1].content.ends_with("Results:\nn\n---\n1"));
    }

    #[test]
    fn fallback_prompt_embeds_dump() {
        let turns = fallback_messages("## service_log\nid\n---\n1", &[], "q?");
        assert!(turns[0].content.contains("## service_log"));
        assert_eq!(turns[1], ChatTurn::user("q?"));
    }
}
