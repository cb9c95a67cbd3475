use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Pool, Row, Sqlite, TypeInfo, ValueRef};

pub const DEFAULT_DUMP_ROWS_PER_TABLE: usize = 200;
const HINT_MAX_DISTINCT: i64 = 12;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("only a single SELECT statement is allowed")]
    NotReadOnly,
    #[error("unknown table: {0}")]
    UnknownTable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub decl_type: String,
}

/// Read-only view of the data set the pipeline answers questions about.
#[async_trait]
pub trait QueryStore: Send + Sync {
    async fn read_only_query(&self, sql: &str) -> Result<QueryResult, StoreError>;
    async fn table_names(&self) -> Result<Vec<String>, StoreError>;
    async fn table_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, StoreError>;
    async fn column_hints(&self) -> Result<Vec<String>, StoreError>;
    async fn data_dump(&self) -> Result<String, StoreError>;
}

#[derive(Clone)]
pub struct SqliteQueryStore {
    pool: Pool<Sqlite>,
    dump_rows_per_table: usize,
}

impl SqliteQueryStore {
    pub async fn open(path: &Path, dump_rows_per_table: usize) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::new().filename(path).read_only(true);
        let pool = SqlitePoolOptions::new().max_connections(2).connect_with(options).await?;
        tracing::info!(path = %path.display(), "data set opened read-only");
        Ok(Self { pool, dump_rows_per_table })
    }

    async fn select(&self, sql: &str) -> Result<QueryResult, StoreError> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        let columns = match rows.first() {
            Some(r) => r.columns().iter().map(|c| c.name().to_string()).collect(),
            None => Vec::new(),
        };
        let rows = rows.iter().map(render_row).collect();
        Ok(QueryResult { columns, rows })
    }
}

/// Strip one optional trailing semicolon and accept only a single
/// SELECT/WITH statement.
pub fn validate_read_only(sql: &str) -> Result<&str, StoreError> {
    let trimmed = sql.trim();
    let body = trimmed.strip_suffix(';').unwrap_or(trimmed).trim_end();
    if body.is_empty() || body.contains(';') {
        return Err(StoreError::NotReadOnly);
    }
    let first = body.split_whitespace().next().unwrap_or_default().to_ascii_uppercase();
    if first != "SELECT" && first != "WITH" {
        return Err(StoreError::NotReadOnly);
    }
    Ok(body)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn render_row(row: &SqliteRow) -> Vec<String> {
    (0..row.len()).map(|i| render_cell(row, i)).collect()
}

fn render_cell(row: &SqliteRow, i: usize) -> String {
    let Ok(raw) = row.try_get_raw(i) else { return String::new() };
    if raw.is_null() {
        return String::new();
    }
    let kind = raw.type_info().name().to_ascii_uppercase();
    match kind.as_str() {
        "INTEGER" | "INT" | "BIGINT" | "BOOLEAN" => {
            row.try_get_unchecked::<i64, _>(i).map(|v| v.to_string()).unwrap_or_default()
        }
        "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => {
            row.try_get_unchecked::<f64, _>(i).map(|v| v.to_string()).unwrap_or_default()
        }
        "BLOB" => row
            .try_get_unchecked::<Vec<u8>, _>(i)
            .map(|v| format!("<{} bytes>", v.len()))
            .unwrap_or_default(),
        _ => row.try_get_unchecked::<String, _>(i).unwrap_or_default(),
    }
}

/// Render a result as a pipe-separated text table, keeping at most `max_rows`.
pub fn format_table(result: &QueryResult, max_rows: usize) -> String {
    if result.columns.is_empty() {
        return "(no rows)".to_string();
    }
    let mut out = result.columns.join(" | ");
    out.push('\n');
    out.push_str(&result.columns.iter().map(|c| "-".repeat(c.len().max(3))).collect::<Vec<_>>().join(" | "));
    for row in result.rows.iter().take(max_rows) {
        out.push('\n');
        out.push_str(&row.join(" | "));
    }
    if result.rows.len() > max_rows {
        out.push_str(&format!("\n... {} more rows", result.rows.len() - max_rows));
    }
    out
}

#[async_trait]
impl QueryStore for SqliteQueryStore {
    async fn read_only_query(&self, sql: &str) -> Result<QueryResult, StoreError> {
        let body = validate_read_only(sql)?;
        self.select(body).await
    }

    async fn table_names(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '_sqlx%' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>("name")).collect())
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, StoreError> {
        let rows = sqlx::query(&format!("PRAGMA table_info({})", quote_ident(table)))
            .fetch_all(&self.pool)
            .await?;
        if rows.is_empty() {
            return Err(StoreError::UnknownTable(table.to_string()));
        }
        Ok(rows
            .into_iter()
            .map(|r| ColumnInfo { name: r.get::<String, _>("name"), decl_type: r.get::<String, _>("type") })
            .collect())
    }

    async fn column_hints(&self) -> Result<Vec<String>, StoreError> {
        let mut hints = Vec::new();
        for table in self.table_names().await? {
            for col in self.table_columns(&table).await? {
                if col.name.ends_with("_cents") {
                    hints.push(format!("{table}.{}: integer cents, divide by 100 for currency", col.name));
                    continue;
                }
                if !col.decl_type.to_ascii_uppercase().contains("TEXT") {
                    continue;
                }
                let column = quote_ident(&col.name);
                let sql = format!(
                    "SELECT DISTINCT {column} AS v FROM {} WHERE {column} IS NOT NULL AND {column} <> '' ORDER BY v LIMIT {}",
                    quote_ident(&table),
                    HINT_MAX_DISTINCT + 1
                );
                let values: Vec<String> = sqlx::query(&sql)
                    .fetch_all(&self.pool)
                    .await?
                    .iter()
                    .map(|r| render_cell(r, 0))
                    .collect();
                if !values.is_empty() && values.len() as i64 <= HINT_MAX_DISTINCT {
                    let listed = values.iter().map(|v| format!("'{}'", v.replace('\'', "''"))).collect::<Vec<_>>();
                    hints.push(format!("{table}.{}: one of {}", col.name, listed.join(", ")));
                }
            }
        }
        Ok(hints)
    }

    async fn data_dump(&self) -> Result<String, StoreError> {
        let mut sections = Vec::new();
        for table in self.table_names().await? {
            let sql = format!("SELECT * FROM {} LIMIT {}", quote_ident(&table), self.dump_rows_per_table + 1);
            let mut result = self.select(&sql).await?;
            if result.columns.is_empty() {
                result.columns = self.table_columns(&table).await?.into_iter().map(|c| c.name).collect();
            }
            sections.push(format!("## {table}\n{}", format_table(&result, self.dump_rows_per_table)));
        }
        Ok(sections.join("\n\n"))
    }
}

#[cfg(test)]
pub(crate) async fn seed_service_log(path: &Path) {
    let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
    let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await.unwrap();
    sqlx::query(
        "CREATE TABLE service_log (id INTEGER PRIMARY KEY, category TEXT NOT NULL, vendor TEXT, cost_cents INTEGER NOT NULL, notes BLOB)",
    )
    .execute(&pool)
    .await
    .unwrap();
    for (category, vendor, cost) in [("HVAC", "Cool Air", 12000), ("HVAC", "Cool Air", 8550), ("Plumbing", "Pipes Inc", 4000)] {
        sqlx::query("INSERT INTO service_log (category, vendor, cost_cents) VALUES (?1, ?2, ?3)")
            .bind(category)
            .bind(vendor)
            .bind(cost)
            .execute(&pool)
            .await
            .unwrap();
    }
    pool.close().await;
}
