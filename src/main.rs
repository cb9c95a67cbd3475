use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

mod agent;
mod console;
mod models;
mod query_store;
mod runtime;
mod session;
mod settings;
mod storage;
mod stream;
#[cfg(test)]
mod testing;

use models::{ModelClient, ModelSelector, OllamaClient};
use query_store::SqliteQueryStore;
use runtime::EventLoop;
use session::ChatSession;
use settings::{CliOverrides, EffectiveSettings, FileConfig};
use storage::{ChatPersistence, NoopPersistence, SqliteChatStore};

#[derive(Debug, Parser)]
#[command(name = "query_pilot")]
#[command(about = "Ask questions about a SQLite data set in plain language", long_about = None)]
struct Cli {
    /// JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true, env = "QUERY_PILOT_BASE_URL")]
    base_url: Option<String>,
    #[arg(long, global = true, env = "QUERY_PILOT_MODEL")]
    model: Option<String>,
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,
    /// Where input history and the last used model are kept
    #[arg(long, global = true, env = "QUERY_PILOT_STATE_DB")]
    state_db: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Chat about a data set
    Chat {
        dataset: PathBuf,
        #[arg(long)]
        max_result_rows: Option<usize>,
    },
    /// List locally available models
    Models,
    /// Download a model and make it the default
    Pull { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let file = FileConfig::load(cli.config.as_deref())?;
    let max_result_rows = match &cli.command {
        Commands::Chat { max_result_rows, .. } => *max_result_rows,
        _ => None,
    };
    let overrides = CliOverrides {
        base_url: cli.base_url,
        model: cli.model,
        timeout_secs: cli.timeout_secs,
        state_db: cli.state_db,
        max_result_rows,
    };
    let settings = settings::resolve_effective_settings(&file, &overrides)?;

    let persistence = open_persistence(&settings).await;
    let last_model = persistence.last_model().await.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "could not read last model");
        None
    });
    let model = ModelSelector::select(settings.model_override.clone(), last_model, settings.config_model.clone());
    let client = Arc::new(OllamaClient::new(settings.base_url.clone(), model, settings.timeout)?);
    tracing::info!(base_url = %settings.base_url, model = %client.model(), "model client ready");

    match cli.command {
        Commands::Chat { dataset, .. } => {
            let store = SqliteQueryStore::open(&dataset, settings.dump_rows_per_table).await?;
            let history = persistence.load_chat_history(settings.history_limit).await.unwrap_or_else(|e| {
                tracing::warn!(error = %e, "could not load input history");
                Vec::new()
            });
            let event_loop = EventLoop::new(
                client,
                Arc::new(store),
                persistence,
                ChatSession::new(history),
                settings.max_result_rows,
            );
            console::run(event_loop).await?;
        }
        Commands::Models => {
            let active = client.model();
            let limit = client.timeout();
            let names = tokio::time::timeout(limit, client.list_models())
                .await
                .map_err(|_| models::ModelError::Timeout(limit))??;
            for name in names {
                let marker = if name == active { "*" } else { " " };
                println!("{marker} {name}");
            }
        }
        Commands::Pull { name } => pull(EventLoop::without_data_set(client, persistence), &name).await?,
    }
    Ok(())
}

async fn open_persistence(settings: &EffectiveSettings) -> Arc<dyn ChatPersistence> {
    match SqliteChatStore::initialize(settings.state_db_url.clone()).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::warn!(error = %e, "state database unavailable, history will not be kept");
            Arc::new(NoopPersistence)
        }
    }
}

/// Download `name` through the same lifecycle the chat uses, printing
/// progress until the pull settles. Ctrl-C stops it.
async fn pull(mut event_loop: EventLoop, name: &str) -> anyhow::Result<()> {
    event_loop.pull_model(name);
    let mut shown: Option<String> = None;
    while !event_loop.is_settled() {
        tokio::select! {
            event = event_loop.next_event() => match event {
                Some(event) => event_loop.apply(event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                event_loop.cancel_pull();
            }
        }
        let line = event_loop.session().pull.as_ref().map(|p| p.display_line());
        if let Some(text) = line.as_ref().filter(|l| shown.as_ref() != Some(*l)) {
            println!("{text}");
        }
        shown = line;
    }
    event_loop.shutdown().await;

    let Some(last) = event_loop.session().messages.last() else {
        anyhow::bail!("pull of {name} did not finish");
    };
    if !last.is_notice(&format!("pulled {name}")) {
        anyhow::bail!("{}", last.content);
    }
    println!("{}", last.content);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::PullUpdate;
    use crate::testing::{FakeModel, FakePersistence};

    fn pull_loop(updates: Vec<PullUpdate>) -> (EventLoop, Arc<FakeModel>, Arc<FakePersistence>) {
        let model = Arc::new(FakeModel::new(Vec::new()).with_pull(updates));
        let persistence = Arc::new(FakePersistence::default());
        (EventLoop::without_data_set(model.clone(), persistence.clone()), model, persistence)
    }

    #[tokio::test]
    async fn pull_command_activates_and_remembers_model() {
        let (event_loop, model, persistence) = pull_loop(vec![
            PullUpdate::status("pulling manifest"),
            PullUpdate::bytes("downloading", 50, 100),
            PullUpdate::status("success"),
        ]);
        pull(event_loop, "mistral").await.unwrap();
        assert_eq!(model.pulls(), vec!["mistral".to_string()]);
        assert_eq!(model.model(), "mistral");
        assert_eq!(persistence.stored_model().as_deref(), Some("mistral"));
    }

    #[tokio::test]
    async fn pull_command_reports_lifecycle_errors() {
        let (event_loop, model, persistence) = pull_loop(vec![PullUpdate::status("pulling manifest")]);
        let err = pull(event_loop, "mistral").await.unwrap_err();
        assert_eq!(err.to_string(), "pull of mistral ended before completion");
        assert_eq!(model.model(), "qwen2.5:7b");
        assert!(persistence.stored_model().is_none());

        let failed = PullUpdate { error: Some("file does not exist".into()), ..Default::default() };
        let (event_loop, _, _) = pull_loop(vec![failed]);
        let err = pull(event_loop, "nonexistent").await.unwrap_err();
        assert_eq!(err.to_string(), "pull of nonexistent failed: file does not exist");
    }
}
