use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::{DEFAULT_BASE_URL, DEFAULT_TIMEOUT};
use crate::query_store::DEFAULT_DUMP_ROWS_PER_TABLE;

pub const DEFAULT_MAX_RESULT_ROWS: usize = 50;
pub const DEFAULT_HISTORY_LIMIT: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ModelSettings {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct QuerySettings {
    pub max_result_rows: Option<usize>,
    pub dump_rows_per_table: Option<usize>,
}

/// Contents of the optional JSON config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FileConfig {
    pub model: Option<ModelSettings>,
    pub query: Option<QuerySettings>,
    pub state_db: Option<String>,
    pub history_limit: Option<usize>,
}

impl FileConfig {
    /// Load `path`, or the default location when `path` is `None`. A missing
    /// default file is not an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match default_config_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };
        if !required && !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
        let cfg = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))?;
        tracing::debug!(path = %path.display(), "config loaded");
        Ok(cfg)
    }
}

fn default_config_path() -> Option<PathBuf> {
    let base = std::env::var("XDG_CONFIG_HOME").ok().map(PathBuf::from).or_else(|| {
        std::env::var("HOME").ok().map(|home| PathBuf::from(home).join(".config"))
    })?;
    Some(base.join("query_pilot").join("config.json"))
}

/// Values given on the command line or through the environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CliOverrides {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub timeout_secs: Option<u64>,
    pub state_db: Option<String>,
    pub max_result_rows: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveSettings {
    pub base_url: String,
    /// Explicitly requested model, before falling back to the persisted one.
    pub model_override: Option<String>,
    pub config_model: Option<String>,
    pub timeout: Duration,
    pub state_db_url: Option<String>,
    pub max_result_rows: usize,
    pub dump_rows_per_table: usize,
    pub history_limit: usize,
}

pub fn resolve_effective_settings(file: &FileConfig, cli: &CliOverrides) -> anyhow::Result<EffectiveSettings> {
    let base_url = cli
        .base_url
        .clone()
        .or_else(|| file.model.as_ref().and_then(|m| m.base_url.clone()))
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    let parsed = url::Url::parse(&base_url).map_err(|e| anyhow::anyhow!("invalid base url {base_url}: {e}"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        anyhow::bail!("base url must be http(s): {base_url}");
    }

    let timeout = cli
        .timeout_secs
        .or_else(|| file.model.as_ref().and_then(|m| m.timeout_secs))
        .filter(|s| *s > 0)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TIMEOUT);

    let state_db_url = cli
        .state_db
        .clone()
        .or_else(|| file.state_db.clone())
        .map(|p| if p.starts_with("sqlite:") { p } else { format!("sqlite://{p}") });

    Ok(EffectiveSettings {
        base_url,
        model_override: cli.model.clone(),
        config_model: file.model.as_ref().and_then(|m| m.model.clone()),
        timeout,
        state_db_url,
        max_result_rows: cli
            .max_result_rows
            .or_else(|| file.query.as_ref().and_then(|q| q.max_result_rows))
            .unwrap_or(DEFAULT_MAX_RESULT_ROWS),
        dump_rows_per_table: file
            .query
            .as_ref()
            .and_then(|q| q.dump_rows_per_table)
            .unwrap_or(DEFAULT_DUMP_ROWS_PER_TABLE),
        history_limit: file.history_limit.unwrap_or(DEFAULT_HISTORY_LIMIT),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn precedence_cli_over_file_over_defaults() {
        let file = FileConfig {
            model: Some(ModelSettings {
                base_url: Some("http://gpu-box:11434".into()),
                model: Some("file-model".into()),
                timeout_secs: Some(30),
            }),
            query: Some(QuerySettings { max_result_rows: Some(10), dump_rows_per_table: None }),
            state_db: Some("/tmp/state.db".into()),
            history_limit: None,
        };
        let cli = CliOverrides {
            base_url: None,
            model: Some("cli-model".into()),
            timeout_secs: None,
            state_db: None,
            max_result_rows: Some(25),
        };

        let eff = resolve_effective_settings(&file, &cli).unwrap();

        assert_eq!(eff.base_url, "http://gpu-box:11434"); // from file
        assert_eq!(eff.model_override.as_deref(), Some("cli-model"));
        assert_eq!(eff.config_model.as_deref(), Some("file-model"));
        assert_eq!(eff.timeout, Duration::from_secs(30)); // from file
        assert_eq!(eff.state_db_url.as_deref(), Some("sqlite:///tmp/state.db"));
        assert_eq!(eff.max_result_rows, 25); // from cli
        assert_eq!(eff.dump_rows_per_table, DEFAULT_DUMP_ROWS_PER_TABLE);
        assert_eq!(eff.history_limit, DEFAULT_HISTORY_LIMIT);
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let eff = resolve_effective_settings(&FileConfig::default(), &CliOverrides::default()).unwrap();
        assert_eq!(eff.base_url, DEFAULT_BASE_URL);
        assert_eq!(eff.timeout, DEFAULT_TIMEOUT);
        assert_eq!(eff.state_db_url, None);
        assert_eq!(eff.max_result_rows, DEFAULT_MAX_RESULT_ROWS);
    }

    #[test]
    fn rejects_bad_base_url() {
        let cli = CliOverrides { base_url: Some("ftp://host".into()), ..Default::default() };
        assert!(resolve_effective_settings(&FileConfig::default(), &cli).is_err());
        let cli = CliOverrides { base_url: Some("not a url".into()), ..Default::default() };
        assert!(resolve_effective_settings(&FileConfig::default(), &cli).is_err());
    }

    #[test]
    fn load_reads_explicit_file_and_requires_it() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"model": {"model": "llama3.2"}, "history_limit": 20}"#).unwrap();
        let cfg = FileConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.model.unwrap().model.as_deref(), Some("llama3.2"));
        assert_eq!(cfg.history_limit, Some(20));

        assert!(FileConfig::load(Some(&dir.path().join("missing.json"))).is_err());
    }
}
