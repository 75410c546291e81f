use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the annotation database inside the data directory.
pub const ANNOTATIONS_DB: &str = "annotations.db";
/// File name of the document search index inside the data directory.
pub const SEARCH_INDEX_DB: &str = "search_index.db";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub categories: CategoriesConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    /// Directory holding both databases. `~` expands to `$HOME`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_lines_per_page")]
    pub lines_per_page: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            lines_per_page: default_lines_per_page(),
        }
    }
}

fn default_max_workers() -> usize {
    4
}
fn default_lines_per_page() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
            history_limit: default_history_limit(),
        }
    }
}

fn default_max_results() -> usize {
    50
}
fn default_history_limit() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct CategoriesConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for CategoriesConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

fn default_cache_ttl_secs() -> u64 {
    300
}

impl Config {
    /// Configuration rooted at an explicit data directory. Used by tests and
    /// by callers embedding the library.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig {
                data_dir: Some(data_dir.into()),
            },
            ..Default::default()
        }
    }

    /// Resolved data directory: the configured one, else `$HOME/.marginalia`.
    pub fn data_dir(&self) -> PathBuf {
        match &self.storage.data_dir {
            Some(dir) => expand_home(dir),
            None => home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".marginalia"),
        }
    }

    pub fn annotations_db_path(&self) -> PathBuf {
        self.data_dir().join(ANNOTATIONS_DB)
    }

    pub fn search_index_db_path(&self) -> PathBuf {
        self.data_dir().join(SEARCH_INDEX_DB)
    }

    pub fn category_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.categories.cache_ttl_secs)
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home_dir().unwrap_or_else(|| PathBuf::from(".")).join(rest),
        Err(_) => path.to_path_buf(),
    }
}

/// Load and validate a config file. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.indexing.max_workers == 0 {
        anyhow::bail!("indexing.max_workers must be >= 1");
    }
    if config.indexing.lines_per_page == 0 {
        anyhow::bail!("indexing.lines_per_page must be >= 1");
    }
    if config.search.max_results == 0 {
        anyhow::bail!("search.max_results must be >= 1");
    }
    if config.search.history_limit == 0 {
        anyhow::bail!("search.history_limit must be >= 1");
    }

    Ok(config)
}
