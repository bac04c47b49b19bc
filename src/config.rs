//! Application configuration, read from a JSON file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::transactions::{CodecKind, ShardLayout};
use crate::views::ViewsConfig;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Root directory of the transaction log
    pub log_dir: PathBuf,
    pub codec: CodecKind,
    pub records_per_chapter: u64,
    pub chapters_per_volume: u64,
    /// SQLite database holding the views
    pub view_database: PathBuf,
    /// View definitions; no views are projected without it
    pub views_file: Option<PathBuf>,
    /// Linked entities kept per row in a join materialization
    pub max_join_items: usize,
    pub page_request_timeout_ms: u64,
    pub count_request_timeout_ms: u64,
    /// IRI prefix of files and directories; the first path segment below it is the collection
    pub resource_root: String,
}

impl Default for Config {
    fn default() -> Self {
        let layout = ShardLayout::default();
        Self {
            log_dir: PathBuf::from("data/log"),
            codec: CodecKind::Text,
            records_per_chapter: layout.records_per_chapter,
            chapters_per_volume: layout.chapters_per_volume,
            view_database: PathBuf::from("data/views.db"),
            views_file: None,
            max_join_items: 50,
            page_request_timeout_ms: 10_000,
            count_request_timeout_ms: 60_000,
            resource_root: "http://localhost:8080/api/webdav/".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.records_per_chapter == 0 || self.chapters_per_volume == 0 {
            return Err(Error::Config("Shard sizes must be positive".into()));
        }
        if self.max_join_items == 0 {
            return Err(Error::Config("maxJoinItems must be positive".into()));
        }
        if self.page_request_timeout_ms == 0 || self.count_request_timeout_ms == 0 {
            return Err(Error::Config("Request timeouts must be positive".into()));
        }
        if !self.resource_root.ends_with('/') {
            return Err(Error::Config(format!(
                "Resource root {} must end with '/'",
                self.resource_root
            )));
        }
        Ok(())
    }

    pub fn shard_layout(&self) -> ShardLayout {
        ShardLayout {
            records_per_chapter: self.records_per_chapter,
            chapters_per_volume: self.chapters_per_volume,
        }
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_millis(self.page_request_timeout_ms)
    }

    pub fn count_timeout(&self) -> Duration {
        Duration::from_millis(self.count_request_timeout_ms)
    }

    /// The configured view definitions, validated; empty without a views file
    pub fn load_views(&self) -> Result<ViewsConfig> {
        match &self.views_file {
            Some(path) => ViewsConfig::load(path),
            None => Ok(ViewsConfig::default()),
        }
    }
}
