use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ArchivistConfig {
    pub general: GeneralConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub librarian: LibrarianConfig,
    pub ranker: RankerConfig,
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,
    /// Default tenant for rows written from the CLI.
    pub user_id: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// Path of the authoritative store. `None` means this node runs
    /// local-only (no failover pair).
    pub primary_db_path: Option<String>,
    /// Path of the local replica, also the store used when the probe fails.
    pub local_db_path: String,
    /// Presence probe target. When unset, the local store is always used.
    pub probe_host: Option<String>,
    pub probe_port: u16,
    pub probe_timeout_s: u64,
    /// How far back the primary→local tail sync reaches.
    pub retention_sync_window_days: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub base_url: String,
    pub dimensions: usize,
    pub max_input_chars: usize,
    pub request_timeout_s: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LibrarianConfig {
    pub workers: usize,
    /// High-water-mark scan cadence for freshly inserted rows.
    pub poll_interval_s: u64,
    /// Full stale-sweep cadence, catches content updates.
    pub freshness_sweep_interval_s: u64,
    pub max_attempts: u32,
    pub min_embed_len: usize,
    pub chunk_max: usize,
    pub chunk_overlap: usize,
    /// Advisory: drop to one worker when free VRAM is below this floor.
    pub min_free_vram_mb: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RankerConfig {
    pub model: String,
    pub base_url: String,
    pub workers: usize,
    pub batch_size: usize,
    pub page_size: usize,
    pub request_timeout_s: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub token_budget_default: usize,
    pub chars_per_token_estimate: usize,
    /// Candidate count for semantic search before the budget walk.
    pub search_k: usize,
    /// Ordered namespace priority list for priority-mode context loading.
    pub namespace_priority_list: Vec<PriorityEntry>,
}

/// One `(namespace, limit, label)` tuple of the priority list.
#[derive(Debug, Deserialize, Clone)]
pub struct PriorityEntry {
    pub namespace: String,
    pub limit: usize,
    pub label: String,
}

impl Default for ArchivistConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            storage: StorageConfig::default(),
            embedding: EmbeddingConfig::default(),
            librarian: LibrarianConfig::default(),
            ranker: RankerConfig::default(),
            retrieval: RetrievalConfig::default(),
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            user_id: "agent".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let local_db_path = default_archivist_dir()
            .join("memory.db")
            .to_string_lossy()
            .into_owned();
        Self {
            primary_db_path: None,
            local_db_path,
            probe_host: None,
            probe_port: 5433,
            probe_timeout_s: 3,
            retention_sync_window_days: 7,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".into(),
            model: "nomic-embed-text:v1.5".into(),
            base_url: "http://localhost:11434".into(),
            dimensions: 768,
            max_input_chars: 32_000,
            request_timeout_s: 30,
        }
    }
}

impl Default for LibrarianConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval_s: 5,
            freshness_sweep_interval_s: 60,
            max_attempts: 5,
            min_embed_len: 1,
            chunk_max: 4000,
            chunk_overlap: 200,
            min_free_vram_mb: None,
        }
    }
}

impl Default for RankerConfig {
    fn default() -> Self {
        Self {
            model: "llama3.1:latest".into(),
            base_url: "http://localhost:11434".into(),
            workers: 4,
            batch_size: 10,
            page_size: 500,
            request_timeout_s: 30,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            token_budget_default: 75_000,
            chars_per_token_estimate: 4,
            search_k: 50,
            namespace_priority_list: default_priority_list(),
        }
    }
}

/// Priority loading order: most important namespaces first.
pub fn default_priority_list() -> Vec<PriorityEntry> {
    [
        ("core_identity", 10, "Constitution & Identity"),
        ("ingested", 50, "Operational Frameworks"),
        ("logical-wolf", 20, "System Notes"),
        ("session_recovery", 200, "Recent Conversations"),
        ("imported", 100, "Knowledge & Preferences"),
    ]
    .into_iter()
    .map(|(namespace, limit, label)| PriorityEntry {
        namespace: namespace.into(),
        limit,
        label: label.into(),
    })
    .collect()
}

/// Returns `~/.archivist/`
pub fn default_archivist_dir() -> PathBuf {
    dirs::home_dir()
        .expect("home directory must exist")
        .join(".archivist")
}

/// Returns the default config file path: `~/.archivist/config.toml`
pub fn default_config_path() -> PathBuf {
    default_archivist_dir().join("config.toml")
}

impl ArchivistConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            ArchivistConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (ARCHIVIST_DB, ARCHIVIST_USER,
    /// ARCHIVIST_LOG_LEVEL, ARCHIVIST_OLLAMA_URL).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("ARCHIVIST_DB") {
            self.storage.local_db_path = val;
        }
        if let Ok(val) = std::env::var("ARCHIVIST_USER") {
            self.general.user_id = val;
        }
        if let Ok(val) = std::env::var("ARCHIVIST_LOG_LEVEL") {
            self.general.log_level = val;
        }
        if let Ok(val) = std::env::var("ARCHIVIST_OLLAMA_URL") {
            self.embedding.base_url = val.clone();
            self.ranker.base_url = val;
        }
    }

    /// Resolve the local database path, expanding `~` if needed.
    pub fn resolved_local_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.local_db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .expect("home directory must exist")
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ArchivistConfig::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.embedding.dimensions, 768);
        assert_eq!(config.librarian.workers, 4);
        assert_eq!(config.ranker.batch_size, 10);
        assert_eq!(config.retrieval.token_budget_default, 75_000);
        assert!(config.storage.local_db_path.ends_with("memory.db"));
    }

    #[test]
    fn default_priority_list_order() {
        let list = default_priority_list();
        assert_eq!(list.len(), 5);
        assert_eq!(list[0].namespace, "core_identity");
        assert_eq!(list[0].limit, 10);
        assert_eq!(list[3].namespace, "session_recovery");
        assert_eq!(list[3].limit, 200);
        assert_eq!(list[4].namespace, "imported");
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[general]
log_level = "debug"

[storage]
local_db_path = "/tmp/test.db"
probe_host = "10.0.0.5"
probe_port = 5433

[embedding]
model = "qwen3-embedding:4b"
dimensions = 2560

[retrieval]
token_budget_default = 1000

[[retrieval.namespace_priority_list]]
namespace = "core_identity"
limit = 1
label = "Identity"
"#;
        let config: ArchivistConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.storage.local_db_path, "/tmp/test.db");
        assert_eq!(config.storage.probe_host.as_deref(), Some("10.0.0.5"));
        assert_eq!(config.embedding.dimensions, 2560);
        assert_eq!(config.retrieval.token_budget_default, 1000);
        assert_eq!(config.retrieval.namespace_priority_list.len(), 1);
        // defaults still apply for unset fields
        assert_eq!(config.librarian.max_attempts, 5);
        assert_eq!(config.storage.retention_sync_window_days, 7);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = ArchivistConfig::default();
        std::env::set_var("ARCHIVIST_DB", "/tmp/override.db");
        std::env::set_var("ARCHIVIST_USER", "scripty");
        std::env::set_var("ARCHIVIST_LOG_LEVEL", "trace");

        config.apply_env_overrides();

        assert_eq!(config.storage.local_db_path, "/tmp/override.db");
        assert_eq!(config.general.user_id, "scripty");
        assert_eq!(config.general.log_level, "trace");

        std::env::remove_var("ARCHIVIST_DB");
        std::env::remove_var("ARCHIVIST_USER");
        std::env::remove_var("ARCHIVIST_LOG_LEVEL");
    }
}
