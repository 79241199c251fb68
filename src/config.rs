//! TOML configuration.
//!
//! Every section except `[server]` has defaults, so a minimal config is:
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:5556"
//! ```
//!
//! [`load_config`] parses the file and validates cross-field rules.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub document_store: DocumentStoreConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

/// SQLite database backing the `sqlite` document store.
#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/t2s.sqlite"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    /// Maximum columns per `TABLE_COLUMNS` DDL chunk.
    #[serde(default = "default_column_batch_size")]
    pub column_indexing_batch_size: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            column_indexing_batch_size: default_column_batch_size(),
        }
    }
}

fn default_column_batch_size() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct DocumentStoreConfig {
    /// `memory` or `sqlite`.
    #[serde(default = "default_store_provider")]
    pub provider: String,
}

impl Default for DocumentStoreConfig {
    fn default() -> Self {
        Self {
            provider: default_store_provider(),
        }
    }
}

fn default_store_provider() -> String {
    "memory".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `disabled`, `openai`, or `ollama`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Base URL; defaults per provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// `disabled` or `openai` (any OpenAI-compatible chat completions API).
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_llm_url")]
    pub url: String,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Stream answer tokens to `/streaming` consumers.
    #[serde(default = "default_true")]
    pub streaming: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            url: default_llm_url(),
            api_key_env: default_api_key_env(),
            streaming: true,
            max_retries: default_max_retries(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_maxsize")]
    pub maxsize: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            maxsize: default_cache_maxsize(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

/// SQL engine used to fetch `sql_data` before answer generation.
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// SQLite database the answered SQL runs against.
    #[serde(default)]
    pub data_path: Option<PathBuf>,
    #[serde(default = "default_row_limit")]
    pub row_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_path: None,
            row_limit: default_row_limit(),
        }
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_llm_timeout_secs() -> u64 {
    120
}
fn default_llm_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_true() -> bool {
    true
}
fn default_cache_maxsize() -> usize {
    1_000_000
}
fn default_cache_ttl_secs() -> u64 {
    120
}
fn default_row_limit() -> usize {
    500
}

impl Config {
    /// Config with every default and an ephemeral bind address.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig::default(),
            server: ServerConfig {
                bind: "127.0.0.1:5556".to_string(),
            },
            indexing: IndexingConfig::default(),
            document_store: DocumentStoreConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            cache: CacheConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Cross-field validation shared by [`load_config`] and tests.
pub fn validate(config: &Config) -> Result<()> {
    if config.indexing.column_indexing_batch_size == 0 {
        anyhow::bail!("indexing.column_indexing_batch_size must be > 0");
    }

    if config.cache.maxsize == 0 {
        anyhow::bail!("cache.maxsize must be > 0");
    }
    if config.cache.ttl_secs == 0 {
        anyhow::bail!("cache.ttl_secs must be > 0");
    }

    match config.document_store.provider.as_str() {
        "memory" | "sqlite" => {}
        other => anyhow::bail!(
            "Unknown document store provider: '{}'. Must be memory or sqlite.",
            other
        ),
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be > 0");
        }
    }

    match config.llm.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if config.llm.model.is_none() {
                anyhow::bail!("llm.model must be specified when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(())
}
