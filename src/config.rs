//! Configuration for the embedding search service.
//!
//! Settings are layered:
//! - Default values
//! - TOML configuration file (`.embsearch/settings.toml`)
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `ES_` and use double underscores
//! to separate nested levels:
//! - `ES_SEARCH__NUM_WORKERS=8` sets `search.num_workers`
//! - `ES_CACHE__CAPACITY_BYTES=1073741824` sets `cache.capacity_bytes`
//! - `ES_LOGGING__LEVEL=debug` sets `logging.level`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::vector::{SearchOptions, WorkerOptions};

/// Directory holding the settings file, searched for from the current
/// directory upwards.
pub const CONFIG_DIR: &str = ".embsearch";

const CONFIG_FILE: &str = "settings.toml";
const ENV_PREFIX: &str = "ES_";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SearchConfig {
    /// Upper bound on parallel workers per similarity search
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Indexes with fewer rows are searched on a single worker
    #[serde(default = "default_min_rows_to_split")]
    pub min_rows_to_split: usize,

    /// Blend per-document ranks into result scores
    #[serde(default = "default_true")]
    pub use_document_ranks: bool,

    #[serde(default = "default_code_result_count")]
    pub code_result_count: usize,

    #[serde(default = "default_text_result_count")]
    pub text_result_count: usize,

    /// Model that produced query embeddings
    #[serde(default = "default_embeddings_model")]
    pub embeddings_model: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CacheConfig {
    /// Byte budget shared by all cached indexes
    #[serde(default = "default_capacity_bytes")]
    pub capacity_bytes: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StorageConfig {
    /// Root directory of the filesystem blob store
    #[serde(default = "default_blob_dir")]
    pub blob_dir: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_version() -> u32 {
    1
}
fn default_num_workers() -> usize {
    num_cpus::get()
}
fn default_min_rows_to_split() -> usize {
    1000
}
fn default_true() -> bool {
    true
}
fn default_code_result_count() -> usize {
    10
}
fn default_text_result_count() -> usize {
    5
}
fn default_embeddings_model() -> String {
    "openai/text-embedding-ada-002".to_string()
}
fn default_capacity_bytes() -> usize {
    // 6 GiB
    6 * 1024 * 1024 * 1024
}
fn default_blob_dir() -> PathBuf {
    PathBuf::from(".embsearch/indexes")
}
fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            search: SearchConfig::default(),
            cache: CacheConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            min_rows_to_split: default_min_rows_to_split(),
            use_document_ranks: true,
            code_result_count: default_code_result_count(),
            text_result_count: default_text_result_count(),
            embeddings_model: default_embeddings_model(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: default_capacity_bytes(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            blob_dir: default_blob_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl SearchConfig {
    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            num_workers: self.num_workers.max(1),
            min_rows_to_split: self.min_rows_to_split,
        }
    }

    pub fn search_options(&self) -> SearchOptions {
        SearchOptions {
            use_document_ranks: self.use_document_ranks,
        }
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config_path =
            Self::find_workspace_config().unwrap_or_else(Self::default_config_path);
        Self::load_from(config_path)
    }

    /// Load configuration from a specific file, still honoring env overrides
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            // Double underscore separates nesting levels, single underscores
            // stay inside field names
            .merge(Env::prefixed(ENV_PREFIX).map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
            .extract()
            .map_err(Box::new)
    }

    /// Find the settings file by looking for the config directory from the
    /// current directory up to the filesystem root
    fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;
        current
            .ancestors()
            .map(|ancestor| ancestor.join(CONFIG_DIR))
            .find(|dir| dir.is_dir())
            .map(|dir| dir.join(CONFIG_FILE))
    }

    /// Path `init` writes to
    pub fn default_config_path() -> PathBuf {
        PathBuf::from(CONFIG_DIR).join(CONFIG_FILE)
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }
}
