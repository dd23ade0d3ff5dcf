//! Configuration for lectern.
//!
//! Settings are read from an optional TOML file and then overridden by
//! `LECTERN__SECTION__KEY` environment variables. Every field has a default,
//! so an empty file (or no file at all) yields a usable configuration.
//!
//! API keys may be written as `${ENV_VAR}` and are resolved with
//! [`resolve_api_key`] when the clients are built.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Prefix for environment overrides, e.g. `LECTERN__EMBEDDINGS__MODEL`.
pub const ENV_PREFIX: &str = "LECTERN";

/// Default config file name inside the user config directory.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Environment variable '{var}' not set (from config value '{value}')")]
    MissingEnv { var: String, value: String },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub embeddings: EmbeddingsConfig,
    pub llm: LlmConfig,
    pub rerank: RerankConfig,
    pub chunking: ChunkingConfig,
    pub graph: GraphConfig,
    pub retrieval: RetrievalConfig,
    pub vector_store: VectorStoreConfig,
}

/// Where source documents and derived state live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the per-collection source directories.
    pub materials_dir: PathBuf,
    /// Root of the per-collection ledger, graph and local vector index.
    pub knowledge_base_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            materials_dir: PathBuf::from("uploads/materials"),
            knowledge_base_dir: PathBuf::from("uploads/knowledge_base"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingsConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub dimensions: usize,
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub timeout_secs: u64,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.siliconflow.cn/v1".to_string(),
            api_key: Some("${EMBEDDING_API_KEY}".to_string()),
            model: "BAAI/bge-large-zh-v1.5".to_string(),
            dimensions: 1024,
            batch_size: 5,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            timeout_secs: 30,
        }
    }
}

/// Chat model used for entity extraction and query analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.siliconflow.cn/v1".to_string(),
            api_key: Some("${LLM_API_KEY}".to_string()),
            model: "Qwen/Qwen3-14B".to_string(),
            temperature: 0.0,
            max_tokens: Some(2048),
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankConfig {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    /// Ask the service for at most this many results.
    pub top_n: Option<usize>,
    pub timeout_secs: u64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://api.siliconflow.cn/v1".to_string(),
            api_key: Some("${RERANK_API_KEY}".to_string()),
            model: "BAAI/bge-reranker-v2-m3".to_string(),
            top_n: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Maximum chunk length in characters.
    pub max_length: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self { max_length: 300 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub batch_size: usize,
    /// Maximum concurrent extraction calls.
    pub concurrency: usize,
    pub batch_delay_ms: u64,
    /// Include 2-hop neighbours of query entities at retrieval time.
    pub expand_neighbors: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            concurrency: 8,
            batch_delay_ms: 100,
            expand_neighbors: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// Rewrite the query with the chat model before vector search.
    pub expand_query: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            expand_query: false,
        }
    }
}

/// Vector store backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    Local,
    Qdrant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorStoreConfig {
    pub backend: VectorBackend,
    pub qdrant_url: String,
    pub qdrant_api_key: Option<String>,
    pub collection_prefix: String,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: VectorBackend::Local,
            qdrant_url: "http://localhost:6334".to_string(),
            qdrant_api_key: None,
            collection_prefix: "lectern-".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from `path` (or the default location when `None`)
    /// and apply environment overrides.
    ///
    /// A missing default file is not an error; a missing explicit file is.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        match path {
            Some(p) => {
                debug!("Loading config from {:?}", p);
                builder = builder.add_source(
                    config::File::from(p.to_path_buf())
                        .format(config::FileFormat::Toml)
                        .required(true),
                );
            }
            None => {
                if let Some(default_path) = default_config_path() {
                    debug!("Loading config from default location {:?}", default_path);
                    builder = builder.add_source(
                        config::File::from(default_path)
                            .format(config::FileFormat::Toml)
                            .required(false),
                    );
                }
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let mut config: Config = builder.build()?.try_deserialize()?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string without consulting the
    /// environment.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = config::Config::builder()
            .add_source(config::File::from_str(content, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings that would stall or break the pipeline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("chunking.max_length", self.chunking.max_length),
            ("embeddings.dimensions", self.embeddings.dimensions),
            ("embeddings.batch_size", self.embeddings.batch_size),
            ("graph.batch_size", self.graph.batch_size),
            ("graph.concurrency", self.graph.concurrency),
            ("retrieval.top_k", self.retrieval.top_k),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than 0", name)));
            }
        }
        if self.embeddings.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "embeddings.max_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn expand_paths(&mut self) {
        self.storage.materials_dir = expand_path(&self.storage.materials_dir);
        self.storage.knowledge_base_dir = expand_path(&self.storage.knowledge_base_dir);
    }
}

/// `<config dir>/lectern/config.toml`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("lectern").join(CONFIG_FILE_NAME))
}

fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(raw.as_ref()).into_owned())
}

/// Resolve an API key value, expanding `${ENV_VAR}` syntax.
///
/// Returns `Ok(None)` when nothing is configured.
pub fn resolve_api_key(api_key: &Option<String>) -> Result<Option<String>, ConfigError> {
    match api_key {
        Some(key) if key.starts_with("${") && key.ends_with('}') => {
            let var_name = &key[2..key.len() - 1];
            match std::env::var(var_name) {
                Ok(value) if !value.is_empty() => Ok(Some(value)),
                _ => Err(ConfigError::MissingEnv {
                    var: var_name.to_string(),
                    value: key.clone(),
                }),
            }
        }
        Some(key) if !key.is_empty() => Ok(Some(key.clone())),
        _ => Ok(None),
    }
}

/// Like [`resolve_api_key`] but treats an unset variable as "no key".
pub fn resolve_api_key_optional(api_key: &Option<String>) -> Option<String> {
    resolve_api_key(api_key).ok().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.chunking.max_length, 300);
        assert_eq!(config.embeddings.dimensions, 1024);
        assert_eq!(config.embeddings.batch_size, 5);
        assert_eq!(config.embeddings.max_retries, 3);
        assert_eq!(config.graph.batch_size, 5);
        assert_eq!(config.graph.concurrency, 8);
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.vector_store.backend, VectorBackend::Local);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
[chunking]
max_length = 500

[graph]
concurrency = 2

[vector_store]
backend = "qdrant"
"#,
        )
        .unwrap();

        assert_eq!(config.chunking.max_length, 500);
        assert_eq!(config.graph.concurrency, 2);
        assert_eq!(config.graph.batch_size, 5);
        assert_eq!(config.vector_store.backend, VectorBackend::Qdrant);
        assert_eq!(config.embeddings.model, "BAAI/bge-large-zh-v1.5");
    }

    #[test]
    fn test_validate_rejects_zero() {
        let result = Config::from_toml_str("[graph]\nconcurrency = 0\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lectern.toml");
        std::fs::write(
            &path,
            "[storage]\nmaterials_dir = \"/srv/materials\"\n[retrieval]\ntop_k = 8\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.storage.materials_dir, PathBuf::from("/srv/materials"));
        assert_eq!(config.retrieval.top_k, 8);
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let result = Config::load(Some(Path::new("/nonexistent/lectern.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_tilde_expansion() {
        let config = Config::from_toml_str("[storage]\nknowledge_base_dir = \"~/kb\"\n").unwrap();
        assert!(!config.storage.knowledge_base_dir.to_string_lossy().starts_with('~'));
    }

    #[test]
    fn test_to_toml_roundtrip() {
        let mut config = Config::default();
        config.rerank.enabled = false;
        let rendered = config.to_toml().unwrap();
        let parsed = Config::from_toml_str(&rendered).unwrap();
        assert!(!parsed.rerank.enabled);
        assert_eq!(parsed.llm.model, config.llm.model);
    }

    #[test]
    fn test_resolve_api_key_direct() {
        let key = resolve_api_key(&Some("direct-key".to_string())).unwrap();
        assert_eq!(key.as_deref(), Some("direct-key"));
    }

    #[test]
    fn test_resolve_api_key_env_var() {
        std::env::set_var("LECTERN_TEST_KEY_4821", "from-env");
        let key = resolve_api_key(&Some("${LECTERN_TEST_KEY_4821}".to_string())).unwrap();
        assert_eq!(key.as_deref(), Some("from-env"));
        std::env::remove_var("LECTERN_TEST_KEY_4821");
    }

    #[test]
    fn test_resolve_api_key_missing_env() {
        let value = Some("${LECTERN_NONEXISTENT_VAR_XYZ}".to_string());
        assert!(matches!(
            resolve_api_key(&value),
            Err(ConfigError::MissingEnv { .. })
        ));
        assert!(resolve_api_key_optional(&value).is_none());
    }

    #[test]
    fn test_resolve_api_key_empty() {
        assert!(resolve_api_key(&Some(String::new())).unwrap().is_none());
        assert!(resolve_api_key(&None).unwrap().is_none());
    }

    #[test]
    fn test_settings_serialize_to_json() {
        let json = serde_json::to_value(Config::default()).unwrap();
        assert_eq!(json["vector_store"]["backend"], "local");
        assert_eq!(json["chunking"]["max_length"], 300);
    }
}
