//! Configuration Vault – reads/writes `~/.reasonbank/config.toml`.

use reasonbank_memory::DedupPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Chat-completions provider.  Both speak the OpenAI wire protocol; the
/// distinction only decides whether `/api/tags` model discovery applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    Ollama,
    OpenAI,
}

impl std::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmProvider::Ollama => write!(f, "ollama"),
            LlmProvider::OpenAI => write!(f, "openai"),
        }
    }
}

/// Where query embeddings come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingKind {
    /// Offline feature hashing; no model server needed.
    #[default]
    Hash,
    Ollama,
}

impl std::fmt::Display for EmbeddingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmbeddingKind::Hash => write!(f, "hash"),
            EmbeddingKind::Ollama => write!(f, "ollama"),
        }
    }
}

/// Memory pool backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Json,
    /// Process-local; the pool is lost on exit.
    Memory,
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackend::Sqlite => write!(f, "sqlite"),
            StoreBackend::Json => write!(f, "json"),
            StoreBackend::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sqlite" => Ok(StoreBackend::Sqlite),
            "json" => Ok(StoreBackend::Json),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(format!("unknown store backend '{other}' (sqlite / json / memory)")),
        }
    }
}

/// Persisted user configuration stored in `~/.reasonbank/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub llm_provider: LlmProvider,

    /// Base URL of the chat-completions server.
    #[serde(default = "default_llm_url")]
    pub llm_base_url: String,

    /// Model used for judging, distillation and execution.
    #[serde(default = "default_model")]
    pub active_model: String,

    /// Bearer token for hosted endpoints (stored as plain text – the file is
    /// written owner-only).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,

    #[serde(default)]
    pub embedding_backend: EmbeddingKind,

    /// Embedding model for the `ollama` backend.
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Vector size of the `hash` backend.
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,

    #[serde(default)]
    pub store_backend: StoreBackend,

    /// Pool location; empty means `~/.reasonbank/memory.{db,json}`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub store_path: String,

    #[serde(default)]
    pub dedup: DedupPolicy,

    /// Prior memories retrieved per task.
    #[serde(default = "default_retrieve_k")]
    pub retrieve_k: usize,

    /// Maximum memory items kept per distillation.
    #[serde(default = "default_max_items")]
    pub max_items: usize,

    /// Deadline for one executor invocation.
    #[serde(default = "default_branch_timeout_secs")]
    pub branch_timeout_secs: u64,

    /// Ask the model for a final answer after parallel scaling.
    #[serde(default = "default_true")]
    pub synthesize: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("llm_provider", &self.llm_provider)
            .field("llm_base_url", &self.llm_base_url)
            .field("active_model", &self.active_model)
            .field(
                "api_key",
                if self.api_key.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("embedding_backend", &self.embedding_backend)
            .field("embedding_model", &self.embedding_model)
            .field("embedding_dimension", &self.embedding_dimension)
            .field("store_backend", &self.store_backend)
            .field("store_path", &self.store_path)
            .field("dedup", &self.dedup)
            .field("retrieve_k", &self.retrieve_k)
            .field("max_items", &self.max_items)
            .field("branch_timeout_secs", &self.branch_timeout_secs)
            .field("synthesize", &self.synthesize)
            .finish()
    }
}

fn default_llm_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_model() -> String {
    "llama3".to_string()
}
fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_embedding_dimension() -> usize {
    256
}
fn default_retrieve_k() -> usize {
    1
}
fn default_max_items() -> usize {
    3
}
fn default_branch_timeout_secs() -> u64 {
    120
}
fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llm_provider: LlmProvider::default(),
            llm_base_url: default_llm_url(),
            active_model: default_model(),
            api_key: String::new(),
            embedding_backend: EmbeddingKind::default(),
            embedding_model: default_embedding_model(),
            embedding_dimension: default_embedding_dimension(),
            store_backend: StoreBackend::default(),
            store_path: String::new(),
            dedup: DedupPolicy::default(),
            retrieve_k: default_retrieve_k(),
            max_items: default_max_items(),
            branch_timeout_secs: default_branch_timeout_secs(),
            synthesize: true,
        }
    }
}

impl Config {
    /// Concrete pool location for the configured backend.
    pub fn resolved_store_path(&self) -> PathBuf {
        self.resolved_store_path_for_home(&home_dir())
    }

    pub(crate) fn resolved_store_path_for_home(&self, home: &str) -> PathBuf {
        if let Some(rest) = self.store_path.strip_prefix("~/") {
            return PathBuf::from(home).join(rest);
        }
        if !self.store_path.is_empty() {
            return PathBuf::from(&self.store_path);
        }
        let file = match self.store_backend {
            StoreBackend::Json => "memory.json",
            StoreBackend::Sqlite | StoreBackend::Memory => "memory.db",
        };
        PathBuf::from(home).join(".reasonbank").join(file)
    }
}

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

/// Return the path to `~/.reasonbank/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".reasonbank").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
/// `REASONBANK_*` overrides are applied on top of the file.
pub fn load() -> Result<Option<Config>, String> {
    let mut cfg = load_from(&config_path())?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config = toml::from_str(&raw)
        .map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `REASONBANK_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `REASONBANK_LLM_URL` | `llm_base_url` |
/// | `REASONBANK_MODEL` | `active_model` |
/// | `REASONBANK_API_KEY` | `api_key` |
/// | `REASONBANK_STORE_PATH` | `store_path` |
/// | `REASONBANK_STORE_BACKEND` | `store_backend` |
/// | `REASONBANK_RETRIEVE_K` | `retrieve_k` (must be ≥ 1) |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("REASONBANK_LLM_URL") {
        cfg.llm_base_url = v;
    }
    if let Ok(v) = std::env::var("REASONBANK_MODEL") {
        cfg.active_model = v;
    }
    if let Ok(v) = std::env::var("REASONBANK_API_KEY") {
        cfg.api_key = v;
    }
    if let Ok(v) = std::env::var("REASONBANK_STORE_PATH") {
        cfg.store_path = v;
    }
    if let Ok(v) = std::env::var("REASONBANK_STORE_BACKEND") {
        if let Ok(backend) = v.parse::<StoreBackend>() {
            cfg.store_backend = backend;
        }
    }
    if let Ok(v) = std::env::var("REASONBANK_RETRIEVE_K") {
        match v.parse::<usize>() {
            Ok(k) if k >= 1 => cfg.retrieve_k = k,
            _ => {}
        }
    }
}

/// Save the config to disk, creating `~/.reasonbank/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Owner-only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    // Owner-only read/write (rw-------) on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_debug_redacts_api_key() {
        let cfg = Config {
            api_key: "sk-super-secret".to_string(),
            ..Config::default()
        };
        let debug_str = format!("{:?}", cfg);
        assert!(!debug_str.contains("sk-super-secret"), "api key must not appear in debug output");
        assert!(debug_str.contains("<redacted>"));
    }

    #[test]
    fn config_debug_shows_not_set_for_empty_key() {
        let debug_str = format!("{:?}", Config::default());
        assert!(debug_str.contains("<not set>"));
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");

        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .expect("dir metadata")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700, "config directory must have 0o700 permissions");
    }

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.active_model, "llama3");
        assert_eq!(loaded.llm_provider, LlmProvider::Ollama);
        assert_eq!(loaded.embedding_backend, EmbeddingKind::Hash);
        assert_eq!(loaded.store_backend, StoreBackend::Sqlite);
        assert_eq!(loaded.dedup, DedupPolicy::Keep);
        assert_eq!(loaded.retrieve_k, 1);
        assert_eq!(loaded.max_items, 3);
        assert!(loaded.synthesize);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "llm_provider = \"openai\"\nstore_backend = \"json\"\ndedup = \"title\"\n",
        )
        .unwrap();

        let cfg = load_from(&path).expect("load ok").expect("some");
        assert_eq!(cfg.llm_provider, LlmProvider::OpenAI);
        assert_eq!(cfg.store_backend, StoreBackend::Json);
        assert_eq!(cfg.dedup, DedupPolicy::Title);
        assert_eq!(cfg.embedding_dimension, 256);
        assert_eq!(cfg.branch_timeout_secs, 120);
    }

    #[test]
    fn config_path_points_to_reasonbank_dir() {
        let p = config_path_for_home("/home/testuser");
        assert_eq!(p, PathBuf::from("/home/testuser/.reasonbank/config.toml"));
    }

    #[test]
    fn store_path_defaults_per_backend() {
        let mut cfg = Config::default();
        assert_eq!(
            cfg.resolved_store_path_for_home("/h"),
            PathBuf::from("/h/.reasonbank/memory.db")
        );
        cfg.store_backend = StoreBackend::Json;
        assert_eq!(
            cfg.resolved_store_path_for_home("/h"),
            PathBuf::from("/h/.reasonbank/memory.json")
        );
        cfg.store_path = "~/pools/a.json".into();
        assert_eq!(cfg.resolved_store_path_for_home("/h"), PathBuf::from("/h/pools/a.json"));
        cfg.store_path = "/var/lib/pool.json".into();
        assert_eq!(cfg.resolved_store_path_for_home("/h"), PathBuf::from("/var/lib/pool.json"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn store_backend_parses() {
        assert_eq!("SQLite".parse::<StoreBackend>(), Ok(StoreBackend::Sqlite));
        assert!("redis".parse::<StoreBackend>().is_err());
    }

    #[test]
    fn apply_env_overrides_changes_llm_url_and_model() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe {
            std::env::set_var("REASONBANK_LLM_URL", "http://gpu-box:11434");
            std::env::set_var("REASONBANK_MODEL", "qwen2.5");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.llm_base_url, "http://gpu-box:11434");
        assert_eq!(cfg.active_model, "qwen2.5");
        unsafe {
            std::env::remove_var("REASONBANK_LLM_URL");
            std::env::remove_var("REASONBANK_MODEL");
        }
    }

    #[test]
    fn apply_env_overrides_changes_store() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe {
            std::env::set_var("REASONBANK_STORE_BACKEND", "json");
            std::env::set_var("REASONBANK_STORE_PATH", "/tmp/pool.json");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.store_backend, StoreBackend::Json);
        assert_eq!(cfg.store_path, "/tmp/pool.json");
        unsafe {
            std::env::remove_var("REASONBANK_STORE_BACKEND");
            std::env::remove_var("REASONBANK_STORE_PATH");
        }
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_retrieve_k() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("REASONBANK_RETRIEVE_K", "0") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.retrieve_k, 1);

        unsafe { std::env::set_var("REASONBANK_RETRIEVE_K", "lots") };
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.retrieve_k, 1);

        unsafe { std::env::set_var("REASONBANK_RETRIEVE_K", "4") };
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.retrieve_k, 4);
        unsafe { std::env::remove_var("REASONBANK_RETRIEVE_K") };
    }
}
