use crate::agent::AgentConfig;
use crate::error::{AssistantError, Result};
use crate::llm::LLMConfig;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const CONFIG_FILE: &str = "config.toml";
pub const SECRETS_FILE: &str = "secrets.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { top_k: 3 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Chat turns are only logged when this is set.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage_dir: PathBuf,
    pub retrieval: RetrievalConfig,
    pub llm: LLMConfig,
    pub database: DatabaseConfig,
    pub agent: AgentConfig,
    /// Directory the config was read from; secrets are looked up here.
    #[serde(skip)]
    pub source_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("storage"),
            retrieval: RetrievalConfig::default(),
            llm: LLMConfig::default(),
            database: DatabaseConfig::default(),
            agent: AgentConfig::default(),
            source_dir: None,
        }
    }
}

impl Config {
    pub fn default_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("research-assistant"))
    }

    /// Reads `path` if given, else the default config file if it exists,
    /// else falls back to built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => {
                if !p.is_file() {
                    return Err(AssistantError::Config(format!(
                        "config file {} not found",
                        p.display()
                    )));
                }
                Some(p.to_path_buf())
            }
            None => Self::default_dir()
                .map(|d| d.join(CONFIG_FILE))
                .filter(|p| p.is_file()),
        };

        let config = match path {
            Some(path) => {
                let mut config = Self::from_toml(&fs::read_to_string(&path)?)?;
                if let Some(dir) = path.parent() {
                    config.resolve_relative_paths(dir);
                    config.source_dir = Some(dir.to_path_buf());
                }
                info!(path = %path.display(), "loaded configuration");
                config
            }
            None => {
                debug!("no config file found, using defaults");
                let mut config = Self::default();
                config.source_dir = Self::default_dir();
                config
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Relative paths in a config file are relative to that file.
    fn resolve_relative_paths(&mut self, base: &Path) {
        if self.storage_dir.is_relative() {
            self.storage_dir = base.join(&self.storage_dir);
        }
        if let Some(path) = self.database.path.as_mut().filter(|p| p.is_relative()) {
            *path = base.join(path.as_path());
        }
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| AssistantError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.retrieval.top_k == 0 {
            return Err(AssistantError::Config("retrieval.top_k must be at least 1".into()));
        }
        if self.llm.max_tokens == 0 {
            return Err(AssistantError::Config("llm.max_tokens must be at least 1".into()));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(AssistantError::Config(
                "llm.temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if self.agent.max_iterations == 0 {
            return Err(AssistantError::Config(
                "agent.max_iterations must be at least 1".into(),
            ));
        }

        let mut seen = FxHashSet::default();
        for tool in &self.agent.tools {
            if tool.name.trim().is_empty() {
                return Err(AssistantError::Config("agent tool names cannot be empty".into()));
            }
            if !seen.insert(tool.name.as_str()) {
                return Err(AssistantError::Config(format!(
                    "duplicate agent tool name: {}",
                    tool.name
                )));
            }
        }

        Ok(())
    }

    /// Environment first, then `secrets.toml` next to the config file.
    pub fn api_key(&self) -> Result<String> {
        self.api_key_with(|name| std::env::var(name).ok())
    }

    pub fn api_key_with(&self, env: impl Fn(&str) -> Option<String>) -> Result<String> {
        let name = &self.llm.api_key_env;

        if let Some(key) = env(name).filter(|k| !k.trim().is_empty()) {
            return Ok(key);
        }

        if let Some(dir) = &self.source_dir {
            let secrets_path = dir.join(SECRETS_FILE);
            if secrets_path.is_file() {
                let raw = fs::read_to_string(&secrets_path)?;
                let secrets: BTreeMap<String, toml::Value> =
                    toml::from_str(&raw).map_err(|e| AssistantError::Config(e.to_string()))?;
                if let Some(key) = secrets
                    .get(name)
                    .and_then(toml::Value::as_str)
                    .filter(|k| !k.trim().is_empty())
                {
                    return Ok(key.to_string());
                }
            }
        }

        Err(AssistantError::MissingApiKey(name.clone()))
    }
}
