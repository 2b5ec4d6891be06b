//! Runtime configuration for aicoder.
//!
//! Settings are read from `.aicoder/config.toml` in the project directory,
//! then overridden by environment variables (a `.env` file is loaded by the
//! binary before this runs).
//!
//! ```toml
//! [database]
//! path = ".aicoder/aicoder.db"
//!
//! [sandbox]
//! image = "debian:latest"
//! name_prefix = "aicoder"
//! stop_timeout_secs = 5
//!
//! [sandbox.env]
//! LANG = "C.UTF-8"
//!
//! [events]
//! buffer = 64
//!
//! [models]
//! openai_model = "gpt-4o"
//! ollama_model = "llama3"
//!
//! [logging]
//! format = "json"
//! dir = ".aicoder/logs"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use aicoder_common::ModelRef;
use anyhow::{Context, Result};
use serde::Deserialize;

/// Directory holding config, database and logs, relative to the project.
pub const CONFIG_DIR: &str = ".aicoder";

const DEFAULT_IMAGE: &str = "debian:latest";
const DEFAULT_NAME_PREFIX: &str = "aicoder";
const DEFAULT_EVENT_BUFFER: usize = 64;
const DEFAULT_STOP_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub sandbox: SandboxConfig,
    pub events: EventsConfig,
    pub models: ModelsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

/// Settings for the per-flow sandbox container.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub image: String,
    pub name_prefix: String,
    pub env: HashMap<String, String>,
    pub stop_timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            env: HashMap::new(),
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventsConfig {
    /// Capacity of each subscriber's delivery queue.
    pub buffer: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelsConfig {
    pub openai_key: Option<String>,
    pub openai_model: Option<String>,
    pub ollama_model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// When set, logs are also written to a daily-rolling file here.
    pub dir: Option<PathBuf>,
}

/// Raw TOML structure for `.aicoder/config.toml`
#[derive(Debug, Default, Deserialize)]
struct ConfigToml {
    database: Option<DatabaseSection>,
    sandbox: Option<SandboxSection>,
    events: Option<EventsSection>,
    models: Option<ModelsSection>,
    logging: Option<LoggingSection>,
}

#[derive(Debug, Deserialize)]
struct DatabaseSection {
    path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct SandboxSection {
    image: Option<String>,
    name_prefix: Option<String>,
    env: Option<HashMap<String, String>>,
    stop_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct EventsSection {
    buffer: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ModelsSection {
    openai_key: Option<String>,
    openai_model: Option<String>,
    ollama_model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoggingSection {
    format: Option<LogFormat>,
    dir: Option<PathBuf>,
}

impl Config {
    /// Defaults rooted at `project_dir`.
    pub fn defaults(project_dir: &Path) -> Self {
        Self {
            database: DatabaseConfig {
                path: project_dir.join(CONFIG_DIR).join("aicoder.db"),
            },
            sandbox: SandboxConfig::default(),
            events: EventsConfig::default(),
            models: ModelsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load `.aicoder/config.toml` from the project directory.
    /// Returns defaults if the file doesn't exist.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let config_path = project_dir.join(CONFIG_DIR).join("config.toml");
        if !config_path.exists() {
            return Ok(Self::defaults(project_dir));
        }
        Self::load_file(project_dir, &config_path)
    }

    /// Load an explicit config file; relative paths inside it resolve
    /// against `project_dir`.
    pub fn load_file(project_dir: &Path, config_path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let raw: ConfigToml = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        let mut config = Self::defaults(project_dir);
        config.merge(raw, project_dir);
        config.validate()?;
        Ok(config)
    }

    fn merge(&mut self, raw: ConfigToml, project_dir: &Path) {
        if let Some(database) = raw.database {
            if let Some(path) = database.path {
                self.database.path = project_dir.join(path);
            }
        }
        if let Some(sandbox) = raw.sandbox {
            if let Some(image) = sandbox.image {
                self.sandbox.image = image;
            }
            if let Some(prefix) = sandbox.name_prefix {
                self.sandbox.name_prefix = prefix;
            }
            if let Some(env) = sandbox.env {
                self.sandbox.env = env;
            }
            if let Some(timeout) = sandbox.stop_timeout_secs {
                self.sandbox.stop_timeout_secs = timeout;
            }
        }
        if let Some(events) = raw.events {
            if let Some(buffer) = events.buffer {
                self.events.buffer = buffer;
            }
        }
        if let Some(models) = raw.models {
            self.models.openai_key = models.openai_key.or(self.models.openai_key.take());
            self.models.openai_model = models.openai_model.or(self.models.openai_model.take());
            self.models.ollama_model = models.ollama_model.or(self.models.ollama_model.take());
        }
        if let Some(logging) = raw.logging {
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
            if let Some(dir) = logging.dir {
                self.logging.dir = Some(project_dir.join(dir));
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.events.buffer == 0 {
            anyhow::bail!("events.buffer must be at least 1");
        }
        if self.sandbox.image.trim().is_empty() {
            anyhow::bail!("sandbox.image must not be empty");
        }
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides using `lookup` to resolve variable names.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = non_empty("AICODER_DATABASE") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(image) = non_empty("AICODER_DOCKER_IMAGE") {
            self.sandbox.image = image;
        }
        if let Some(format) = non_empty("AICODER_LOG_FORMAT") {
            self.logging.format = format.parse()?;
        }
        if let Some(dir) = non_empty("AICODER_LOG_DIR") {
            self.logging.dir = Some(PathBuf::from(dir));
        }
        if let Some(key) = non_empty("OPEN_AI_KEY") {
            self.models.openai_key = Some(key);
        }
        if let Some(model) = non_empty("OPEN_AI_MODEL") {
            self.models.openai_model = Some(model);
        }
        if let Some(model) = non_empty("OLLAMA_MODEL") {
            self.models.ollama_model = Some(model);
        }
        self.validate()
    }

    /// Models a flow may be created with: OpenAI needs both a key and a
    /// model, Ollama only a model.
    pub fn available_models(&self) -> Vec<ModelRef> {
        let mut models = Vec::new();
        if let (Some(_), Some(model)) = (&self.models.openai_key, &self.models.openai_model) {
            models.push(ModelRef::new("openai", model.clone()));
        }
        if let Some(model) = &self.models.ollama_model {
            models.push(ModelRef::new("ollama", model.clone()));
        }
        models
    }
}
