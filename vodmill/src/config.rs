//! TOML configuration with compiled-in defaults.
//!
//! Every key is optional: a missing file, a missing section and a missing
//! key all fall back to the same defaults. Precedence is defaults < file <
//! environment (`dotenvy` at startup) < CLI flags, with the CLI merge done
//! in `main`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::database::models::Stage;
use crate::pipeline::{RetryPolicy, StageRunnerConfig};
use crate::{Error, Result};

/// Looked for in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "vodmill.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub storage: StorageConfig,
    pub discovery: DiscoveryConfig,
    pub stages: StagesConfig,
    pub tools: ToolsConfig,
    pub summarize: SummarizeConfig,
    pub paths: PathsConfig,
    pub logging: LoggingConfig,
}

impl PipelineConfig {
    /// Load the configuration file.
    ///
    /// An explicit `path` must exist; the default path is optional and its
    /// absence just means compiled-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        let config = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let parsed: Self = toml::from_str(&raw)
                .map_err(|err| Error::config(format!("{}: {err}", path.display())))?;
            info!(path = %path.display(), "Loaded configuration file");
            parsed
        } else if required {
            return Err(Error::config(format!(
                "config file not found: {}",
                path.display()
            )));
        } else {
            debug!("No configuration file, using defaults");
            Self::default()
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.stages.concurrency == 0 {
            return Err(Error::config("stages.concurrency must be at least 1"));
        }
        if self.stages.timeout_secs == 0 {
            return Err(Error::config("stages.timeout_secs must be at least 1"));
        }
        if self.storage.database.trim().is_empty() {
            return Err(Error::config("storage.database must not be empty"));
        }
        for collection in &self.discovery.collections {
            if collection.id.trim().is_empty() || collection.url.trim().is_empty() {
                return Err(Error::config(
                    "discovery.collections entries need both an id and a url",
                ));
            }
        }
        Ok(())
    }

    /// sqlx connection URL for the configured database file.
    pub fn database_url(&self) -> String {
        format!("sqlite:{}", self.storage.database)
    }

    /// Create the artifact directories; called once at startup.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            &self.paths.subtitles,
            &self.paths.media,
            &self.paths.text,
            &self.paths.export,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file path.
    pub database: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: "vodmill.db".to_string(),
        }
    }
}

/// Source collection as configured, before it is registered in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Collections registered at startup and listed during discovery.
    pub collections: Vec<CollectionConfig>,
    /// Default title keyword for fresh partitions.
    pub keyword: Option<String>,
}

/// Skip/limit pair for one stage. `limit = 0` means no cap.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StageToggle {
    pub skip: bool,
    pub limit: u32,
}

impl StageToggle {
    pub fn limit(&self) -> Option<u32> {
        (self.limit > 0).then_some(self.limit)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagesConfig {
    pub concurrency: usize,
    pub retry_limit: u32,
    pub timeout_secs: u64,
    pub discovery: StageToggle,
    pub acquisition: StageToggle,
    pub conversion: StageToggle,
    pub transcription: StageToggle,
    pub summarization: StageToggle,
    pub export: StageToggle,
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry_limit: 3,
            timeout_secs: 600,
            discovery: StageToggle::default(),
            acquisition: StageToggle::default(),
            conversion: StageToggle::default(),
            transcription: StageToggle::default(),
            summarization: StageToggle::default(),
            export: StageToggle::default(),
        }
    }
}

impl StagesConfig {
    pub fn toggle(&self, stage: Stage) -> &StageToggle {
        match stage {
            Stage::Acquisition => &self.acquisition,
            Stage::Conversion => &self.conversion,
            Stage::Transcription => &self.transcription,
            Stage::Summarization => &self.summarization,
            Stage::Export => &self.export,
        }
    }

    pub fn runner_config(&self) -> StageRunnerConfig {
        StageRunnerConfig {
            concurrency: self.concurrency,
            retry_limit: self.retry_limit,
            timeout_secs: self.timeout_secs,
            backoff: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// yt-dlp compatible fetcher binary.
    pub fetcher: String,
    /// Transcriber binary, invoked as `<bin> <audio> <text-out>`.
    pub transcriber: String,
    /// rclone compatible uploader binary.
    pub uploader: String,
    /// Subtitle languages passed to the fetcher, in preference order.
    pub subtitle_langs: Vec<String>,
    /// rclone remote for text artifacts; empty disables uploads.
    pub remote_target: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            fetcher: "yt-dlp".to_string(),
            transcriber: "whisper".to_string(),
            uploader: "rclone".to_string(),
            subtitle_langs: vec!["en".to_string()],
            remote_target: String::new(),
        }
    }
}

impl ToolsConfig {
    pub fn remote_target(&self) -> Option<String> {
        let target = self.remote_target.trim();
        (!target.is_empty()).then(|| target.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizeConfig {
    /// OpenAI-compatible chat completions endpoint.
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the API key. Empty key = anonymous.
    pub api_key_env: String,
    /// Instruction prepended to the transcript text.
    pub prompt: String,
}

impl Default for SummarizeConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "VODMILL_API_KEY".to_string(),
            prompt: "Summarize the following transcript in under 200 words of plain text. \
                     Focus on the main themes, arguments and significant points. \
                     If the transcript is empty or too thin to summarize, say so briefly."
                .to_string(),
        }
    }
}

impl SummarizeConfig {
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub subtitles: PathBuf,
    pub media: PathBuf,
    pub text: PathBuf,
    pub export: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            subtitles: PathBuf::from("data/subtitles"),
            media: PathBuf::from("data/media"),
            text: PathBuf::from("data/text"),
            export: PathBuf::from("data/export"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for daily-rolling log files.
    pub dir: String,
    /// `EnvFilter` directive string; empty keeps the built-in default.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: "logs".to_string(),
            filter: String::new(),
        }
    }
}

impl LoggingConfig {
    pub fn filter(&self) -> Option<&str> {
        let filter = self.filter.trim();
        (!filter.is_empty()).then_some(filter)
    }
}
