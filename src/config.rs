//! Configuration for docsum.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (DOCSUM_HOME, BLOB_STORAGE_ENDPOINT, AZURE_OPENAI_*, ...)
//! 2. Config file (.docsum/config.yaml)
//! 3. Defaults (~/.docsum)
//!
//! Config file discovery:
//! - Searches current directory and parents for .docsum/config.yaml
//! - Relative paths in the config file resolve against the project root
//!   (the directory containing .docsum/)
//!
//! Settings are loaded once at startup and passed to whatever needs them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::RetryPolicy;

/// Default chat-completions API version
pub const DEFAULT_GENERATION_API_VERSION: &str = "2025-01-01-preview";

/// Default layout-analysis API version
pub const DEFAULT_ANALYSIS_API_VERSION: &str = "2023-07-31";

/// Major version of the config file format this build reads
const SUPPORTED_CONFIG_VERSION: &str = "1";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub watch: WatchConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (instance histories)
    pub home: Option<String>,
    /// Blob storage root (one subdirectory per container)
    pub storage: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalysisConfig {
    pub endpoint: Option<String>,
    pub key: Option<String>,
    pub model_id: Option<String>,
    pub api_version: Option<String>,
    pub locale: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub max_polls: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerationConfig {
    pub endpoint: Option<String>,
    pub key: Option<String>,
    pub deployment: Option<String>,
    pub api_version: Option<String>,
    pub max_tokens: Option<u32>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetryConfig {
    pub first_retry_delay_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub backoff_multiplier: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WatchConfig {
    pub patterns: Option<Vec<String>>,
    pub stability_delay_secs: Option<u64>,
}

/// Layout-analysis service settings
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisSettings {
    pub endpoint: Option<String>,
    #[serde(skip_serializing)]
    pub key: Option<String>,
    pub model_id: String,
    pub api_version: String,
    pub locale: String,
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            key: None,
            model_id: "prebuilt-layout".to_string(),
            api_version: DEFAULT_ANALYSIS_API_VERSION.to_string(),
            locale: "en-US".to_string(),
            poll_interval: Duration::from_secs(1),
            max_polls: 120,
        }
    }
}

/// Text-generation service settings
#[derive(Debug, Clone, Serialize)]
pub struct GenerationSettings {
    pub endpoint: Option<String>,
    #[serde(skip_serializing)]
    pub key: Option<String>,
    pub deployment: Option<String>,
    pub api_version: String,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            key: None,
            deployment: None,
            api_version: DEFAULT_GENERATION_API_VERSION.to_string(),
            max_tokens: 200,
            timeout: Duration::from_secs(120),
        }
    }
}

/// Input watcher settings
#[derive(Debug, Clone, Serialize)]
pub struct WatchSettings {
    pub patterns: Vec<String>,
    pub stability_delay: Duration,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            patterns: vec!["*".to_string()],
            stability_delay: Duration::from_secs(2),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    /// Engine state directory
    pub home: PathBuf,
    /// Blob storage root
    pub storage_root: PathBuf,
    pub analysis: AnalysisSettings,
    pub generation: GenerationSettings,
    pub retry: RetryPolicy,
    pub watch: WatchSettings,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl Settings {
    /// Load from the process environment and the discovered config file
    pub fn load(explicit_file: Option<&Path>) -> Result<Self> {
        let default_home = dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(".docsum");

        let config_file = match explicit_file {
            Some(path) => Some(path.to_path_buf()),
            None => find_config_file(),
        };

        load_settings(config_file, default_home, |key| std::env::var(key).ok())
    }

    /// Directory holding one history directory per instance
    pub fn instances_dir(&self) -> PathBuf {
        self.home.join("instances")
    }

    /// Directory of additional YAML pipeline definitions
    pub fn pipelines_dir(&self) -> PathBuf {
        self.home.join("pipelines")
    }

    /// Directory of the `input` container
    pub fn input_dir(&self) -> PathBuf {
        self.storage_root.join(crate::adapters::INPUT_CONTAINER)
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".docsum").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let file: ConfigFile = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    if let Some(version) = &file.version {
        let major = version.split('.').next().unwrap_or_default().trim();
        if major != SUPPORTED_CONFIG_VERSION {
            anyhow::bail!(
                "Unsupported config version {} in {} (expected {}.x)",
                version,
                path.display(),
                SUPPORTED_CONFIG_VERSION
            );
        }
    }

    Ok(file)
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Storage endpoints may be given as `file://` URLs
fn storage_path(value: &str) -> &str {
    value.strip_prefix("file://").unwrap_or(value)
}

fn parse_env<T: std::str::FromStr>(name: &str, value: Option<String>) -> Result<Option<T>> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("Invalid value for {}: {}", name, raw)),
        None => Ok(None),
    }
}

/// Merge defaults, config file and environment
fn load_settings<F>(config_file: Option<PathBuf>, default_home: PathBuf, env: F) -> Result<Settings>
where
    F: Fn(&str) -> Option<String>,
{
    let (file, base_dir) = match &config_file {
        Some(path) => {
            let file = load_config_file(path)?;
            // Project root is the parent of .docsum/
            let base = path
                .parent()
                .and_then(|p| p.parent())
                .unwrap_or(Path::new("."))
                .to_path_buf();
            (file, base)
        }
        None => (ConfigFile::default(), PathBuf::from(".")),
    };

    let home = env("DOCSUM_HOME")
        .map(PathBuf::from)
        .or_else(|| file.paths.home.as_deref().map(|h| resolve_path(&base_dir, h)))
        .unwrap_or(default_home);

    let storage_root = env("BLOB_STORAGE_ENDPOINT")
        .map(|s| PathBuf::from(storage_path(&s)))
        .or_else(|| {
            file.paths
                .storage
                .as_deref()
                .map(|s| resolve_path(&base_dir, storage_path(s)))
        })
        .unwrap_or_else(|| home.join("storage"));

    let analysis_defaults = AnalysisSettings::default();
    let analysis = AnalysisSettings {
        endpoint: env("COGNITIVE_SERVICES_ENDPOINT").or(file.analysis.endpoint),
        key: env("COGNITIVE_SERVICES_KEY").or(file.analysis.key),
        model_id: file.analysis.model_id.unwrap_or(analysis_defaults.model_id),
        api_version: file
            .analysis
            .api_version
            .unwrap_or(analysis_defaults.api_version),
        locale: file.analysis.locale.unwrap_or(analysis_defaults.locale),
        poll_interval: file
            .analysis
            .poll_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(analysis_defaults.poll_interval),
        max_polls: file.analysis.max_polls.unwrap_or(analysis_defaults.max_polls),
    };

    let generation_defaults = GenerationSettings::default();
    let generation = GenerationSettings {
        endpoint: env("AZURE_OPENAI_ENDPOINT").or(file.generation.endpoint),
        key: env("AZURE_OPENAI_KEY").or(file.generation.key),
        deployment: env("AZURE_OPENAI_DEPLOYMENT_NAME").or(file.generation.deployment),
        api_version: env("AZURE_OPENAI_API_VERSION")
            .or(file.generation.api_version)
            .unwrap_or(generation_defaults.api_version),
        max_tokens: file
            .generation
            .max_tokens
            .unwrap_or(generation_defaults.max_tokens),
        timeout: file
            .generation
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(generation_defaults.timeout),
    };

    let retry_defaults = RetryPolicy::default();
    let retry = RetryPolicy {
        first_retry_delay_ms: parse_env(
            "DOCSUM_RETRY_FIRST_DELAY_MS",
            env("DOCSUM_RETRY_FIRST_DELAY_MS"),
        )?
        .or(file.retry.first_retry_delay_ms)
        .unwrap_or(retry_defaults.first_retry_delay_ms),
        max_attempts: parse_env("DOCSUM_RETRY_MAX_ATTEMPTS", env("DOCSUM_RETRY_MAX_ATTEMPTS"))?
            .or(file.retry.max_attempts)
            .unwrap_or(retry_defaults.max_attempts),
        backoff_multiplier: file
            .retry
            .backoff_multiplier
            .unwrap_or(retry_defaults.backoff_multiplier),
        max_delay_ms: retry_defaults.max_delay_ms,
    };
    retry.validate().context("Invalid retry configuration")?;

    let watch_defaults = WatchSettings::default();
    let watch = WatchSettings {
        patterns: file.watch.patterns.unwrap_or(watch_defaults.patterns),
        stability_delay: file
            .watch
            .stability_delay_secs
            .map(Duration::from_secs)
            .unwrap_or(watch_defaults.stability_delay),
    };

    Ok(Settings {
        home,
        storage_root,
        analysis,
        generation,
        retry,
        watch,
        config_file,
    })
}

/// Mask a secret for display, keeping the last four characters
pub fn mask_secret(secret: Option<&str>) -> String {
    match secret {
        None => "(not set)".to_string(),
        Some(s) if s.len() <= 4 => "****".to_string(),
        Some(s) => format!("****{}", &s[s.len() - 4..]),
    }
}
