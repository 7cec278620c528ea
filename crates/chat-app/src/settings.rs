use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arbor_core::{
    CompletionOptions, DEFAULT_SYSTEM_PROMPT, DEFAULT_TITLE_MAX_CHARS, Observers, ServiceConfig,
    Subscription,
};
use arbor_llm::{DEFAULT_OPENAI_MODEL, ProviderConfig};
use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const DEFAULT_PROVIDER_ID: &str = "openai";
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const SETTINGS_DIRECTORY_NAME: &str = "arbor";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "arbor.db";
pub const ENV_PREFIX: &str = "ARBOR_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default = "default_stream")]
    pub stream: bool,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: default_endpoint(),
            model: default_model(),
            temperature: None,
            max_tokens: None,
            stream: default_stream(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_init_retry_attempts")]
    pub init_retry_attempts: u32,
    #[serde(default = "default_init_retry_backoff_ms")]
    pub init_retry_backoff_ms: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            init_retry_attempts: default_init_retry_attempts(),
            init_retry_backoff_ms: default_init_retry_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_title_max_chars")]
    pub title_max_chars: usize,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            title_max_chars: default_title_max_chars(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub chat: ChatSettings,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider: ProviderSettings::default(),
            storage: StorageSettings::default(),
            chat: ChatSettings::default(),
            log_level: default_log_level(),
        }
    }
}

impl Settings {
    pub fn normalized(mut self) -> Self {
        let provider = &mut self.provider;
        provider.provider_id = non_blank(&provider.provider_id).unwrap_or_else(default_provider_id);
        provider.api_key = provider.api_key.trim().to_string();
        provider.endpoint = non_blank(&provider.endpoint).unwrap_or_else(default_endpoint);
        provider.model = non_blank(&provider.model).unwrap_or_else(default_model);
        provider.temperature = provider
            .temperature
            .filter(|temperature| temperature.is_finite())
            .map(|temperature| temperature.clamp(0.0, 2.0));
        provider.max_tokens = provider.max_tokens.filter(|max_tokens| *max_tokens > 0);

        if self.storage.database_path.as_os_str().is_empty() {
            self.storage.database_path = default_database_path();
        }
        self.storage.init_retry_attempts = self.storage.init_retry_attempts.max(1);

        self.chat.system_prompt =
            non_blank(&self.chat.system_prompt).unwrap_or_else(default_system_prompt);
        if self.chat.title_max_chars == 0 {
            self.chat.title_max_chars = default_title_max_chars();
        }
        self.log_level = non_blank(&self.log_level).unwrap_or_else(default_log_level);

        self
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            system_prompt: self.chat.system_prompt.clone(),
            title_max_chars: self.chat.title_max_chars,
            init_retry_attempts: self.storage.init_retry_attempts,
            init_retry_backoff: Duration::from_millis(self.storage.init_retry_backoff_ms),
        }
    }

    pub fn completion_options(&self) -> CompletionOptions {
        CompletionOptions {
            provider_id: self.provider.provider_id.clone(),
            model_id: self.provider.model.clone(),
            stream: self.provider.stream,
            temperature: self.provider.temperature,
            max_tokens: self.provider.max_tokens,
        }
    }

    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig::new(
            &self.provider.provider_id,
            &self.provider.api_key,
            &self.provider.endpoint,
        )
    }
}

/// Receives the new settings after every successful update.
pub trait SettingsListener: Send + Sync {
    fn on_settings_changed(&self, settings: &Settings);
}

impl<F> SettingsListener for F
where
    F: Fn(&Settings) + Send + Sync,
{
    fn on_settings_changed(&self, settings: &Settings) {
        self(settings)
    }
}

pub struct SettingsService {
    settings: ArcSwap<Settings>,
    config_path: PathBuf,
    listeners: Observers<dyn SettingsListener>,
}

impl SettingsService {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".arbor"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: ArcSwap::from_pointee(settings),
            config_path,
            listeners: Observers::new(),
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    /// Persists, swaps, then notifies; a failed write leaves the current settings in place.
    pub fn update(&self, settings: Settings) -> Result<Arc<Settings>, SettingsError> {
        let normalized = Arc::new(settings.normalized());
        self.persist(&normalized)?;
        self.settings.store(Arc::clone(&normalized));
        self.listeners
            .notify(|listener| listener.on_settings_changed(&normalized));
        Ok(normalized)
    }

    pub fn subscribe(&self, listener: Arc<dyn SettingsListener>) -> Subscription {
        self.listeners.subscribe(listener)
    }

    /// Defaults, then the JSON file, then `ARBOR_` environment variables.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    fn load_from_disk(path: &Path) -> Settings {
        if !path.exists() {
            tracing::info!(path = %path.display(), "settings file not found, using defaults");
        }

        match Self::figment(path).extract::<Settings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                Settings::default()
            }
        }
    }

    fn persist(&self, settings: &Settings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = %self.config_path.display(), "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn non_blank(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn default_provider_id() -> String {
    DEFAULT_PROVIDER_ID.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_model() -> String {
    DEFAULT_OPENAI_MODEL.to_string()
}

fn default_stream() -> bool {
    true
}

fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".arbor"))
        .join(DATABASE_FILE_NAME)
}

fn default_init_retry_attempts() -> u32 {
    5
}

fn default_init_retry_backoff_ms() -> u64 {
    100
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_title_max_chars() -> usize {
    DEFAULT_TITLE_MAX_CHARS
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
