use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use parley_llm::{DEFAULT_GEMINI_ENDPOINT, DEFAULT_GEMINI_MODEL, GEMINI_PROVIDER_ID, ProviderConfig};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::error::{
    CreateDirSnafu, RenameTempFileSnafu, SerializeConfigSnafu, SettingsError, WriteFileSnafu,
};

pub const SETTINGS_DIRECTORY_NAME: &str = "parley";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "parley.sqlite3";
pub const ENV_PREFIX: &str = "PARLEY_";
pub const FALLBACK_API_KEY_ENV: &str = "GEMINI_API_KEY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThemePreference {
    #[default]
    Light,
    Dark,
}

impl ThemePreference {
    pub fn is_dark(self) -> bool {
        self == Self::Dark
    }

    pub fn toggled(self) -> Self {
        match self {
            Self::Light => Self::Dark,
            Self::Dark => Self::Light,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default)]
    pub theme: ThemePreference,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: default_endpoint(),
            model: default_model(),
            database_path: default_database_path(),
            theme: ThemePreference::default(),
        }
    }
}

impl ChatSettings {
    pub fn normalized(mut self) -> Self {
        self.provider_id = non_blank_or(self.provider_id, default_provider_id);
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = non_blank_or(self.endpoint, default_endpoint);
        self.model = non_blank_or(self.model, default_model);
        if self.database_path.as_os_str().is_empty() {
            self.database_path = default_database_path();
        }
        self
    }

    /// Configured key, or the conventional Gemini variable when none is set.
    pub fn resolved_api_key(&self) -> Option<String> {
        if !self.api_key.is_empty() {
            return Some(self.api_key.clone());
        }

        std::env::var(FALLBACK_API_KEY_ENV)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    pub fn to_provider_config(&self) -> Option<ProviderConfig> {
        let api_key = self.resolved_api_key()?;
        Some(ProviderConfig::new(
            &self.provider_id,
            api_key,
            &self.endpoint,
        ))
    }
}

/// Shared, atomically swappable settings backed by a JSON file.
pub struct SettingsStore {
    settings: Arc<ArcSwap<ChatSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".parley"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<ChatSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: ChatSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    pub fn set_theme(&self, theme: ThemePreference) -> Result<(), SettingsError> {
        let mut settings = self.settings().as_ref().clone();
        settings.theme = theme;
        self.update(settings)
    }

    fn load_from_disk(path: &Path) -> ChatSettings {
        if !path.exists() {
            tracing::info!(path = ?path, "settings file not found, using defaults");
        }

        let figment = Figment::from(Serialized::defaults(ChatSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<ChatSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(path = ?path, error = %error, "failed to parse settings, using defaults");
                ChatSettings::default()
            }
        }
    }

    fn persist(&self, settings: &ChatSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
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

        tracing::info!(path = ?self.config_path, "saved settings");
        Ok(())
    }
}

fn non_blank_or(value: String, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}

fn default_provider_id() -> String {
    GEMINI_PROVIDER_ID.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_GEMINI_ENDPOINT.to_string()
}

fn default_model() -> String {
    DEFAULT_GEMINI_MODEL.to_string()
}

pub fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".parley"))
        .join(DATABASE_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn file_values_override_defaults_and_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                SETTINGS_FILE_NAME,
                r#"{ "api_key": " file-key ", "model": "gemini-2.0-flash", "theme": "dark" }"#,
            )?;
            jail.set_env("PARLEY_MODEL", "gemini-2.5-pro");

            let store = SettingsStore::new(jail.directory().join(SETTINGS_FILE_NAME));
            let settings = store.settings();

            assert_eq!(settings.api_key, "file-key");
            assert_eq!(settings.model, "gemini-2.5-pro");
            assert_eq!(settings.theme, ThemePreference::Dark);
            assert_eq!(settings.provider_id, GEMINI_PROVIDER_ID);
            Ok(())
        });
    }

    #[test]
    fn invalid_file_falls_back_to_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(SETTINGS_FILE_NAME, r#"{ "theme": 42 "#)?;

            let store = SettingsStore::new(jail.directory().join(SETTINGS_FILE_NAME));

            assert_eq!(store.settings().model, DEFAULT_GEMINI_MODEL);
            assert_eq!(store.settings().theme, ThemePreference::Light);
            Ok(())
        });
    }

    #[test]
    fn gemini_key_env_is_used_when_no_key_configured() {
        Jail::expect_with(|jail| {
            jail.set_env(FALLBACK_API_KEY_ENV, "env-key");

            let store = SettingsStore::new(jail.directory().join(SETTINGS_FILE_NAME));
            let config = store.settings().to_provider_config().unwrap();

            assert_eq!(config.api_key, "env-key");
            assert_eq!(config.provider_id, GEMINI_PROVIDER_ID);
            Ok(())
        });
    }

    #[test]
    fn update_persists_atomically_and_reloads() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested").join(SETTINGS_FILE_NAME);
        let store = SettingsStore::new(path.clone());

        store.set_theme(ThemePreference::Dark).unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(SettingsStore::new(path).settings().theme, ThemePreference::Dark);
    }

    #[test]
    fn normalized_fills_blank_fields() {
        let settings = ChatSettings {
            provider_id: "  ".to_string(),
            model: String::new(),
            database_path: PathBuf::new(),
            ..ChatSettings::default()
        }
        .normalized();

        assert_eq!(settings.provider_id, GEMINI_PROVIDER_ID);
        assert_eq!(settings.model, DEFAULT_GEMINI_MODEL);
        assert_eq!(settings.database_path, default_database_path());
    }

    #[test]
    fn theme_toggles() {
        assert_eq!(ThemePreference::Light.toggled(), ThemePreference::Dark);
        assert!(ThemePreference::Light.toggled().is_dark());
    }
}
