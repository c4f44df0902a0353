use crate::models::{AppConfig, CoreSettings};
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;

/// File holding [`CoreSettings`] inside the configuration directory
pub const SETTINGS_FILE: &str = "slotwork.yaml";

/// Prefix of environment variables overriding settings (`SLOTWORK__LOGGING__DEBUG=true`)
pub const ENV_PREFIX: &str = "SLOTWORK";

/// Loads and saves the crate's configuration files.
///
/// Two kinds of files live in the configuration directory:
/// - `slotwork.yaml`: process settings ([`CoreSettings`]), layered with
///   `SLOTWORK__*` environment variables through the `config` crate
/// - application files (any name): service composition ([`AppConfig`]),
///   read and written with `serde_yaml_ng`
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_dir: Utf8PathBuf,
    settings_path: Utf8PathBuf,
}

impl ConfigManager {
    /// Create a manager for `config_dir`, creating the directory if needed.
    pub fn new<P: AsRef<Utf8Path>>(config_dir: P) -> Result<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create config directory: {}", config_dir))?;
        }

        Ok(Self {
            settings_path: config_dir.join(SETTINGS_FILE),
            config_dir,
        })
    }

    /// Load process settings from the settings file and the environment.
    ///
    /// A missing settings file is not an error; defaults apply.
    pub fn load_settings(&self) -> Result<CoreSettings> {
        self.load_settings_from(None)
    }

    /// Like [`load_settings`](Self::load_settings) with an explicit set of
    /// environment variables instead of the process environment.
    pub fn load_settings_from(
        &self,
        environment: Option<config::Map<String, String>>,
    ) -> Result<CoreSettings> {
        if !self.settings_path.exists() {
            tracing::debug!(
                "Settings file not found at {}, using defaults and environment",
                self.settings_path
            );
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(self.settings_path.as_std_path()).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .source(environment),
            )
            .build()
            .with_context(|| format!("Failed to read settings: {}", self.settings_path))?;

        let settings: CoreSettings = settings
            .try_deserialize()
            .with_context(|| format!("Failed to parse settings: {}", self.settings_path))?;

        tracing::info!("Loaded settings from {}", self.settings_path);
        Ok(settings)
    }

    /// Save process settings to the settings file.
    pub fn save_settings(&self, settings: &CoreSettings) -> Result<()> {
        let yaml_string =
            serde_yaml_ng::to_string(settings).context("Failed to serialize settings to YAML")?;

        fs::write(&self.settings_path, yaml_string)
            .with_context(|| format!("Failed to write settings: {}", self.settings_path))?;

        tracing::info!("Saved settings to {}", self.settings_path);
        Ok(())
    }

    /// Load an application file from the configuration directory.
    ///
    /// Returns an empty application if the file doesn't exist.
    pub fn load_app_config(&self, file_name: &str) -> Result<AppConfig> {
        let path = self.config_dir.join(file_name);
        if !path.exists() {
            tracing::warn!("Application config not found at {}, using an empty one", path);
            return Ok(AppConfig::default());
        }

        let file_contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read application config: {}", path))?;

        let config = Self::parse_app_config(&file_contents)
            .with_context(|| format!("Failed to parse application config: {}", path))?;

        tracing::info!(
            "Loaded application config from {} ({} services)",
            path,
            config.services.len()
        );
        Ok(config)
    }

    /// Save an application file to the configuration directory.
    pub fn save_app_config(&self, file_name: &str, config: &AppConfig) -> Result<()> {
        let path = self.config_dir.join(file_name);
        let yaml_string = serde_yaml_ng::to_string(config)
            .context("Failed to serialize application config to YAML")?;

        fs::write(&path, yaml_string)
            .with_context(|| format!("Failed to write application config: {}", path))?;

        tracing::info!("Saved application config to {}", path);
        Ok(())
    }

    /// Parse an application description from YAML text.
    pub fn parse_app_config(text: &str) -> Result<AppConfig> {
        let config: AppConfig = serde_yaml_ng::from_str(text)?;

        let mut seen = std::collections::HashSet::new();
        for service in &config.services {
            if !seen.insert(service.uid.as_str()) {
                anyhow::bail!("Service uid '{}' is declared twice", service.uid);
            }
        }

        let mut channels = std::collections::HashSet::new();
        for connection in &config.connections {
            if !channels.insert(connection.channel.as_str()) {
                anyhow::bail!("Channel '{}' is declared twice", connection.channel);
            }
        }
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir(&self) -> &Utf8Path {
        &self.config_dir
    }

    pub fn settings_path(&self) -> &Utf8Path {
        &self.settings_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChannelConfig, ObjectConfig, ServiceConfig};
    use tempfile::TempDir;

    fn create_test_config_manager() -> (ConfigManager, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config_path = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        let manager = ConfigManager::new(&config_path).unwrap();
        (manager, temp_dir)
    }

    #[test]
    fn test_missing_settings_use_defaults() {
        let (manager, _temp_dir) = create_test_config_manager();
        let settings = manager.load_settings_from(Some(config::Map::new())).unwrap();
        assert_eq!(settings, CoreSettings::default());
    }

    #[test]
    fn test_settings_round_trip_through_file() {
        let (manager, _temp_dir) = create_test_config_manager();

        let mut settings = CoreSettings::default();
        settings.default_worker = "main".to_string();
        settings.logging.debug = true;
        manager.save_settings(&settings).unwrap();

        let loaded = manager.load_settings_from(Some(config::Map::new())).unwrap();
        assert_eq!(loaded.default_worker, "main");
        assert!(loaded.logging.debug);
    }

    #[test]
    fn test_environment_overrides_file() {
        let (manager, _temp_dir) = create_test_config_manager();
        manager.save_settings(&CoreSettings::default()).unwrap();

        let mut environment = config::Map::new();
        environment.insert("SLOTWORK__LOGGING__CONSOLE".to_string(), "true".to_string());
        environment.insert("SLOTWORK__DEFAULT_WORKER".to_string(), "gui".to_string());

        let loaded = manager.load_settings_from(Some(environment)).unwrap();
        assert!(loaded.logging.console);
        assert_eq!(loaded.default_worker, "gui");
    }

    #[test]
    fn test_app_config_save_and_load() {
        let (manager, _temp_dir) = create_test_config_manager();
        let app = AppConfig {
            workers: vec!["io".to_string()],
            services: vec![
                ServiceConfig::new("reader", "Reader")
                    .worker("io")
                    .object(ObjectConfig::new("image", "ct")),
            ],
            connections: vec![ChannelConfig::new("loaded").signal("reader", "updated")],
        };

        manager.save_app_config("viewer.yaml", &app).unwrap();
        let loaded = manager.load_app_config("viewer.yaml").unwrap();
        assert_eq!(loaded, app);
    }

    #[test]
    fn test_missing_app_config_is_empty() {
        let (manager, _temp_dir) = create_test_config_manager();
        let loaded = manager.load_app_config("absent.yaml").unwrap();
        assert!(loaded.services.is_empty());
    }

    #[test]
    fn test_duplicate_service_uid_is_rejected() {
        let yaml = r#"
services:
  - uid: a
    type: T
  - uid: a
    type: U
"#;
        let err = ConfigManager::parse_app_config(yaml).unwrap_err();
        assert!(err.to_string().contains("declared twice"));
    }

    #[test]
    fn test_duplicate_channel_is_rejected() {
        let yaml = r#"
connections:
  - channel: progress
  - channel: progress
"#;
        let err = ConfigManager::parse_app_config(yaml).unwrap_err();
        assert!(err.to_string().contains("Channel 'progress'"));
    }
}
