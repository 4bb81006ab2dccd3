//! Configuration Loader
//!
//! Environment-aware loading of `resilience.yaml`. The base document may carry
//! top-level `development`, `test` and `production` sections; the one matching
//! the detected environment is deep-merged over the base before deserializing.

use super::error::{ConfigResult, ConfigurationError};
use super::ResilienceConfig;
use serde_yaml::Value as YamlValue;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const CONFIG_FILE_NAMES: &[&str] = &["resilience.yaml", "resilience.yml"];
const ENVIRONMENT_SECTIONS: &[&str] = &["development", "test", "production"];
const MAX_CONFIG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Loaded, validated configuration plus where it came from
#[derive(Debug)]
pub struct ConfigManager {
    config: ResilienceConfig,
    environment: String,
    config_file: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load from a specific directory with an explicit environment.
    /// Useful for tests that must not touch process environment variables.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);

        debug!(
            environment = environment,
            directory = %config_directory.display(),
            "Loading resilience configuration"
        );

        let config_file = Self::find_config_file(&config_directory)?;
        let content = Self::read_config_file_safely(&config_file)?;
        let config = Self::parse_with_environment(&content, environment, &config_file)?;

        config.validate()?;

        info!(
            environment = environment,
            config_file = %config_file.display(),
            max_batch_size = config.batch.max_batch_size,
            retry_attempts = config.retry.max_attempts,
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_file,
        }))
    }

    /// Parse a YAML document and apply the override section for `environment`
    pub fn parse_with_environment(
        content: &str,
        environment: &str,
        source: &Path,
    ) -> ConfigResult<ResilienceConfig> {
        let mut yaml_data: YamlValue = serde_yaml::from_str(content)
            .map_err(|e| ConfigurationError::invalid_yaml(source.display().to_string(), e))?;

        if yaml_data.is_null() {
            yaml_data = YamlValue::Mapping(Default::default());
        }

        if let Some(env_overrides) = yaml_data
            .get(YamlValue::String(environment.to_string()))
            .cloned()
        {
            debug!(environment = environment, "Applying environment overrides");
            Self::merge_yaml_values(&mut yaml_data, env_overrides);
        }

        if let YamlValue::Mapping(ref mut map) = yaml_data {
            for section in ENVIRONMENT_SECTIONS {
                map.remove(YamlValue::String((*section).to_string()));
            }
        }

        let mut config: ResilienceConfig = serde_yaml::from_value(yaml_data).map_err(|e| {
            ConfigurationError::invalid_yaml(
                source.display().to_string(),
                format!("Failed to deserialize configuration: {e}"),
            )
        })?;
        config.environment = environment.to_string();

        Ok(config)
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    /// Detect current environment from environment variables
    pub fn detect_environment() -> String {
        env::var("TASKER_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }

    fn default_config_directory() -> PathBuf {
        if let Ok(dir) = env::var("TASKER_CONFIG_DIR") {
            return PathBuf::from(dir);
        }
        if let Ok(manifest_dir) = env::var("CARGO_MANIFEST_DIR") {
            let dir = PathBuf::from(manifest_dir).join("config");
            if dir.exists() {
                return dir;
            }
        }
        PathBuf::from("config")
    }

    fn find_config_file(config_directory: &Path) -> ConfigResult<PathBuf> {
        let mut searched_paths = Vec::new();

        for name in CONFIG_FILE_NAMES {
            let config_path = config_directory.join(name);
            searched_paths.push(config_path.clone());

            if config_path.exists() {
                debug!(path = %config_path.display(), "Found configuration file");
                return Ok(config_path);
            }
        }

        Err(ConfigurationError::config_file_not_found(searched_paths))
    }

    fn read_config_file_safely(path: &Path) -> ConfigResult<String> {
        let metadata = std::fs::metadata(path)
            .map_err(|e| ConfigurationError::file_read_error(path.display().to_string(), e))?;

        if metadata.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigurationError::invalid_value(
                "file_size",
                metadata.len().to_string(),
                format!(
                    "Configuration file too large ({}MB > {}MB limit)",
                    metadata.len() / (1024 * 1024),
                    MAX_CONFIG_FILE_SIZE / (1024 * 1024)
                ),
            ));
        }

        if !metadata.is_file() {
            return Err(ConfigurationError::invalid_value(
                "file_type",
                "directory or special file".to_string(),
                "Configuration path must point to a regular file",
            ));
        }

        std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::file_read_error(path.display().to_string(), e))
    }

    /// Recursively merge YAML values (environment overrides into base config)
    fn merge_yaml_values(base: &mut YamlValue, override_value: YamlValue) {
        match (&mut *base, override_value) {
            (YamlValue::Mapping(base_map), YamlValue::Mapping(override_map)) => {
                for (key, value) in override_map {
                    if let Some(existing_value) = base_map.get_mut(&key) {
                        Self::merge_yaml_values(existing_value, value);
                    } else {
                        base_map.insert(key, value);
                    }
                }
            }
            (base_ref, override_val) => {
                *base_ref = override_val;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
retry:
  max_attempts: 4
  base_delay_ms: 250
batch:
  max_batch_size: 20
  max_wait_time_ms: 500
circuit_breakers:
  component_configs:
    workflow_service:
      failure_threshold: 3
      minimum_calls_to_trip: 6
      reset_timeout_ms: 10000
      rolling_count_window_ms: 30000
      timeout_ms: 2000
test:
  batch:
    max_wait_time_ms: 10
  retry:
    base_delay_ms: 1
production:
  batch:
    concurrency: 8
"#;

    fn write_config(content: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("resilience.yaml")).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        dir
    }

    #[test]
    fn test_environment_overrides_are_merged() {
        let dir = write_config(SAMPLE);
        let manager =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test")
                .unwrap();

        let config = manager.config();
        assert_eq!(manager.environment(), "test");
        assert_eq!(config.environment, "test");
        assert_eq!(config.batch.max_batch_size, 20);
        assert_eq!(config.batch.max_wait_time_ms, 10);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.base_delay_ms, 1);
        assert_eq!(config.batch.concurrency, 1);
        assert_eq!(
            config
                .circuit_breakers
                .config_for_component("workflow_service")
                .minimum_calls_to_trip,
            6
        );
    }

    #[test]
    fn test_other_environment_sections_are_ignored() {
        let dir = write_config(SAMPLE);
        let manager = ConfigManager::load_from_directory_with_env(
            Some(dir.path().to_path_buf()),
            "production",
        )
        .unwrap();

        assert_eq!(manager.config().batch.concurrency, 8);
        assert_eq!(manager.config().batch.max_wait_time_ms, 500);
    }

    #[test]
    fn test_missing_file_lists_searched_paths() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test")
            .unwrap_err();
        match err {
            ConfigurationError::ConfigFileNotFound { searched_paths } => {
                assert_eq!(searched_paths.len(), 2)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_invalid_values_fail_validation() {
        let dir = write_config("batch:\n  max_batch_size: 0\n");
        let err = ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test")
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::ValidationError { .. }));
    }

    #[test]
    fn test_empty_document_yields_defaults() {
        let config =
            ConfigManager::parse_with_environment("", "development", Path::new("inline")).unwrap();
        assert_eq!(config.batch, super::super::BatchSettings::default());
        assert_eq!(config.environment, "development");
    }
}
