// Standard library imports
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

// External crate imports
use anyhow::{Context, Result};
use tracing::debug;

// Internal imports
use crate::config::ConsoleConfig;

/// Environment variable pointing at an alternative configuration file.
pub const CONFIG_ENV_VAR: &str = "CLOUD_CONSOLE_CONFIG";

/// Finds and loads the console configuration.
///
/// Priority chain:
/// 1. **Explicit path:** passed on the command line; must exist.
/// 2. **Environment:** `CLOUD_CONSOLE_CONFIG`; must exist when set.
/// 3. **User config:** `<config dir>/cloud-console/config.yaml`, if present.
/// 4. **Defaults.**
#[derive(Debug, Default)]
pub struct ConfigLoader {
    explicit: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            explicit: Some(path.into()),
        }
    }

    /// Location of the per-user configuration file, if the platform has one.
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("cloud-console").join("config.yaml"))
    }

    pub fn load(&self) -> Result<ConsoleConfig> {
        if let Some(path) = &self.explicit {
            return Self::load_file(path);
        }

        if let Ok(path) = env::var(CONFIG_ENV_VAR) {
            return Self::load_file(Path::new(&path))
                .with_context(|| format!("{} points at an unusable file", CONFIG_ENV_VAR));
        }

        if let Some(path) = Self::user_config_path().filter(|p| p.exists()) {
            return Self::load_file(&path);
        }

        debug!("No configuration file found, using defaults");
        Ok(ConsoleConfig::default())
    }

    /// Reads, parses and validates a configuration file.
    pub fn load_file(path: &Path) -> Result<ConsoleConfig> {
        debug!("Loading config from: {}", path.display());
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<ConsoleConfig> {
        // An empty document is a valid "all defaults" file.
        if contents.trim().is_empty() {
            return Ok(ConsoleConfig::default());
        }
        let config: ConsoleConfig = serde_yaml_ng::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_yields_defaults() {
        let config = ConfigLoader::parse("   \n").unwrap();
        assert_eq!(config, ConsoleConfig::default());
    }

    #[test]
    fn explicit_path_is_loaded_and_validated() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "datacenters: [\"a\", \"b\", \"c\"]").unwrap();
        writeln!(file, "dispatch:\n  join_timeout_secs: 90").unwrap();

        let config = ConfigLoader::with_path(file.path()).load().unwrap();
        assert_eq!(config.datacenters, vec!["a", "b", "c"]);
        assert_eq!(config.operation_workers(), 3);
        assert_eq!(
            config.dispatch.join_timeout(),
            Some(std::time::Duration::from_secs(90))
        );
    }

    #[test]
    fn missing_explicit_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigLoader::with_path(dir.path().join("nope.yaml"))
            .load()
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = ConfigLoader::parse("creation:\n  workers: 0\n").unwrap_err();
        assert!(format!("{:#}", err).contains("creation.workers"));
    }
}
