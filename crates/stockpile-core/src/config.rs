use crate::pipeline::PipelineOptions;
use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Contents of `<store>/config.toml`. Every key is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Download attempts after the first.
    pub retries: u32,
    pub retry_pause_secs: u64,
    /// Worker threads for updates and installs.
    pub workers: usize,
    pub keep_downloads: bool,
    /// `directory` or `mock`.
    pub installer: String,
    pub progress_updates: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_pause_secs: 2,
            workers: 2,
            keep_downloads: false,
            installer: "directory".to_owned(),
            progress_updates: 100,
        }
    }
}

impl Settings {
    pub fn parse(input: &str) -> Result<Self, CoreError> {
        let settings: Settings = toml::from_str(input)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.workers == 0 {
            return Err(CoreError::Configuration(
                "workers must be at least 1".to_owned(),
            ));
        }
        if self.progress_updates == 0 {
            return Err(CoreError::Configuration(
                "progress_updates must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn pipeline(&self) -> PipelineOptions {
        PipelineOptions {
            retries: self.retries,
            retry_pause: Duration::from_secs(self.retry_pause_secs),
            keep_downloads: self.keep_downloads,
            progress_updates: self.progress_updates,
        }
    }
}
