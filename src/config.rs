//! Persisted run settings, stored as YAML next to the data.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::StageError;

pub const DEFAULT_DATA_DIR: &str = "ru-smb-data";
pub const DEFAULT_CONFIG_FILE: &str = "ru-smb-data/config.yaml";
pub const DEFAULT_CHUNK_SIZE: usize = 100_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// `0` means one worker per CPU.
    pub num_workers: usize,
    pub chunk_size: usize,
    pub data_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            num_workers: 1,
            chunk_size: DEFAULT_CHUNK_SIZE,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, StageError> {
        let file = File::open(path).map_err(|e| StageError::io(path, e))?;
        let settings: Settings = serde_yaml::from_reader(file).map_err(|e| {
            StageError::Configuration(format!("invalid settings in {}: {}", path.display(), e))
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match Self::load(path) {
            Ok(settings) => {
                info!("Loaded settings from {}", path.display());
                settings
            }
            Err(e) => {
                warn!("Ignoring settings file: {}; using defaults", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), StageError> {
        self.validate()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StageError::io(parent, e))?;
        }
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| StageError::Configuration(format!("cannot serialize settings: {}", e)))?;
        fs::write(path, yaml).map_err(|e| StageError::io(path, e))
    }

    pub fn validate(&self) -> Result<(), StageError> {
        if self.chunk_size == 0 {
            return Err(StageError::Configuration("chunk_size must be positive".into()));
        }
        Ok(())
    }

    /// Worker count with `0` resolved to the number of CPUs.
    pub fn effective_workers(&self) -> usize {
        if self.num_workers == 0 {
            num_cpus::get()
        } else {
            self.num_workers
        }
    }
}
