//! Command-line interface configuration
//!
//! Settings are read from `webflash.toml` in the working directory, its
//! parent, or the user configuration directory, in that order. Every field
//! is optional.
//!
//! ```toml
//! platform = "esp32"
//! device_tag = "lamp"
//! verify = true
//! partition_table = "partitions.csv"
//! ```

use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
};

use directories::ProjectDirs;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    error::{ConfigError, Error},
    flash_target::FLASH_SECTOR_SIZE,
    image_format::Platform,
    updater::{UpdaterConfig, DEFAULT_FILESYSTEM_PARTITION},
};

/// Name of the configuration file
pub const CONFIG_FILE: &str = "webflash.toml";

/// Bytes per simulated transport read, the payload of one TCP segment
pub const DEFAULT_CHUNK_SIZE: usize = 1460;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Device family whose images are accepted
    pub platform: Platform,
    /// Page buffer size; the platform default when unset
    pub page_size: Option<u32>,
    /// Tag combined images must carry
    pub device_tag: Option<String>,
    /// Permit uploads into the factory partition
    pub allow_factory_write: bool,
    /// Check written images before selecting them for boot
    pub verify: bool,
    /// Bytes handed to the upload session per read
    pub chunk_size: usize,
    /// Flash image file
    pub flash: Option<PathBuf>,
    /// Partition table, CSV or binary
    pub partition_table: Option<PathBuf>,
    /// Partition the device is running from
    pub running: Option<String>,
    /// Data partition for filesystem uploads without a `partition` parameter
    pub filesystem_partition: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            platform: Platform::default(),
            page_size: None,
            device_tag: None,
            allow_factory_write: false,
            verify: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            flash: None,
            partition_table: None,
            running: None,
            filesystem_partition: DEFAULT_FILESYSTEM_PARTITION.to_string(),
        }
    }
}

impl Config {
    /// Load the configuration, falling back to the defaults when there is no
    /// configuration file
    pub fn load() -> Result<Self, Error> {
        let path = Self::find_config_path(CONFIG_FILE)?;
        if !path.exists() {
            debug!("No configuration file at {}", path.display());
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load the configuration file at `path`
    pub fn load_from(path: &Path) -> Result<Self, Error> {
        let raw = read_to_string(path)
            .map_err(|e| Error::FileOpenError(path.display().to_string(), e))?;

        let config = Self::parse(&raw, &path.display().to_string())?;
        debug!("Config: {:#?}", config);

        Ok(config)
    }

    fn parse(raw: &str, path: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|e| ConfigError::Parse {
            path: path.to_string(),
            message: e.message().to_string(),
        })?;

        if let Some(page_size) = config.page_size {
            if !page_size.is_power_of_two() || page_size > FLASH_SECTOR_SIZE {
                return Err(ConfigError::PageSize(page_size));
            }
        }

        Ok(config)
    }

    /// Settings for the [crate::Updater]
    pub fn updater_config(&self) -> UpdaterConfig {
        UpdaterConfig {
            platform: self.platform,
            page_size: self.page_size,
            device_tag: self.device_tag.clone(),
            allow_factory_write: self.allow_factory_write,
            verify: self.verify,
            filesystem_partition: self.filesystem_partition.clone(),
        }
    }

    fn find_config_path(filename: &str) -> Result<PathBuf, Error> {
        let local_config = std::env::current_dir()?.join(filename);
        if local_config.exists() {
            return Ok(local_config);
        }
        if let Some(parent_folder) = std::env::current_dir()?.parent() {
            let workspace_config = parent_folder.join(filename);
            if workspace_config.exists() {
                return Ok(workspace_config);
            }
        }

        let project_dirs =
            ProjectDirs::from("rs", "esp", "webflash").ok_or(ConfigError::NoConfigDirectory)?;
        Ok(project_dirs.config_dir().join(filename))
    }
}
