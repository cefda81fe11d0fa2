//! Configuration types for aax-pipeline

use crate::error::{Error, Result};
use crate::types::ItemId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Top-level pipeline configuration
///
/// Works out of the box with [`Config::default`]; every margin and tolerance
/// can be overridden. All fields have serde defaults so partial config files
/// deserialize cleanly.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Local artifact areas and space margins
    #[serde(default)]
    pub storage: StorageConfig,

    /// Per-stage retry behaviour
    #[serde(default)]
    pub retry: RetryConfig,

    /// Conversion validation
    #[serde(default)]
    pub validation: ValidationConfig,
}

impl Config {
    /// Validate cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the offending key when a value is
    /// outside its meaningful range.
    pub fn validate(&self) -> Result<()> {
        if self.validation.size_tolerance <= 0.0 || self.validation.size_tolerance >= 1.0 {
            return Err(Error::Config {
                message: format!(
                    "size_tolerance must be in (0, 1), got {}",
                    self.validation.size_tolerance
                ),
                key: Some("validation.size_tolerance".to_string()),
            });
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::Config {
                message: format!(
                    "backoff_multiplier must be >= 1.0, got {}",
                    self.retry.backoff_multiplier
                ),
                key: Some("retry.backoff_multiplier".to_string()),
            });
        }
        if self.storage.raw_extension.is_empty() || self.storage.converted_extension.is_empty() {
            return Err(Error::Config {
                message: "artifact extensions must be non-empty".to_string(),
                key: Some("storage.raw_extension".to_string()),
            });
        }
        Ok(())
    }

    /// Stable path of the raw encrypted artifact for an item
    pub fn raw_artifact_path(&self, item: &ItemId) -> PathBuf {
        self.storage
            .raw_dir
            .join(format!("{}.{}", item, self.storage.raw_extension))
    }

    /// Stable path of the converted plaintext artifact for an item
    pub fn converted_artifact_path(&self, item: &ItemId) -> PathBuf {
        self.storage
            .converted_dir
            .join(format!("{}.{}", item, self.storage.converted_extension))
    }

    /// Transient per-item download area (removed after the move stage)
    pub fn transient_dir_for(&self, item: &ItemId) -> PathBuf {
        self.storage.transient_dir.join(format!("download_{item}"))
    }

    /// Remote destination path for an item's converted artifact
    pub fn remote_dest_path(&self, item: &ItemId) -> String {
        format!("audiobooks/{}.{}", item, self.storage.converted_extension)
    }
}

/// Local filesystem areas and free-space margins
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Stable directory for raw encrypted artifacts
    #[serde(default = "default_raw_dir")]
    pub raw_dir: PathBuf,

    /// Stable directory for converted plaintext artifacts
    #[serde(default = "default_converted_dir")]
    pub converted_dir: PathBuf,

    /// Transient area for in-flight downloads
    #[serde(default = "default_transient_dir")]
    pub transient_dir: PathBuf,

    /// Extension of the encrypted source container (default: "aax")
    #[serde(default = "default_raw_extension")]
    pub raw_extension: String,

    /// Extension of the converted artifact (default: "m4b")
    #[serde(default = "default_converted_extension")]
    pub converted_extension: String,

    /// Margin required on top of the estimated download size (default: 100 MiB)
    #[serde(default = "default_download_margin")]
    pub download_margin_bytes: u64,

    /// Free space required when the remote size cannot be estimated (default: 300 MiB)
    #[serde(default = "default_fallback_required")]
    pub fallback_required_bytes: u64,

    /// Free space required before the post-download move (default: 50 MiB)
    #[serde(default = "default_move_margin")]
    pub move_margin_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            raw_dir: default_raw_dir(),
            converted_dir: default_converted_dir(),
            transient_dir: default_transient_dir(),
            raw_extension: default_raw_extension(),
            converted_extension: default_converted_extension(),
            download_margin_bytes: default_download_margin(),
            fallback_required_bytes: default_fallback_required(),
            move_margin_bytes: default_move_margin(),
        }
    }
}

/// Retry configuration for pipeline stages
///
/// Exponential backoff with jitter. `max_attempts` counts retries, so the
/// default of 2 yields up to 3 total attempts per stage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts per stage (default: 2)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Validation of converted artifacts
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Allowed relative size deviation between original and converted
    /// artifacts (default: 0.05 = ±5%)
    #[serde(default = "default_size_tolerance")]
    pub size_tolerance: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            size_tolerance: default_size_tolerance(),
        }
    }
}

fn default_raw_dir() -> PathBuf {
    PathBuf::from("audiobooks/raw")
}

fn default_converted_dir() -> PathBuf {
    PathBuf::from("audiobooks/converted")
}

fn default_transient_dir() -> PathBuf {
    PathBuf::from("audiobooks/tmp")
}

fn default_raw_extension() -> String {
    "aax".to_string()
}

fn default_converted_extension() -> String {
    "m4b".to_string()
}

fn default_download_margin() -> u64 {
    100 * MIB
}

fn default_fallback_required() -> u64 {
    300 * MIB
}

fn default_move_margin() -> u64 {
    50 * MIB
}

fn default_max_attempts() -> u32 {
    2
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_size_tolerance() -> f64 {
    0.05
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
