//! Timing configuration for deferred strategies.
//!
//! Settings are read from TOML:
//!
//! ```toml
//! [persist]
//! quiet_period_ms = 2000
//! max_deferred_ms = 5000
//! ```
//!
//! Missing keys fall back to the defaults below. An absent `[persist]` table
//! yields the default configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default quiet period after the latest edit before a save is dispatched.
pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_millis(2000);

/// Default upper bound on how long continuous editing may defer a save.
pub const DEFAULT_MAX_DEFERRED: Duration = Duration::from_millis(5000);

/// Errors that can occur when loading persistence configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Error reading a configuration file.
	#[error("I/O error reading {path}: {error}")]
	Io {
		/// Path to the file that failed to read.
		path: PathBuf,
		/// The underlying I/O error.
		error: std::io::Error,
	},

	/// Error parsing TOML syntax or shape.
	#[error("TOML parse error: {0}")]
	Parse(#[from] toml::de::Error),

	/// Values parsed but violate a timing constraint.
	#[error("invalid persistence settings: {0}")]
	Invalid(String),
}

/// Raw, serializable persistence settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistSettings {
	/// Quiet period in milliseconds.
	#[serde(default = "default_quiet_period_ms")]
	pub quiet_period_ms: u64,
	/// Maximum deferral in milliseconds.
	#[serde(default = "default_max_deferred_ms")]
	pub max_deferred_ms: u64,
}

fn default_quiet_period_ms() -> u64 {
	DEFAULT_QUIET_PERIOD.as_millis() as u64
}

fn default_max_deferred_ms() -> u64 {
	DEFAULT_MAX_DEFERRED.as_millis() as u64
}

impl Default for PersistSettings {
	fn default() -> Self {
		Self {
			quiet_period_ms: default_quiet_period_ms(),
			max_deferred_ms: default_max_deferred_ms(),
		}
	}
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
	#[serde(default)]
	persist: PersistSettings,
}

/// Validated timing configuration for a [`DeferredStrategy`](crate::DeferredStrategy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistConfig {
	/// Time without further edits after which pending work is flushed.
	pub quiet_period: Duration,
	/// Time since the first deferred edit after which the next edit forces a flush.
	pub max_deferred: Duration,
}

impl Default for PersistConfig {
	fn default() -> Self {
		Self {
			quiet_period: DEFAULT_QUIET_PERIOD,
			max_deferred: DEFAULT_MAX_DEFERRED,
		}
	}
}

impl PersistConfig {
	/// Builds a configuration from explicit durations, validating them.
	pub fn new(quiet_period: Duration, max_deferred: Duration) -> Result<Self, ConfigError> {
		if quiet_period.is_zero() {
			return Err(ConfigError::Invalid("quiet period must be non-zero".into()));
		}
		if max_deferred < quiet_period {
			return Err(ConfigError::Invalid(format!(
				"max deferral ({max_deferred:?}) is shorter than the quiet period ({quiet_period:?})"
			)));
		}
		Ok(Self {
			quiet_period,
			max_deferred,
		})
	}

	/// Validates raw settings.
	pub fn from_settings(settings: &PersistSettings) -> Result<Self, ConfigError> {
		Self::new(
			Duration::from_millis(settings.quiet_period_ms),
			Duration::from_millis(settings.max_deferred_ms),
		)
	}

	/// Parses the `[persist]` table of a TOML document.
	pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
		let file: ConfigFile = toml::from_str(input)?;
		Self::from_settings(&file.persist)
	}

	/// Reads and parses a TOML file.
	pub fn load(path: &Path) -> Result<Self, ConfigError> {
		let input = std::fs::read_to_string(path).map_err(|error| ConfigError::Io {
			path: path.to_path_buf(),
			error,
		})?;
		Self::from_toml_str(&input)
	}

	/// Returns the raw settings equivalent of this configuration.
	pub fn settings(&self) -> PersistSettings {
		PersistSettings {
			quiet_period_ms: self.quiet_period.as_millis() as u64,
			max_deferred_ms: self.max_deferred.as_millis() as u64,
		}
	}
}
