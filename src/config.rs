use std::{
	fs,
	path::{Path, PathBuf},
	time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{engine::RetryPolicy, models::SyncDirection};

pub const CONFIG_FILE: &str = "shotsync.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read {path}: {source}")]
	Read {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to parse {path}: {source}")]
	Parse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},

	#[error("invalid configuration: {0}")]
	Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	pub server: ServerConfig,
	/// No peer means a standalone node: reads and writes work, sync does not.
	pub peer: Option<PeerConfig>,
	pub sync: SyncConfig,
	pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
	pub bind: String,
	/// Secret peers must send in `x-api-key`. Unset disables the check.
	pub api_key: Option<String>,
}

impl Default for ServerConfig {
	fn default() -> Self {
		ServerConfig { bind: "127.0.0.1:8787".into(), api_key: None }
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
	pub url: String,
	#[serde(default)]
	pub api_key: Option<String>,
	#[serde(default = "default_timeout_secs")]
	pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
	10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
	pub startup_direction: SyncDirection,
	/// Seconds between timer passes; 0 disables the timer.
	pub interval_secs: u64,
	/// Direction of timer passes.
	pub timer_direction: SyncDirection,
	/// How long an explicit trigger waits for a running pass.
	pub busy_wait_ms: u64,
	/// Push each local mutation to the peer as it happens.
	pub notify_peer: bool,
	/// Run a bidirectional pass after each local mutation and report it.
	pub reconcile_on_mutation: bool,
	pub retry: RetryPolicy,
}

impl Default for SyncConfig {
	fn default() -> Self {
		SyncConfig {
			startup_direction: SyncDirection::Pull,
			interval_secs: 300,
			timer_direction: SyncDirection::Bidirectional,
			busy_wait_ms: 1000,
			notify_peer: true,
			reconcile_on_mutation: false,
			retry: RetryPolicy::default(),
		}
	}
}

impl SyncConfig {
	pub fn interval(&self) -> Option<Duration> {
		(self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
	}

	pub fn busy_wait(&self) -> Duration {
		Duration::from_millis(self.busy_wait_ms)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
	pub data_dir: PathBuf,
	/// Sheet file regenerated after store changes. Defaults to
	/// `<data_dir>/records.json`.
	pub mirror_path: Option<PathBuf>,
	/// Disable mirror regeneration entirely.
	pub mirror_enabled: bool,
	/// Root of the `<projectType>/<title>/<scene>/<shot>` tree.
	pub structure_root: Option<PathBuf>,
}

impl Default for StorageConfig {
	fn default() -> Self {
		StorageConfig {
			data_dir: default_data_dir(),
			mirror_path: None,
			mirror_enabled: true,
			structure_root: None,
		}
	}
}

impl StorageConfig {
	pub fn mirror_path(&self) -> PathBuf {
		self.mirror_path.clone().unwrap_or_else(|| self.data_dir.join("records.json"))
	}
}

fn default_data_dir() -> PathBuf {
	dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join("shotsync")
}

/// `<config dir>/shotsync/shotsync.toml`, if the platform has a config dir.
pub fn default_path() -> Option<PathBuf> {
	dirs::config_dir().map(|d| d.join("shotsync").join(CONFIG_FILE))
}

impl Config {
	/// Load from `path`, or from the default location when it exists.
	/// Falls back to built-in defaults when no file is given or found.
	pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
		let path = match path {
			Some(p) => p.to_path_buf(),
			None => match default_path().filter(|p| p.exists()) {
				Some(p) => p,
				None => return Ok(Config::default()),
			},
		};

		let text = fs::read_to_string(&path).map_err(|source| ConfigError::Read { path: path.clone(), source })?;
		let config = Self::parse(&text).map_err(|e| match e {
			ConfigError::Parse { source, .. } => ConfigError::Parse { path: path.clone(), source },
			other => other,
		})?;
		tracing::debug!(path = %path.display(), "configuration loaded");
		Ok(config)
	}

	pub fn parse(text: &str) -> Result<Self, ConfigError> {
		let config: Config =
			toml::from_str(text).map_err(|source| ConfigError::Parse { path: PathBuf::new(), source })?;
		config.validate()?;
		Ok(config)
	}

	fn validate(&self) -> Result<(), ConfigError> {
		if let Some(peer) = &self.peer {
			if !(peer.url.starts_with("http://") || peer.url.starts_with("https://")) {
				return Err(ConfigError::Invalid(format!("peer.url must be an http(s) url, got {:?}", peer.url)));
			}
			if peer.timeout_secs == 0 {
				return Err(ConfigError::Invalid("peer.timeout_secs must be positive".into()));
			}
		}
		if self.sync.retry.max_attempts == 0 {
			return Err(ConfigError::Invalid("sync.retry.max_attempts must be at least 1".into()));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_file_is_all_defaults() {
		let config = Config::parse("").unwrap();
		assert!(config.peer.is_none());
		assert_eq!(config.server.bind, "127.0.0.1:8787");
		assert_eq!(config.sync.startup_direction, SyncDirection::Pull);
		assert_eq!(config.sync.busy_wait(), Duration::from_secs(1));
		assert_eq!(config.sync.retry, RetryPolicy::default());
		assert_eq!(config.storage.mirror_path(), config.storage.data_dir.join("records.json"));
	}

	#[test]
	fn full_file() {
		let config = Config::parse(
			r#"
            [server]
            bind = "0.0.0.0:9000"
            api_key = "s3cret"

            [peer]
            url = "https://remote.example:8443"
            api_key = "other"

            [sync]
            startup_direction = "both"
            interval_secs = 0
            reconcile_on_mutation = true

            [sync.retry]
            max_attempts = 5
            deferred_delay = 0

            [storage]
            data_dir = "/var/lib/shotsync"
            structure_root = "/mnt/projects"
            "#,
		)
		.unwrap();

		let peer = config.peer.unwrap();
		assert_eq!(peer.timeout_secs, 10);
		assert_eq!(config.server.api_key.as_deref(), Some("s3cret"));
		assert_eq!(config.sync.startup_direction, SyncDirection::Bidirectional);
		assert_eq!(config.sync.interval(), None);
		assert!(config.sync.reconcile_on_mutation);
		assert_eq!(config.sync.retry.max_attempts, 5);
		assert_eq!(config.sync.retry.deferred_delay, None);
		assert_eq!(config.storage.mirror_path(), PathBuf::from("/var/lib/shotsync/records.json"));
	}

	#[test]
	fn rejects_non_http_peer() {
		let err = Config::parse("[peer]\nurl = \"remote:8080\"").unwrap_err();
		assert!(matches!(err, ConfigError::Invalid(_)));
	}

	#[test]
	fn unknown_direction_is_a_parse_error() {
		let err = Config::parse("[sync]\nstartup_direction = \"sideways\"").unwrap_err();
		assert!(matches!(err, ConfigError::Parse { .. }));
	}

	#[test]
	fn load_reads_file() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join(CONFIG_FILE);
		fs::write(&path, "[sync]\ninterval_secs = 60\n").unwrap();

		let config = Config::load(Some(&path)).unwrap();
		assert_eq!(config.sync.interval(), Some(Duration::from_secs(60)));

		let missing = Config::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
		assert!(matches!(missing, ConfigError::Read { .. }));
	}
}
