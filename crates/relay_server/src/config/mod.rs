#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use relay_protocol::DEFAULT_MAX_FRAME_SIZE;
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::connection::ConnectionSettings;

/// Listen endpoint used when neither the file nor the CLI names one.
pub const DEFAULT_BIND: &str = "tcp://0.0.0.0:8080";

/// Default config path: `~/.chat_relay/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".chat_relay").join("config.toml"))
}

/// Load the server config from TOML at `path` (missing file = defaults) and
/// `RELAY_*` environment overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Relay listen endpoint (`tcp://host:port`).
	pub bind: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Largest accepted or written frame payload.
	pub max_frame_bytes: usize,
	/// Per-connection outbound queue bound.
	pub outbound_queue_capacity: usize,
	/// Admission cap; `None` accepts without limit.
	pub max_connections: Option<usize>,
}

impl Default for ServerSettings {
	fn default() -> Self {
		let conn = ConnectionSettings::default();
		Self {
			bind: DEFAULT_BIND.to_string(),
			metrics_bind: None,
			health_bind: None,
			max_frame_bytes: conn.max_frame_bytes,
			outbound_queue_capacity: conn.outbound_queue_capacity,
			max_connections: None,
		}
	}
}

impl ServerSettings {
	pub fn connection_settings(&self) -> ConnectionSettings {
		ConnectionSettings {
			max_frame_bytes: self.max_frame_bytes,
			outbound_queue_capacity: self.outbound_queue_capacity,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Use the SQL store instead of the in-process one.
	pub enabled: bool,
	/// Database URL (`sqlite:` only).
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	max_frame_bytes: Option<usize>,
	outbound_queue_capacity: Option<usize>,
	max_connections: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerSettings::default();
		Self {
			server: ServerSettings {
				bind: file
					.server
					.bind
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(defaults.bind),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				max_frame_bytes: file
					.server
					.max_frame_bytes
					.filter(|v| *v > 0)
					.unwrap_or(defaults.max_frame_bytes),
				outbound_queue_capacity: file
					.server
					.outbound_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(defaults.outbound_queue_capacity),
				max_connections: file.server.max_connections.filter(|v| *v > 0),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	apply_env_overrides_from(cfg, |key| std::env::var(key).ok());
}

/// Apply `RELAY_*` overrides read through `lookup`.
fn apply_env_overrides_from<F>(cfg: &mut ServerConfig, lookup: F)
where
	F: Fn(&str) -> Option<String>,
{
	let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = non_empty("RELAY_BIND") {
		cfg.server.bind = v;
		info!("server config: bind overridden by env");
	}

	if let Some(v) = non_empty("RELAY_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = non_empty("RELAY_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = non_empty("RELAY_MAX_FRAME_BYTES") {
		match v.parse::<usize>() {
			Ok(bytes) if bytes > 0 => {
				cfg.server.max_frame_bytes = bytes;
				info!(bytes, "server config: max_frame_bytes overridden by env");
			}
			_ => warn!(value = %v, "server config: ignoring invalid RELAY_MAX_FRAME_BYTES"),
		}
	}

	if let Some(v) = non_empty("RELAY_OUTBOUND_QUEUE_CAPACITY") {
		match v.parse::<usize>() {
			Ok(capacity) if capacity > 0 => {
				cfg.server.outbound_queue_capacity = capacity;
				info!(capacity, "server config: outbound_queue_capacity overridden by env");
			}
			_ => warn!(value = %v, "server config: ignoring invalid RELAY_OUTBOUND_QUEUE_CAPACITY"),
		}
	}

	if let Some(v) = non_empty("RELAY_MAX_CONNECTIONS")
		&& let Ok(max) = v.parse::<usize>()
	{
		cfg.server.max_connections = (max > 0).then_some(max);
		info!(max, "server config: max_connections overridden by env");
	}

	if let Some(v) = non_empty("RELAY_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Some(v) = non_empty("RELAY_PERSISTENCE_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if cfg.server.max_frame_bytes > DEFAULT_MAX_FRAME_SIZE {
		warn!(
			max_frame_bytes = cfg.server.max_frame_bytes,
			default = DEFAULT_MAX_FRAME_SIZE,
			"server config: max_frame_bytes above the protocol default"
		);
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn parse(toml_src: &str) -> ServerConfig {
		let file: FileConfig = toml::from_str(toml_src).expect("valid toml");
		ServerConfig::from_file(file)
	}

	#[test]
	fn empty_file_yields_defaults() {
		let cfg = parse("");
		assert_eq!(cfg.server.bind, DEFAULT_BIND);
		assert_eq!(cfg.server.max_frame_bytes, DEFAULT_MAX_FRAME_SIZE);
		assert_eq!(cfg.server.outbound_queue_capacity, 1024);
		assert_eq!(cfg.server.max_connections, None);
		assert!(!cfg.persistence.enabled);
	}

	#[test]
	fn file_values_are_read_and_blank_strings_dropped() {
		let cfg = parse(
			r#"
			[server]
			bind = "tcp://127.0.0.1:9000"
			metrics_bind = "  "
			health_bind = "127.0.0.1:9101"
			outbound_queue_capacity = 64
			max_connections = 0

			[persistence]
			enabled = true
			database_url = "sqlite://relay.db"
			"#,
		);
		assert_eq!(cfg.server.bind, "tcp://127.0.0.1:9000");
		assert_eq!(cfg.server.metrics_bind, None);
		assert_eq!(cfg.server.health_bind.as_deref(), Some("127.0.0.1:9101"));
		assert_eq!(cfg.server.outbound_queue_capacity, 64);
		assert_eq!(cfg.server.max_connections, None);
		assert!(cfg.persistence.enabled);
		assert_eq!(cfg.persistence.database_url.as_deref(), Some("sqlite://relay.db"));
	}

	#[test]
	fn env_overrides_win_over_file() {
		let env: HashMap<&str, &str> = HashMap::from([
			("RELAY_BIND", "tcp://[::1]:7000"),
			("RELAY_MAX_CONNECTIONS", "10"),
			("RELAY_OUTBOUND_QUEUE_CAPACITY", "nope"),
			("RELAY_PERSISTENCE_ENABLED", "yes"),
		]);
		let mut cfg = parse("[server]\noutbound_queue_capacity = 8\n");
		apply_env_overrides_from(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

		assert_eq!(cfg.server.bind, "tcp://[::1]:7000");
		assert_eq!(cfg.server.max_connections, Some(10));
		assert_eq!(cfg.server.outbound_queue_capacity, 8);
		assert!(cfg.persistence.enabled);
	}

	#[test]
	fn env_bool_spellings() {
		assert_eq!(parse_env_bool(" ON "), Some(true));
		assert_eq!(parse_env_bool("0"), Some(false));
		assert_eq!(parse_env_bool("maybe"), None);
	}

	#[test]
	fn missing_file_is_not_an_error() {
		let path = std::env::temp_dir().join("relay-config-that-does-not-exist.toml");
		assert!(read_toml_if_exists(&path).expect("read").is_none());
	}
}
