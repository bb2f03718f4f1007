#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::info;

use crate::util::secret::SecretString;

/// Default config path: `~/.confab/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".confab").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
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

/// Server settings loaded by the server.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Websocket listener bind address (host:port).
	pub ws_bind: String,
	/// History/ingest HTTP API bind address (host:port).
	pub http_bind: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// HMAC secret for stateless access tokens. Required at startup.
	pub auth_hmac_secret: Option<SecretString>,
	/// How long a new connection may take to send its auth event.
	pub auth_timeout: Duration,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			ws_bind: "127.0.0.1:8200".to_string(),
			http_bind: "127.0.0.1:8201".to_string(),
			metrics_bind: None,
			health_bind: None,
			auth_hmac_secret: None,
			auth_timeout: Duration::from_secs(10),
		}
	}
}

/// Persistence settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Database URL (sqlite:). Absent means the in-memory store.
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
	ws_bind: Option<String>,
	http_bind: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	auth_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerSettings::default();
		Self {
			server: ServerSettings {
				ws_bind: file.server.ws_bind.filter(|s| !s.trim().is_empty()).unwrap_or(defaults.ws_bind),
				http_bind: file
					.server
					.http_bind
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(defaults.http_bind),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				auth_hmac_secret: file
					.server
					.auth_hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				auth_timeout: file
					.server
					.auth_timeout_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(defaults.auth_timeout),
			},
			persistence: PersistenceSettings {
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
		}
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
	if let Ok(v) = std::env::var("CONFAB_WS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.ws_bind = v;
			info!("server config: ws_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CONFAB_HTTP_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.http_bind = v;
			info!("server config: http_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CONFAB_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CONFAB_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CONFAB_AUTH_HMAC_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.auth_hmac_secret = Some(SecretString::new(v));
			info!("server auth: auth_hmac_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CONFAB_AUTH_TIMEOUT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.server.auth_timeout = Duration::from_secs(secs);
		info!(secs, "server config: auth_timeout overridden by env");
	}

	if let Ok(v) = std::env::var("CONFAB_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}
}
