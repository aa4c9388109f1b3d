#![forbid(unsafe_code)]

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::info;

/// Server config (TOML file + `LAPLACE_*` env overrides).
#[derive(Debug, Clone)]
pub struct ServerConfig {
	/// TCP command listener bind address.
	pub tcp_bind: SocketAddr,
	/// HTTP command listener bind address.
	pub http_bind: SocketAddr,
	/// KV store URL.
	pub redis_url: String,

	/// PEM-encoded certificate path for the transport upgrade and HTTPS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path.
	pub tls_key_path: Option<PathBuf>,

	/// Optional Prometheus exporter bind address (host:port).
	pub metrics_bind: Option<String>,

	/// Per-read deadline on client TCP sockets.
	pub io_deadline: Duration,
	/// Bound on in-flight handlers during shutdown.
	pub shutdown_grace: Duration,
	/// Concurrent TCP connection handler cap.
	pub max_connections: usize,

	/// Token lifetime after Login.
	pub token_ttl: Duration,
	/// Idle time after which a room is considered stale.
	pub stale_room: Duration,
	/// Optional global cap on concurrent rooms.
	pub room_cap: Option<usize>,
	/// Stale-queue batch size per scheduler tick.
	pub health_batch_cap: usize,

	pub engine: EngineSettings,
	pub workers: WorkerSettings,
}

/// Supervised engine process and its request/reply endpoint.
#[derive(Debug, Clone)]
pub struct EngineSettings {
	pub command: String,
	pub args: Vec<String>,
	/// host:port the engine answers framed requests on.
	pub endpoint: String,
	pub reply_timeout: Duration,
	pub shutdown_grace: Duration,
}

/// Task worker pool knobs.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
	pub count: usize,
	pub recv_timeout: Duration,
	pub idle_sleep: Duration,
	/// Bound on the producer-side accept acknowledgement.
	pub publish_ack_timeout: Duration,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			tcp_bind: "127.0.0.1:26005".parse().expect("default tcp bind"),
			http_bind: "127.0.0.1:8080".parse().expect("default http bind"),
			redis_url: "redis://127.0.0.1:6379".to_string(),
			tls_cert_path: None,
			tls_key_path: None,
			metrics_bind: None,
			io_deadline: Duration::from_millis(5),
			shutdown_grace: Duration::from_secs(10),
			max_connections: 64,
			token_ttl: Duration::from_secs(300),
			stale_room: Duration::from_secs(300),
			room_cap: None,
			health_batch_cap: 50,
			engine: EngineSettings::default(),
			workers: WorkerSettings::default(),
		}
	}
}

impl Default for EngineSettings {
	fn default() -> Self {
		Self {
			command: "node".to_string(),
			args: vec!["./node-layer/index.js".to_string(), "--binding=5011".to_string()],
			endpoint: "127.0.0.1:5011".to_string(),
			reply_timeout: Duration::from_secs(3),
			shutdown_grace: Duration::from_secs(10),
		}
	}
}

impl Default for WorkerSettings {
	fn default() -> Self {
		Self {
			count: 10,
			recv_timeout: Duration::from_secs(1),
			idle_sleep: Duration::from_secs(10),
			publish_ack_timeout: Duration::from_secs(10),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	rooms: FileRoomSettings,

	#[serde(default)]
	engine: FileEngineSettings,

	#[serde(default)]
	workers: FileWorkerSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	tcp_bind: Option<String>,
	http_bind: Option<String>,
	redis_url: Option<String>,
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	io_deadline_ms: Option<u64>,
	shutdown_grace_secs: Option<u64>,
	max_connections: Option<usize>,
	token_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRoomSettings {
	stale_room_secs: Option<u64>,
	room_cap: Option<usize>,
	health_batch_cap: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileEngineSettings {
	command: Option<String>,
	args: Option<Vec<String>>,
	endpoint: Option<String>,
	reply_timeout_ms: Option<u64>,
	shutdown_grace_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileWorkerSettings {
	count: Option<usize>,
	recv_timeout_ms: Option<u64>,
	idle_sleep_ms: Option<u64>,
	publish_ack_timeout_ms: Option<u64>,
}

/// Load the server config from TOML and env overrides.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg)?;
	apply_env_overrides(&mut cfg)?;

	Ok(cfg)
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let defaults = ServerConfig::default();

		let parse_addr = |label: &str, v: Option<String>, fallback: SocketAddr| -> anyhow::Result<SocketAddr> {
			match v.filter(|s| !s.trim().is_empty()) {
				Some(s) => s
					.trim()
					.parse()
					.map_err(|e| anyhow!("{label}: invalid bind address {s:?}: {e}")),
				None => Ok(fallback),
			}
		};

		Ok(Self {
			tcp_bind: parse_addr("server.tcp_bind", file.server.tcp_bind, defaults.tcp_bind)?,
			http_bind: parse_addr("server.http_bind", file.server.http_bind, defaults.http_bind)?,
			redis_url: file
				.server
				.redis_url
				.filter(|s| !s.trim().is_empty())
				.unwrap_or(defaults.redis_url),
			tls_cert_path: file
				.server
				.tls_cert_path
				.filter(|s| !s.trim().is_empty())
				.map(PathBuf::from),
			tls_key_path: file
				.server
				.tls_key_path
				.filter(|s| !s.trim().is_empty())
				.map(PathBuf::from),
			metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
			io_deadline: file
				.server
				.io_deadline_ms
				.map(Duration::from_millis)
				.unwrap_or(defaults.io_deadline),
			shutdown_grace: file
				.server
				.shutdown_grace_secs
				.map(Duration::from_secs)
				.unwrap_or(defaults.shutdown_grace),
			max_connections: file.server.max_connections.unwrap_or(defaults.max_connections),
			token_ttl: file
				.server
				.token_ttl_secs
				.map(Duration::from_secs)
				.unwrap_or(defaults.token_ttl),
			stale_room: file
				.rooms
				.stale_room_secs
				.map(Duration::from_secs)
				.unwrap_or(defaults.stale_room),
			room_cap: file.rooms.room_cap.filter(|cap| *cap > 0),
			health_batch_cap: file.rooms.health_batch_cap.unwrap_or(defaults.health_batch_cap),
			engine: EngineSettings {
				command: file
					.engine
					.command
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(defaults.engine.command),
				args: file.engine.args.unwrap_or(defaults.engine.args),
				endpoint: file
					.engine
					.endpoint
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(defaults.engine.endpoint),
				reply_timeout: file
					.engine
					.reply_timeout_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults.engine.reply_timeout),
				shutdown_grace: file
					.engine
					.shutdown_grace_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.engine.shutdown_grace),
			},
			workers: WorkerSettings {
				count: file.workers.count.unwrap_or(defaults.workers.count),
				recv_timeout: file
					.workers
					.recv_timeout_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults.workers.recv_timeout),
				idle_sleep: file
					.workers
					.idle_sleep_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults.workers.idle_sleep),
				publish_ack_timeout: file
					.workers
					.publish_ack_timeout_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults.workers.publish_ack_timeout),
			},
		})
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

fn apply_env_overrides(cfg: &mut ServerConfig) -> anyhow::Result<()> {
	if let Ok(v) = std::env::var("LAPLACE_TCP_BIND") {
		let v = v.trim();
		if !v.is_empty() {
			cfg.tcp_bind = v.parse().map_err(|e| anyhow!("LAPLACE_TCP_BIND: {e}"))?;
			info!("server config: tcp_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LAPLACE_HTTP_BIND") {
		let v = v.trim();
		if !v.is_empty() {
			cfg.http_bind = v.parse().map_err(|e| anyhow!("LAPLACE_HTTP_BIND: {e}"))?;
			info!("server config: http_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LAPLACE_REDIS_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.redis_url = v;
			info!("server config: redis_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LAPLACE_TLS_CERT") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.tls_cert_path = Some(PathBuf::from(v));
			info!("server config: tls_cert_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LAPLACE_TLS_KEY") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.tls_key_path = Some(PathBuf::from(v));
			info!("server config: tls_key_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LAPLACE_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LAPLACE_ENGINE_ENDPOINT") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.engine.endpoint = v;
			info!("engine config: endpoint overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LAPLACE_WORKER_COUNT")
		&& let Ok(count) = v.trim().parse::<usize>()
	{
		cfg.workers.count = count;
		info!(count, "worker config: count overridden by env");
	}

	if let Ok(v) = std::env::var("LAPLACE_STALE_ROOM_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.stale_room = Duration::from_secs(secs);
		info!(secs, "room config: stale_room overridden by env");
	}

	if let Ok(v) = std::env::var("LAPLACE_TOKEN_TTL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.token_ttl = Duration::from_secs(secs);
		info!(secs, "server config: token_ttl overridden by env");
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_are_complete() {
		let cfg = ServerConfig::default();
		assert_eq!(cfg.io_deadline, Duration::from_millis(5));
		assert_eq!(cfg.workers.count, 10);
		assert_eq!(cfg.health_batch_cap, 50);
		assert_eq!(cfg.stale_room, Duration::from_secs(300));
		assert!(cfg.room_cap.is_none());
	}

	#[test]
	fn file_values_override_defaults() {
		let file: FileConfig = toml::from_str(
			r#"
			[server]
			tcp_bind = "0.0.0.0:26010"
			io_deadline_ms = 250

			[rooms]
			stale_room_secs = 60
			room_cap = 20

			[workers]
			count = 3
			"#,
		)
		.unwrap();

		let cfg = ServerConfig::from_file(file).unwrap();
		assert_eq!(cfg.tcp_bind.port(), 26010);
		assert_eq!(cfg.io_deadline, Duration::from_millis(250));
		assert_eq!(cfg.stale_room, Duration::from_secs(60));
		assert_eq!(cfg.room_cap, Some(20));
		assert_eq!(cfg.workers.count, 3);
	}

	#[test]
	fn bad_bind_address_is_an_error() {
		let file: FileConfig = toml::from_str("[server]\ntcp_bind = \"nonsense\"\n").unwrap();
		assert!(ServerConfig::from_file(file).is_err());
	}
}
