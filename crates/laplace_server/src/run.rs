#![forbid(unsafe_code)]

//! Ordered startup and reverse-ordered teardown.

use std::sync::Arc;

use anyhow::Context as _;
use laplace_store::{AuthStore, Kv, RedisKv, RoomsStore};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::engine::EngineBridge;
use crate::listener::http::spawn_http_listener;
use crate::listener::tcp::spawn_tcp_listener;
use crate::services::Services;
use crate::tasks::broker::TaskBroker;
use crate::tasks::scheduler::spawn_scheduler;
use crate::tasks::worker::spawn_workers;
use crate::tls::load_tls_acceptor;

/// Bring every subsystem up in dependency order, serve until ctrl-c,
/// then tear down in reverse. Any teardown step exceeding its grace is
/// logged and the next step still runs.
pub async fn run(cfg: ServerConfig) -> anyhow::Result<()> {
	let (shutdown_tx, shutdown_rx) = watch::channel(false);

	let kv: Arc<dyn Kv> = Arc::new(RedisKv::connect(&cfg.redis_url).await.context("kv store")?);

	let auth = AuthStore::start(kv.clone(), cfg.token_ttl).await.context("auth store")?;
	let rooms = RoomsStore::start(kv.clone(), cfg.room_cap).await.context("rooms store")?;

	let tls = match (&cfg.tls_cert_path, &cfg.tls_key_path) {
		(Some(cert), Some(key)) => {
			info!(cert = %cert.display(), key = %key.display(), "loading TLS cert/key");
			Some(load_tls_acceptor(cert, key).context("tls config")?)
		}
		_ => {
			warn!("tls cert/key not configured; transport upgrades and credentialed commands are unavailable");
			None
		}
	};

	let (producer, worker_sockets, broker_control, broker_handle) =
		TaskBroker::spawn(cfg.workers.count, cfg.workers.publish_ack_timeout);

	let engine = EngineBridge::start(cfg.engine.clone()).context("engine bridge")?;

	let services = Arc::new(Services {
		cfg,
		kv,
		auth,
		rooms,
		engine,
		producer,
	});

	let workers = spawn_workers(services.clone(), worker_sockets, shutdown_rx.clone());
	let scheduler = spawn_scheduler(services.clone(), shutdown_rx.clone()).context("cron scheduler")?;

	let (tcp_handle, _) = spawn_tcp_listener(services.clone(), tls.clone(), shutdown_rx.clone()).await?;
	let (http_handle, _) = spawn_http_listener(services.clone(), tls, shutdown_rx).await?;

	info!("startup complete");

	tokio::signal::ctrl_c().await.context("wait for shutdown signal")?;
	info!("shutdown signal received, cleaning up");

	let _ = shutdown_tx.send(true);
	let grace = services.cfg.shutdown_grace;

	for (name, handle) in [
		("tcp listener", tcp_handle),
		("http listener", http_handle),
		("scheduler", scheduler),
	] {
		if timeout(grace, handle).await.is_err() {
			warn!(task = name, "did not stop within the shutdown grace");
		}
	}

	match timeout(grace, broker_control.terminate()).await {
		Ok(Ok(())) => {
			let _ = timeout(grace, broker_handle).await;
		}
		Ok(Err(e)) => warn!(error = %e, "broker termination failed"),
		Err(_) => warn!("broker did not confirm termination within the grace"),
	}

	workers.join(grace).await;

	services.engine.shutdown().await;

	// The KV client closes last, when the services record drops.
	info!("cleanup complete");
	Ok(())
}
