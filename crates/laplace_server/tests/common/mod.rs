#![allow(dead_code)]

//! Shared fixtures: an in-memory services record, a fake engine, and a
//! self-signed TLS pair.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use laplace_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, encode_frame_default, try_decode_frame_from_buffer};
use laplace_server::config::ServerConfig;
use laplace_server::engine::EngineBridge;
use laplace_server::services::Services;
use laplace_server::tasks::broker::{BrokerControl, TaskBroker, WorkerSocket};
use laplace_store::{AuthStore, Kv, MemoryKv, RoomsStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::{TlsAcceptor, TlsConnector};

pub struct Harness {
	pub services: Arc<Services>,
	pub kv: Arc<MemoryKv>,
	pub worker_sockets: Vec<WorkerSocket>,
	pub broker_control: BrokerControl,
}

/// Timings tightened for tests; the engine endpoint points at a fixture.
pub fn test_config(engine_endpoint: String) -> ServerConfig {
	let mut cfg = ServerConfig::default();
	cfg.tcp_bind = "127.0.0.1:0".parse().unwrap();
	cfg.http_bind = "127.0.0.1:0".parse().unwrap();
	cfg.io_deadline = Duration::from_secs(2);
	cfg.shutdown_grace = Duration::from_secs(2);
	cfg.workers.count = 2;
	cfg.workers.recv_timeout = Duration::from_millis(100);
	cfg.workers.idle_sleep = Duration::from_millis(20);
	cfg.workers.publish_ack_timeout = Duration::from_secs(2);
	cfg.engine.endpoint = engine_endpoint;
	cfg.engine.reply_timeout = Duration::from_millis(500);
	cfg.engine.shutdown_grace = Duration::from_secs(1);
	cfg
}

/// Build a services record over the in-memory store and a fake engine
/// answering every exchange with `engine_reply`.
pub async fn harness(engine_reply: &'static [u8]) -> Harness {
	let endpoint = spawn_fake_engine(engine_reply).await;
	harness_with_config(test_config(endpoint)).await
}

pub async fn harness_with_config(cfg: ServerConfig) -> Harness {
	let kv = Arc::new(MemoryKv::new());
	let kv_dyn: Arc<dyn Kv> = kv.clone();

	let auth = AuthStore::start(kv_dyn.clone(), cfg.token_ttl).await.unwrap();
	let rooms = RoomsStore::start(kv_dyn.clone(), cfg.room_cap).await.unwrap();

	let (producer, worker_sockets, broker_control, _broker_handle) =
		TaskBroker::spawn(cfg.workers.count, cfg.workers.publish_ack_timeout);

	let engine = EngineBridge::unmanaged(cfg.engine.clone());

	let services = Arc::new(Services {
		cfg,
		kv: kv_dyn,
		auth,
		rooms,
		engine,
		producer,
	});

	Harness {
		services,
		kv,
		worker_sockets,
		broker_control,
	}
}

/// A framed TCP echo standing in for the engine: reads one request
/// frame per connection and answers with the canned reply.
pub async fn spawn_fake_engine(reply: &'static [u8]) -> String {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();

	tokio::spawn(async move {
		while let Ok((mut socket, _)) = listener.accept().await {
			tokio::spawn(async move {
				let mut buf = BytesMut::new();
				loop {
					if let Ok(Some(_request)) = try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE) {
						let frame = encode_frame_default(reply).unwrap();
						let _ = socket.write_all(&frame).await;
						return;
					}
					if socket.read_buf(&mut buf).await.unwrap_or(0) == 0 {
						return;
					}
				}
			});
		}
	});

	addr.to_string()
}

/// Self-signed acceptor/connector pair trusting each other, for the
/// transport-upgrade tests.
pub fn tls_pair() -> (TlsAcceptor, TlsConnector) {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	let ck = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
	let cert_der = rustls::pki_types::CertificateDer::from(ck.cert.der().to_vec());
	let key_der = rustls::pki_types::PrivateKeyDer::try_from(ck.signing_key.serialize_der()).unwrap();

	let server = rustls::ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(vec![cert_der.clone()], key_der)
		.unwrap();

	let mut roots = rustls::RootCertStore::empty();
	roots.add(cert_der).unwrap();
	let client = rustls::ClientConfig::builder()
		.with_root_certificates(roots)
		.with_no_client_auth();

	(
		TlsAcceptor::from(Arc::new(server)),
		TlsConnector::from(Arc::new(client)),
	)
}

/// Poll an async predicate until it holds or the deadline passes.
pub async fn wait_until<F, Fut>(deadline: Duration, mut probe: F) -> bool
where
	F: FnMut() -> Fut,
	Fut: std::future::Future<Output = bool>,
{
	let started = tokio::time::Instant::now();
	while started.elapsed() < deadline {
		if probe().await {
			return true;
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
	false
}
