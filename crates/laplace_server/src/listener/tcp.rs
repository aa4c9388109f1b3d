#![forbid(unsafe_code)]

//! The TCP command listener.
//!
//! Each accepted connection loops read → (maybe upgrade) → dispatch →
//! write until it closes. A frame whose prefix requests the transport
//! upgrade triggers the server-side TLS handshake on the same socket and
//! consumes no command.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context as _, bail};
use laplace_domain::AuthContext;
use laplace_protocol::codec::{CodecError, decode_attachment, parse_command};
use laplace_protocol::{MALFORMED_DATA_JSON, RequestPrefix};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tracing::{debug, error, info, warn};

use crate::dispatch::{RequestBody, dispatch};
use crate::services::Services;

/// Upper bound on a single TCP request frame.
const READ_BUFFER_SIZE: usize = 2048;

/// Frame header: prefix byte plus the two command bytes.
const COMMAND_BYTES: usize = 3;

/// Bind the listener and start the accept loop.
pub async fn spawn_tcp_listener(
	services: Arc<Services>,
	tls: Option<TlsAcceptor>,
	shutdown: watch::Receiver<bool>,
) -> anyhow::Result<(JoinHandle<()>, SocketAddr)> {
	let listener = TcpListener::bind(services.cfg.tcp_bind)
		.await
		.with_context(|| format!("bind tcp listener on {}", services.cfg.tcp_bind))?;
	let addr = listener.local_addr().context("tcp local addr")?;

	info!(%addr, "tcp listening");

	let handle = tokio::spawn(accept_loop(listener, services, tls, shutdown));
	Ok((handle, addr))
}

async fn accept_loop(
	listener: TcpListener,
	services: Arc<Services>,
	tls: Option<TlsAcceptor>,
	mut shutdown: watch::Receiver<bool>,
) {
	let permits = Arc::new(Semaphore::new(services.cfg.max_connections));

	loop {
		tokio::select! {
			changed = shutdown.changed() => {
				if changed.is_err() || *shutdown.borrow() {
					break;
				}
			}
			accepted = listener.accept() => {
				let (stream, peer) = match accepted {
					Ok(pair) => pair,
					Err(e) => {
						warn!(error = %e, "tcp accept failed");
						continue;
					}
				};

				metrics::counter!("laplace_tcp_connections_total").increment(1);

				// Blocks further accepts while the handler pool is full.
				let Ok(permit) = permits.clone().acquire_owned().await else {
					break;
				};

				debug!(%peer, "new connection");

				let services = services.clone();
				let tls = tls.clone();
				let shutdown = shutdown.clone();
				tokio::spawn(async move {
					let _permit = permit;
					handle_connection(services, stream, tls, shutdown).await;
					debug!(%peer, "connection closed");
				});
			}
		}
	}

	info!("tcp listener stopped");
}

/// A client connection, before or after the transport upgrade.
struct ClientConn {
	stream: ClientStream,
	secured: bool,
	/// Set when a handler leaves more of the conversation to read.
	read_needed: bool,
}

enum ClientStream {
	Plain(TcpStream),
	Tls(Box<TlsStream<TcpStream>>),
	/// Transitional state during the upgrade handshake.
	Detached,
}

impl ClientConn {
	async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
		match &mut self.stream {
			ClientStream::Plain(s) => s.read(buf).await,
			ClientStream::Tls(s) => s.read(buf).await,
			ClientStream::Detached => Err(std::io::ErrorKind::NotConnected.into()),
		}
	}

	async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
		match &mut self.stream {
			ClientStream::Plain(s) => s.write_all(data).await,
			ClientStream::Tls(s) => s.write_all(data).await,
			ClientStream::Detached => Err(std::io::ErrorKind::NotConnected.into()),
		}
	}

	/// Server-side upgrade handshake on the in-flight socket.
	async fn upgrade(&mut self, acceptor: &TlsAcceptor) -> anyhow::Result<()> {
		match std::mem::replace(&mut self.stream, ClientStream::Detached) {
			ClientStream::Plain(tcp) => {
				let tls = acceptor.accept(tcp).await.context("tls handshake")?;
				self.stream = ClientStream::Tls(Box::new(tls));
				self.secured = true;
				Ok(())
			}
			other => {
				self.stream = other;
				bail!("connection is already upgraded");
			}
		}
	}

	/// After a served request: stay open iff the upgrade happened or a
	/// handler explicitly needs more reads.
	fn keep_alive(&self) -> bool {
		self.secured || self.read_needed
	}
}

enum FrameAction {
	Close,
	Continue,
	Upgrade,
}

async fn handle_connection(
	services: Arc<Services>,
	stream: TcpStream,
	tls: Option<TlsAcceptor>,
	shutdown: watch::Receiver<bool>,
) {
	let mut conn = ClientConn {
		stream: ClientStream::Plain(stream),
		secured: false,
		read_needed: false,
	};
	let mut buf = vec![0u8; READ_BUFFER_SIZE];

	loop {
		if *shutdown.borrow() {
			return;
		}

		match read_and_respond(&services, &mut conn, &mut buf).await {
			FrameAction::Close => return,
			FrameAction::Upgrade => {
				let Some(acceptor) = tls.as_ref() else {
					warn!("client requested the transport upgrade but tls is not configured");
					return;
				};

				if let Err(e) = conn.upgrade(acceptor).await {
					warn!(error = %e, "transport upgrade failed");
					return;
				}

				debug!("connection upgraded");
				// The upgrade frame carries no command.
			}
			FrameAction::Continue => {
				if !conn.keep_alive() {
					return;
				}
			}
		}
	}
}

async fn read_and_respond(services: &Services, conn: &mut ClientConn, buf: &mut [u8]) -> FrameAction {
	let n = match timeout(services.cfg.io_deadline, conn.read(buf)).await {
		Err(_) => {
			debug!("read deadline elapsed");
			return FrameAction::Close;
		}
		Ok(Err(e)) => {
			debug!(error = %e, "read failed");
			return FrameAction::Close;
		}
		Ok(Ok(0)) => return FrameAction::Close,
		Ok(Ok(n)) => n,
	};

	let prefix = RequestPrefix::parse(buf[0]);

	if prefix.needs_upgrade && !conn.secured {
		return FrameAction::Upgrade;
	}

	let response = match parse_and_dispatch(services, conn.secured, prefix, &buf[..n]).await {
		Ok(response) => response,
		Err(FrameError::Malformed(e)) => {
			warn!(error = %e, "malformed request");
			if let Err(e) = conn.write_all(MALFORMED_DATA_JSON).await {
				debug!(error = %e, "could not write the malformed-data sentinel");
			}
			return FrameAction::Close;
		}
		Err(FrameError::Server(e)) => {
			// Logged here; nothing is relayed to the client.
			error!(error = %e, "command failed server-side");
			return FrameAction::Continue;
		}
	};

	if let Err(e) = conn.write_all(&response).await {
		warn!(error = %e, "could not write response");
		return FrameAction::Close;
	}

	FrameAction::Continue
}

enum FrameError {
	Malformed(CodecError),
	Server(anyhow::Error),
}

async fn parse_and_dispatch(
	services: &Services,
	secured: bool,
	prefix: RequestPrefix,
	data: &[u8],
) -> Result<Vec<u8>, FrameError> {
	if data.len() < COMMAND_BYTES {
		return Err(FrameError::Malformed(CodecError::Truncated {
			need: COMMAND_BYTES,
			have: data.len(),
		}));
	}

	let cmd = parse_command(data[1], data[2]).map_err(FrameError::Malformed)?;

	let rest = &data[COMMAND_BYTES..];
	let (attachment, body_start) = decode_attachment(prefix.wire_format(), rest).map_err(FrameError::Malformed)?;
	let body = &rest[body_start..];

	let auth = AuthContext::External {
		user_id: attachment.user_id,
		sig: attachment.sig.into_bytes(),
	};

	dispatch(
		services,
		cmd,
		auth,
		RequestBody::Wire {
			format: prefix.wire_format(),
			base64: prefix.body_base64,
			bytes: body,
		},
		secured,
	)
	.await
	.map_err(FrameError::Server)
}
