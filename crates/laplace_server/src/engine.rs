#![forbid(unsafe_code)]

//! Supervision of the engine child process and the framed request/reply
//! exchanges with it.
//!
//! The server is always the initiator: each exchange opens a fresh
//! short-lived connection to the engine endpoint, sends one frame, and
//! waits a bounded time for one reply frame.

use std::process::Stdio;

use anyhow::{Context as _, anyhow, bail};
use bytes::BytesMut;
use laplace_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, encode_frame_default, try_decode_frame_from_buffer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::EngineSettings;

pub struct EngineBridge {
	settings: EngineSettings,
	child: Mutex<Option<Child>>,
}

impl EngineBridge {
	/// Launch the engine child process and bind it to this bridge.
	/// Its stdout/stderr are discarded.
	pub fn start(settings: EngineSettings) -> anyhow::Result<Self> {
		info!(command = %settings.command, args = ?settings.args, "launching engine process");

		let child = Command::new(&settings.command)
			.args(&settings.args)
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::null())
			.kill_on_drop(true)
			.spawn()
			.with_context(|| format!("spawn engine: {}", settings.command))?;

		Ok(Self {
			settings,
			child: Mutex::new(Some(child)),
		})
	}

	/// Bridge to an engine whose lifecycle is managed elsewhere
	/// (tests, or an engine already running beside the server).
	pub fn unmanaged(settings: EngineSettings) -> Self {
		Self {
			settings,
			child: Mutex::new(None),
		}
	}

	/// One bounded request/reply exchange. The reply bytes are returned
	/// verbatim.
	pub async fn exchange(&self, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
		let frame = encode_frame_default(payload).context("encode engine frame")?;

		let mut stream = TcpStream::connect(&self.settings.endpoint)
			.await
			.with_context(|| format!("connect engine at {}", self.settings.endpoint))?;

		stream.write_all(&frame).await.context("send engine frame")?;

		metrics::counter!("laplace_engine_exchanges_total").increment(1);

		let reply = timeout(self.settings.reply_timeout, read_reply(&mut stream))
			.await
			.map_err(|_| anyhow!("engine did not reply within {:?}", self.settings.reply_timeout))??;

		Ok(reply)
	}

	/// Stop the child, waiting up to the shutdown grace.
	pub async fn shutdown(&self) {
		let Some(mut child) = self.child.lock().await.take() else {
			return;
		};

		if let Err(e) = child.start_kill() {
			warn!(error = %e, "could not signal engine process");
		}

		match timeout(self.settings.shutdown_grace, child.wait()).await {
			Ok(Ok(status)) => info!(%status, "engine process exited"),
			Ok(Err(e)) => warn!(error = %e, "waiting on engine process failed"),
			Err(_) => warn!(
				grace = ?self.settings.shutdown_grace,
				"engine did not finish within the shutdown grace"
			),
		}
	}
}

async fn read_reply(stream: &mut TcpStream) -> anyhow::Result<Vec<u8>> {
	let mut buf = BytesMut::with_capacity(4096);

	loop {
		if let Some(frame) = try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE)? {
			return Ok(frame.to_vec());
		}

		let n = stream.read_buf(&mut buf).await.context("read engine reply")?;
		if n == 0 {
			bail!("engine closed the connection mid-reply");
		}
	}
}
