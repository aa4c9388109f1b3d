//! End-to-end TCP scenarios: framing, the opportunistic transport
//! upgrade, and credentialed commands over the upgraded socket.

mod common;

use std::time::Duration;

use laplace_protocol::MALFORMED_DATA_JSON;
use laplace_server::listener::tcp::spawn_tcp_listener;
use laplace_store::Kv as _;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;

use common::{harness, tls_pair};

const PREFIX_JSON: u8 = 0b0001_0000;
const PREFIX_UPGRADE: u8 = 0b1000_0000;

/// prefix + command code + empty attachment + body.
fn frame(prefix: u8, code: u16, body: &[u8]) -> Vec<u8> {
	let mut out = vec![prefix];
	out.extend_from_slice(&code.to_be_bytes());
	out.extend_from_slice(b"{}");
	out.extend_from_slice(body);
	out
}

async fn read_some(stream: &mut (impl AsyncReadExt + Unpin)) -> Vec<u8> {
	let mut buf = vec![0u8; 4096];
	let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
		.await
		.expect("response deadline")
		.expect("read response");
	buf.truncate(n);
	buf
}

async fn read_exact_n(stream: &mut (impl AsyncReadExt + Unpin), n: usize) -> Vec<u8> {
	let mut buf = vec![0u8; n];
	timeout(Duration::from_secs(2), stream.read_exact(&mut buf))
		.await
		.expect("response deadline")
		.expect("read response");
	buf
}

#[tokio::test]
async fn malformed_frame_gets_the_sentinel_and_a_close() {
	let h = harness(b"{}").await;
	let (_shutdown_tx, shutdown_rx) = watch::channel(false);
	let (_handle, addr) = spawn_tcp_listener(h.services.clone(), None, shutdown_rx).await.unwrap();

	let mut client = TcpStream::connect(addr).await.unwrap();
	// Unknown command code 0xffff.
	client.write_all(&frame(PREFIX_JSON, 0xffff, b"")).await.unwrap();

	let response = read_some(&mut client).await;
	assert_eq!(response, MALFORMED_DATA_JSON);

	// The listener closes after a malformed frame.
	assert_eq!(client.read(&mut [0u8; 16]).await.unwrap(), 0);
}

#[tokio::test]
async fn register_on_cleartext_is_refused() {
	let h = harness(b"{}").await;
	let (_shutdown_tx, shutdown_rx) = watch::channel(false);
	let (_handle, addr) = spawn_tcp_listener(h.services.clone(), None, shutdown_rx).await.unwrap();

	let mut client = TcpStream::connect(addr).await.unwrap();
	let body = br#"{"Username":"DerpityUnityTesty","Password":"YoYoZ0Z0@1"}"#;
	client.write_all(&frame(PREFIX_JSON, 0x0001, body)).await.unwrap();

	let response = read_some(&mut client).await;
	let value: serde_json::Value = serde_json::from_slice(&response).unwrap();
	assert_eq!(value["error"], "Unsecure Connection!");
}

#[tokio::test]
async fn upgrade_frame_executes_no_command_and_login_follows() {
	let h = harness(b"{}").await;
	let (acceptor, connector) = tls_pair();
	let (_shutdown_tx, shutdown_rx) = watch::channel(false);
	let (_handle, addr) = spawn_tcp_listener(h.services.clone(), Some(acceptor), shutdown_rx)
		.await
		.unwrap();

	let mut client = TcpStream::connect(addr).await.unwrap();

	// The upgrade frame: one prefix byte, no command, no response.
	client.write_all(&[PREFIX_UPGRADE]).await.unwrap();
	// Let the listener consume the prefix before the handshake bytes flow.
	tokio::time::sleep(Duration::from_millis(100)).await;

	let domain = rustls::pki_types::ServerName::try_from("localhost".to_string()).unwrap();
	let mut tls_client = connector.connect(domain, client).await.expect("client handshake");

	// Register, then login, on the same upgraded socket.
	let body = br#"{"Username":"DerpityUnityTesty","Password":"YoYoZ0Z0@1"}"#;
	tls_client.write_all(&frame(PREFIX_JSON, 0x0001, body)).await.unwrap();
	let response = read_some(&mut tls_client).await;
	assert_eq!(response, b"DerpityUnityTesty");

	tls_client.write_all(&frame(PREFIX_JSON, 0x0002, body)).await.unwrap();
	let token = read_exact_n(&mut tls_client, 256).await;

	let id = h.services.auth.auth_id_for("DerpityUnityTesty").await.unwrap().unwrap();
	let state = h.services.auth.token(&id).await.unwrap();
	assert_eq!(state.token, token);
	assert_eq!(state.uses, 0);
	assert!(state.stale_at > laplace_store::unix_now());
}

#[tokio::test]
async fn cleartext_connection_closes_after_one_command() {
	let h = harness(b"{}").await;
	let (_shutdown_tx, shutdown_rx) = watch::channel(false);
	let (_handle, addr) = spawn_tcp_listener(h.services.clone(), None, shutdown_rx).await.unwrap();

	let mut client = TcpStream::connect(addr).await.unwrap();
	client.write_all(&frame(PREFIX_JSON, 0x0000, b"")).await.unwrap();

	let response = read_some(&mut client).await;
	assert!(!response.is_empty());

	// Not upgraded, no reads needed: the listener hangs up.
	assert_eq!(client.read(&mut [0u8; 16]).await.unwrap(), 0);
}

#[tokio::test]
async fn shutdown_stops_the_accept_loop() {
	let h = harness(b"{}").await;
	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let (handle, addr) = spawn_tcp_listener(h.services.clone(), None, shutdown_rx).await.unwrap();

	shutdown_tx.send(true).unwrap();
	timeout(Duration::from_secs(2), handle).await.expect("listener exits").unwrap();

	// Later connections are refused or closed immediately.
	if let Ok(mut stream) = TcpStream::connect(addr).await {
		assert_eq!(stream.read(&mut [0u8; 1]).await.unwrap_or(0), 0);
	}

	// Unused but keeps the store alive for the duration.
	let _ = h.kv.hlen("gameHash").await;
}
