#![forbid(unsafe_code)]

//! The HTTP command listener.
//!
//! Paths map to commands through a fixed table; anything else is a 404.
//! The authentication attachment is resolved per field from headers,
//! then cookies, then the body JSON. The transport counts as secure iff
//! the request arrived over TLS.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::header::{COOKIE, HeaderMap};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use laplace_domain::{AuthContext, ClientCmd, Reply, RequestAttachment};
use laplace_protocol::codec::WireFormat;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::dispatch::{RequestBody, dispatch};
use crate::services::Services;

/// The closed path table.
pub fn command_for_path(path: &str) -> Option<ClientCmd> {
	match path {
		"/empty/" => Some(ClientCmd::Empty),
		"/error/" => Some(ClientCmd::Error),
		"/register/" => Some(ClientCmd::Register),
		"/login/" => Some(ClientCmd::Login),
		"/action/" => Some(ClientCmd::Action),
		"/observe/" => Some(ClientCmd::Observe),
		"/user/" => Some(ClientCmd::GetUser),
		"/game/create/" => Some(ClientCmd::GameCreate),
		"/game/join/" => Some(ClientCmd::GameJoin),
		"/game/leave/" => Some(ClientCmd::GameLeave),
		"/game/delete/" => Some(ClientCmd::GameDelete),
		_ => None,
	}
}

/// Bind the listener and start serving. TLS is applied when configured;
/// without it every request counts as insecure.
pub async fn spawn_http_listener(
	services: Arc<Services>,
	tls: Option<TlsAcceptor>,
	shutdown: watch::Receiver<bool>,
) -> anyhow::Result<(JoinHandle<()>, SocketAddr)> {
	let listener = TcpListener::bind(services.cfg.http_bind)
		.await
		.with_context(|| format!("bind http listener on {}", services.cfg.http_bind))?;
	let addr = listener.local_addr().context("http local addr")?;

	info!(%addr, tls = tls.is_some(), "http listening");

	let handle = tokio::spawn(accept_loop(listener, services, tls, shutdown));
	Ok((handle, addr))
}

async fn accept_loop(
	listener: TcpListener,
	services: Arc<Services>,
	tls: Option<TlsAcceptor>,
	mut shutdown: watch::Receiver<bool>,
) {
	loop {
		tokio::select! {
			changed = shutdown.changed() => {
				if changed.is_err() || *shutdown.borrow() {
					break;
				}
			}
			accepted = listener.accept() => {
				let (stream, _peer) = match accepted {
					Ok(pair) => pair,
					Err(e) => {
						warn!(error = %e, "http accept failed");
						continue;
					}
				};

				metrics::counter!("laplace_http_connections_total").increment(1);

				let services = services.clone();
				let tls = tls.clone();
				tokio::spawn(async move {
					let result = match tls {
						Some(acceptor) => match acceptor.accept(stream).await {
							Ok(tls_stream) => serve(services, TokioIo::new(tls_stream), true).await,
							Err(e) => {
								debug!(error = %e, "https handshake failed");
								return;
							}
						},
						None => serve(services, TokioIo::new(stream), false).await,
					};

					if let Err(e) = result {
						debug!(error = %e, "http connection error");
					}
				});
			}
		}
	}

	info!("http listener stopped");
}

async fn serve<I>(services: Arc<Services>, io: I, secure: bool) -> hyper::Result<()>
where
	I: hyper::rt::Read + hyper::rt::Write + Unpin,
{
	let service = service_fn(move |req| {
		let services = services.clone();
		async move { Ok::<_, Infallible>(handle_request(services, req, secure).await) }
	});

	http1::Builder::new().serve_connection(io, service).await
}

/// Serve one request against the command table.
pub async fn handle_request<B>(services: Arc<Services>, req: Request<B>, secure: bool) -> Response<Full<Bytes>>
where
	B: hyper::body::Body,
	B::Error: std::fmt::Display,
{
	let Some(cmd) = command_for_path(req.uri().path()) else {
		return status_response(StatusCode::NOT_FOUND);
	};

	if cmd.requires_post() && req.method() != Method::POST {
		let bytes = Reply::unsuccessful("Post Required!")
			.into_bytes()
			.unwrap_or_default();
		return ok_response(bytes);
	}

	let (parts, body) = req.into_parts();

	let body_bytes = match body.collect().await {
		Ok(collected) => collected.to_bytes(),
		Err(e) => {
			warn!(error = %e, "error reading body");
			Bytes::new()
		}
	};

	let attachment = parse_header_info(&parts.headers, &body_bytes);
	let auth = AuthContext::External {
		user_id: attachment.user_id,
		sig: attachment.sig.into_bytes(),
	};

	match dispatch(
		&services,
		cmd,
		auth,
		RequestBody::Wire {
			format: WireFormat::Json,
			base64: false,
			bytes: &body_bytes,
		},
		secure,
	)
	.await
	{
		Ok(bytes) => ok_response(bytes),
		Err(e) => {
			// Logged here; the internal message is not relayed.
			error!(command = %cmd, error = %e, "command failed server-side");
			status_response(StatusCode::INTERNAL_SERVER_ERROR)
		}
	}
}

/// Resolve the attachment: header, then cookie, then body JSON — the
/// first non-empty value wins, independently per field.
fn parse_header_info(headers: &HeaderMap, body: &[u8]) -> RequestAttachment {
	let header_value = |name: &str| {
		headers
			.get(name)
			.and_then(|v| v.to_str().ok())
			.map(str::to_string)
	};

	let cookies = parse_cookies(headers);

	let body_attachment = match serde_json::from_slice::<RequestAttachment>(body) {
		Ok(att) => att,
		Err(_) => {
			debug!("ill-formatted json body during attachment lookup");
			RequestAttachment::default()
		}
	};

	let pick = |candidates: [Option<String>; 3]| {
		candidates
			.into_iter()
			.flatten()
			.find(|v| !v.is_empty())
			.unwrap_or_default()
	};

	RequestAttachment {
		user_id: pick([
			header_value("laplace-user-id"),
			cookies.get("laplaceUserId").cloned(),
			Some(body_attachment.user_id),
		]),
		sig: pick([
			header_value("laplace-signature"),
			cookies.get("laplaceSig").cloned(),
			Some(body_attachment.sig),
		]),
	}
}

fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
	let mut out = HashMap::new();

	for value in headers.get_all(COOKIE) {
		let Ok(value) = value.to_str() else {
			continue;
		};

		for pair in value.split(';') {
			if let Some((name, value)) = pair.trim().split_once('=') {
				out.insert(name.trim().to_string(), value.trim().to_string());
			}
		}
	}

	out
}

fn ok_response(bytes: Vec<u8>) -> Response<Full<Bytes>> {
	Response::builder()
		.status(StatusCode::OK)
		.body(Full::new(Bytes::from(bytes)))
		.expect("static response")
}

fn status_response(status: StatusCode) -> Response<Full<Bytes>> {
	Response::builder()
		.status(status)
		.body(Full::new(Bytes::new()))
		.expect("static response")
}

#[cfg(test)]
mod tests {
	use super::*;
	use hyper::header::HeaderValue;

	#[test]
	fn path_table_is_closed() {
		assert_eq!(command_for_path("/empty/"), Some(ClientCmd::Empty));
		assert_eq!(command_for_path("/register/"), Some(ClientCmd::Register));
		assert_eq!(command_for_path("/game/create/"), Some(ClientCmd::GameCreate));
		assert_eq!(command_for_path("/game/delete/"), Some(ClientCmd::GameDelete));
		assert_eq!(command_for_path("/"), None);
		assert_eq!(command_for_path("/game/"), None);
		assert_eq!(command_for_path("/register"), None);
	}

	#[test]
	fn cookie_parsing() {
		let mut headers = HeaderMap::new();
		headers.append(
			COOKIE,
			HeaderValue::from_static("laplaceUserId=42; laplaceSig=abc"),
		);

		let cookies = parse_cookies(&headers);
		assert_eq!(cookies.get("laplaceUserId").unwrap(), "42");
		assert_eq!(cookies.get("laplaceSig").unwrap(), "abc");
	}

	#[test]
	fn attachment_prefers_headers_over_cookies_over_body() {
		let mut headers = HeaderMap::new();
		headers.insert("laplace-user-id", HeaderValue::from_static("header-id"));
		headers.append(COOKIE, HeaderValue::from_static("laplaceSig=cookie-sig"));

		let body = br#"{"UserID":"body-id","Sig":"body-sig"}"#;
		let att = parse_header_info(&headers, body);

		// userId from the header, signature from the cookie.
		assert_eq!(att.user_id, "header-id");
		assert_eq!(att.sig, "cookie-sig");
	}

	#[test]
	fn attachment_falls_back_to_body_fields() {
		let headers = HeaderMap::new();
		let body = br#"{"UserID":"7","Sig":"s"}"#;
		let att = parse_header_info(&headers, body);

		assert_eq!(att.user_id, "7");
		assert_eq!(att.sig, "s");
	}

	#[test]
	fn attachment_empty_when_nowhere_present() {
		let att = parse_header_info(&HeaderMap::new(), b"not json");
		assert!(att.user_id.is_empty());
		assert!(att.sig.is_empty());
	}
}
