#![forbid(unsafe_code)]

//! Command fan-out: the closed command table, the per-command secure
//! transport policy, and reply serialization.

use anyhow::{Context as _, bail};
use laplace_domain::{AuthContext, ClientCmd, Reply};
use laplace_protocol::codec::{BodyShape, CodecError, WireFormat, decode_body};
use laplace_protocol::error_json;
use tracing::debug;

use crate::handlers;
use crate::services::Services;

/// Deferred body parsing handed to handlers.
///
/// Wire bodies decode lazily into the handler-chosen shape; internal
/// callers (the scheduler, tests) pass an already-structured value.
pub enum RequestBody<'a> {
	Wire {
		format: WireFormat,
		base64: bool,
		bytes: &'a [u8],
	},
	Value(serde_json::Value),
}

impl RequestBody<'_> {
	/// Parse the body into the shape the handler expects.
	pub fn parse<T: BodyShape>(&self) -> Result<T, CodecError> {
		match self {
			RequestBody::Wire { format, base64, bytes } => decode_body(*format, *base64, bytes),
			RequestBody::Value(value) => {
				serde_json::from_value(value.clone()).map_err(|e| CodecError::Body(e.to_string()))
			}
		}
	}

	/// The bytes a request signature covers: the body exactly as it
	/// arrived on the wire, before any base64 pre-decode.
	pub fn signed_bytes(&self) -> &[u8] {
		match self {
			RequestBody::Wire { bytes, .. } => bytes,
			RequestBody::Value(_) => &[],
		}
	}
}

/// Look up and invoke the handler for `cmd`, enforcing the secure
/// transport requirement, and serialize its reply.
///
/// `Err` means an internal failure: the transport logs it and never
/// relays the message to the client.
pub async fn dispatch(
	svc: &Services,
	cmd: ClientCmd,
	auth: AuthContext,
	body: RequestBody<'_>,
	secure: bool,
) -> anyhow::Result<Vec<u8>> {
	debug!(command = %cmd, user_id = %auth.user_id(), secure, "dispatching");
	metrics::counter!("laplace_commands_total", "command" => cmd.as_str()).increment(1);

	if cmd.requires_secure_transport() && !secure {
		return Ok(error_json("Unsecure Connection!"));
	}

	let reply = match cmd {
		ClientCmd::Empty => Reply::successful(),
		ClientCmd::Register => handlers::auth::register(svc, &body, secure).await?,
		ClientCmd::Login => handlers::auth::login(svc, &body, secure).await?,
		ClientCmd::Action => handlers::relay::apply_action(svc, &auth, &body).await?,
		ClientCmd::Observe => handlers::relay::observe(svc, &auth, &body).await?,
		ClientCmd::GetUser => handlers::auth::get_user(svc, &body).await?,
		ClientCmd::GameCreate => handlers::rooms::create(svc, &auth, &body).await?,
		ClientCmd::GameJoin => handlers::rooms::join(svc, &auth, &body).await?,
		ClientCmd::GameLeave => handlers::rooms::leave(svc, &auth, &body).await?,
		ClientCmd::GameDelete => handlers::rooms::delete(svc, &auth, &body).await?,
		ClientCmd::Error => bail!("command is not defined"),
	};

	reply.into_bytes().context("serialize reply")
}
