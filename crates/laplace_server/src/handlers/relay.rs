#![forbid(unsafe_code)]

//! State-relay endpoints bridged to the engine: ApplyAction, GetRoomState.

use anyhow::{Context as _, bail};
use laplace_domain::{AuthContext, RelayBody, Reply, SelectRoomBody};
use serde_json::json;
use tracing::{error, warn};

use crate::dispatch::RequestBody;
use crate::handlers::verify_request;
use crate::services::Services;

/// Relay a caller action through the engine and persist the advance of
/// the room's last-used timestamp. The engine reply is returned verbatim.
pub async fn apply_action(svc: &Services, auth: &AuthContext, body: &RequestBody<'_>) -> anyhow::Result<Reply> {
	if let Err(e) = verify_request(svc, auth, body).await? {
		warn!(user_id = %auth.user_id(), error = %e, "unauthorized attempt");
		return Ok(Reply::unsuccessful("Unauthorized!"));
	}

	let rq: RelayBody = match body.parse() {
		Ok(rq) => rq,
		Err(e) => {
			warn!(error = %e, "bad argument");
			return Ok(Reply::unsuccessful("Bad Arguments!"));
		}
	};

	match svc.rooms.is_user_in_room(auth.user_id(), &rq.room_id).await {
		Ok(true) => {}
		Ok(false) => return Ok(Reply::unsuccessful("User Not In Game")),
		Err(e) => {
			warn!(error = %e, "could not check the roster");
			return Ok(Reply::unsuccessful("User Not In Game"));
		}
	}

	let reply = match send_state_to_engine(svc, &rq.room_id, rq.relay).await? {
		Ok(reply) => reply,
		Err(e) => {
			error!(room_id = %rq.room_id, error = %e, "engine exchange failed");
			return Ok(Reply::raw_text("Could Not Upload State to Server!"));
		}
	};

	if let Err(e) = svc.rooms.touch(&rq.room_id).await {
		error!(room_id = %rq.room_id, error = %e, "could not advance lastUsed");
	}

	Ok(Reply::Raw(reply))
}

/// Observe a room: same exchange as ApplyAction with an empty relay, no
/// roster requirement (rooms are world-observable), no timestamp update.
pub async fn observe(svc: &Services, auth: &AuthContext, body: &RequestBody<'_>) -> anyhow::Result<Reply> {
	if let Err(e) = verify_request(svc, auth, body).await? {
		warn!(user_id = %auth.user_id(), error = %e, "unauthorized attempt");
		return Ok(Reply::unsuccessful("Unauthorized!"));
	}

	let rq: SelectRoomBody = match body.parse() {
		Ok(rq) => rq,
		Err(e) => {
			warn!(error = %e, "bad argument");
			return Ok(Reply::unsuccessful("Bad Arguments!"));
		}
	};

	if svc.rooms.state(&rq.room_id).await?.is_none() {
		return Ok(Reply::unsuccessful("Game Does Not Exist"));
	}

	let relay = serde_json::Value::Object(serde_json::Map::new());
	match send_state_to_engine(svc, &rq.room_id, relay).await? {
		Ok(reply) => Ok(Reply::Raw(reply)),
		Err(e) => {
			error!(room_id = %rq.room_id, error = %e, "engine exchange failed");
			Ok(Reply::raw_text("Could Not Upload State to Server!"))
		}
	}
}

/// Load the state blob, compose `{State, Relay}`, and run one engine
/// exchange. The outer error is a server fault (missing/corrupt state);
/// the inner error is an engine transport failure surfaced to the caller.
async fn send_state_to_engine(
	svc: &Services,
	room_id: &str,
	relay: serde_json::Value,
) -> anyhow::Result<Result<Vec<u8>, anyhow::Error>> {
	let Some(state) = svc.rooms.state(room_id).await? else {
		bail!("room state missing for {room_id}");
	};

	let state: serde_json::Value = serde_json::from_str(&state)
		.with_context(|| format!("state blob for {room_id} is not valid JSON"))?;

	let payload = serde_json::to_vec(&json!({ "State": state, "Relay": relay })).context("encode engine payload")?;

	Ok(svc.engine.exchange(&payload).await)
}
