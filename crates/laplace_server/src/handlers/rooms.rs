#![forbid(unsafe_code)]

//! Room lifecycle endpoints: create, join, leave, delete.

use laplace_domain::{AuthContext, Reply, RoomMetadata, RoomWelcome, SelectRoomBody};
use laplace_store::{DeleteOutcome, LeaveOutcome};
use tracing::{info, warn};

use crate::dispatch::RequestBody;
use crate::handlers::verify_request;
use crate::services::Services;

/// Create a room owned by the caller. Each user owns at most one room;
/// a refused creation answers with the structurally-valid empty record.
pub async fn create(svc: &Services, auth: &AuthContext, body: &RequestBody<'_>) -> anyhow::Result<Reply> {
	if let Err(e) = verify_request(svc, auth, body).await? {
		warn!(user_id = %auth.user_id(), error = %e, "unauthorized attempt");
		return Ok(Reply::unsuccessful("Unauthorized!"));
	}

	match svc.rooms.create_room(auth.user_id()).await? {
		Some(metadata) => {
			info!(room_id = %metadata.id, owner = %metadata.owner, "room created");
			Ok(Reply::json(&metadata))
		}
		None => Ok(Reply::json(&RoomMetadata::default())),
	}
}

/// Join an existing room's roster. A missing room answers with the empty
/// welcome record, not an error.
pub async fn join(svc: &Services, auth: &AuthContext, body: &RequestBody<'_>) -> anyhow::Result<Reply> {
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

	match svc.rooms.join_room(auth.user_id(), &rq.room_id).await? {
		Some(welcome) => Ok(Reply::json(&welcome)),
		None => Ok(Reply::json(&RoomWelcome::default())),
	}
}

/// Leave a room's roster. Emptying the roster enqueues the room for a
/// health pass.
pub async fn leave(svc: &Services, auth: &AuthContext, body: &RequestBody<'_>) -> anyhow::Result<Reply> {
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

	match svc.rooms.leave_room(auth.user_id(), &rq.room_id).await? {
		LeaveOutcome::NoSuchRoom => Ok(Reply::unsuccessful("Game Does Not Exist!")),
		LeaveOutcome::NotAMember => Ok(Reply::unsuccessful(rq.room_id)),
		LeaveOutcome::Left => Ok(Reply::successful()),
	}
}

/// Delete a room. External callers may only delete the room they own
/// (discovered through the ownership map); internal callers name the
/// room directly.
pub async fn delete(svc: &Services, auth: &AuthContext, body: &RequestBody<'_>) -> anyhow::Result<Reply> {
	if let Err(e) = verify_request(svc, auth, body).await? {
		warn!(user_id = %auth.user_id(), error = %e, "unauthorized attempt");
		return Ok(Reply::unsuccessful("Unauthorized!"));
	}

	let outcome = if auth.is_internal() {
		let rq: SelectRoomBody = match body.parse::<SelectRoomBody>() {
			Ok(rq) if !rq.room_id.is_empty() => rq,
			_ => return Ok(Reply::unsuccessful("Bad Arguments!")),
		};

		info!(room_id = %rq.room_id, "internal room deletion");
		svc.rooms.delete_room_by_id(&rq.room_id).await?
	} else {
		svc.rooms.delete_owned_room(auth.user_id()).await?
	};

	match outcome {
		DeleteOutcome::NoRoomOwned => Ok(Reply::unsuccessful("User does not own a game!")),
		DeleteOutcome::Deleted(room_id) => {
			info!(room_id = %room_id, "room deleted");
			Ok(Reply::successful())
		}
	}
}
