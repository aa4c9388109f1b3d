#![forbid(unsafe_code)]

//! Account endpoints: Register, Login, GetUser.

use anyhow::bail;
use laplace_domain::{GetUserBody, LoginBody, RegisterBody, Reply, UserInfo};
use laplace_store::AuthStore;
use tracing::{info, warn};

use crate::dispatch::RequestBody;
use crate::services::Services;

/// Register a new account. Requires an upgraded transport, a non-empty
/// username, and a strong password. Answers with the raw username.
pub async fn register(svc: &Services, body: &RequestBody<'_>, secure: bool) -> anyhow::Result<Reply> {
	if !secure {
		return Ok(Reply::raw_text("Unsecure Connection!"));
	}

	let rq: RegisterBody = body.parse().unwrap_or_default();

	if rq.username.is_empty() {
		return Ok(Reply::raw_text("Illegal Input!"));
	}
	if !AuthStore::password_is_strong(&rq.password) {
		return Ok(Reply::raw_text("Weak Password!"));
	}

	if svc.auth.create_account(&rq.username, &rq.password).await? {
		info!(username = %rq.username, "account registered");
		Ok(Reply::Raw(rq.username.into_bytes()))
	} else {
		Ok(Reply::raw_text("Username Already Exists!"))
	}
}

/// Login with username and password, answering with the raw bytes of a
/// fresh token.
pub async fn login(svc: &Services, body: &RequestBody<'_>, secure: bool) -> anyhow::Result<Reply> {
	if !secure {
		return Ok(Reply::raw_text("Unsecure Connection!"));
	}

	let rq: LoginBody = body.parse().unwrap_or_default();

	if !svc.auth.valid_login(&rq.username, &rq.password).await? {
		warn!(username = %rq.username, "rejected login");
		return Ok(Reply::raw_text("Illegal Input!"));
	}

	let Some(auth_id) = svc.auth.auth_id_for(&rq.username).await? else {
		bail!("valid credentials but no user id mapping for {}", rq.username);
	};

	let token = svc.auth.issue_token(&auth_id).await?;
	Ok(Reply::Raw(token))
}

/// Resolve a username to its public userId.
pub async fn get_user(svc: &Services, body: &RequestBody<'_>) -> anyhow::Result<Reply> {
	let rq: GetUserBody = body.parse().unwrap_or_default();

	match svc.auth.auth_id_for(&rq.username).await? {
		Some(auth_id) => Ok(Reply::json(&UserInfo {
			auth_id,
			username: rq.username,
		})),
		None => Ok(Reply::unsuccessful("User Does Not Exist!")),
	}
}
