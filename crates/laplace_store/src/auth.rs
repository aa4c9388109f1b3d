//! Accounts, password hashes, and bearer tokens.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;
use tracing::{info, warn};

use crate::keys::{
	AUTH_ID_COUNTER, FIELD_TOKEN, FIELD_TOKEN_STALE, FIELD_TOKEN_USES, FIELD_USERNAME, PASS_HASH_SALT_KEY,
	USER_AUTH_ID_TABLE, USER_PASS_TABLE, user_key,
};
use crate::kv::{Kv, StoreError, incr_with_reset};
use crate::unix_now;

/// Bytes of a bearer token.
pub const TOKEN_LENGTH: usize = 256;

/// Bytes of the deployment-wide password hashing salt.
pub const SALT_LENGTH: usize = 128;

/// Upper bound on stored usernames.
pub const USERNAME_MAX: usize = 512;

/// Token state loaded for signature verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
	pub token: Vec<u8>,
	/// Unix seconds after which the token fails verification.
	pub stale_at: i64,
	pub uses: i64,
}

#[derive(Debug, Error)]
pub enum AuthError {
	#[error("token is stale")]
	TokenStale,

	#[error("signature is incorrect")]
	SignatureMismatch,

	#[error("no such user: {0}")]
	UnknownUser(String),

	#[error(transparent)]
	Store(#[from] StoreError),
}

/// Account and token operations against the KV store.
///
/// Construction bootstraps the password salt: read it from the store, or
/// generate a random one and publish it with SETNX so concurrent starts
/// agree on a single value for the life of the deployment.
#[derive(Clone)]
pub struct AuthStore {
	kv: Arc<dyn Kv>,
	salt: Vec<u8>,
	token_ttl: Duration,
}

impl AuthStore {
	pub async fn start(kv: Arc<dyn Kv>, token_ttl: Duration) -> Result<Self, StoreError> {
		let salt = match kv.get(PASS_HASH_SALT_KEY).await? {
			Some(encoded) if !encoded.is_empty() => decode_salt(&encoded)?,
			_ => {
				let mut fresh = vec![0u8; SALT_LENGTH];
				rand::thread_rng().fill_bytes(&mut fresh);

				if kv.set_nx(PASS_HASH_SALT_KEY, &STANDARD_NO_PAD.encode(&fresh)).await? {
					info!("published fresh password salt");
					fresh
				} else {
					// Lost the race; the winner's salt is authoritative.
					let encoded = kv
						.get(PASS_HASH_SALT_KEY)
						.await?
						.ok_or_else(|| StoreError::Invariant("password salt vanished during bootstrap".to_string()))?;
					decode_salt(&encoded)?
				}
			}
		};

		Ok(Self { kv, salt, token_ttl })
	}

	fn hash_password(&self, password: &str) -> String {
		let mut hasher = Sha512::new();
		hasher.update(&self.salt);
		hasher.update(password.as_bytes());
		hex::encode(hasher.finalize())
	}

	/// A password is strong iff it is at least 8 bytes long and contains a
	/// code point above 127, or upper+lower+digit, or upper+lower+symbol.
	pub fn password_is_strong(password: &str) -> bool {
		if password.len() < 8 {
			return false;
		}

		let (mut upper, mut lower, mut digit, mut symbol) = (false, false, false, false);

		for c in password.chars() {
			if c as u32 > 127 {
				return true;
			}

			upper |= c.is_ascii_uppercase();
			lower |= c.is_ascii_lowercase();
			digit |= c.is_ascii_digit();
			symbol |= matches!(c, '!'..='/' | ':'..='@' | '['..='`' | '{'..='~');

			if (upper && lower && digit) || (upper && lower && symbol) {
				return true;
			}
		}

		false
	}

	/// Add an account: password hash, userId allocation, and the two id
	/// mappings. Returns false when the username is taken.
	///
	/// The writes are not transactional. A crash after the hash insert
	/// leaves an orphaned credential row; a later Register for the same
	/// name detects the missing id mapping and completes the account
	/// instead of reporting a collision.
	pub async fn create_account(&self, username: &str, password: &str) -> Result<bool, StoreError> {
		if username.len() > USERNAME_MAX {
			return Err(StoreError::Invariant("attempting to store too large of a username".to_string()));
		}

		let hash = self.hash_password(password);

		if !self.kv.hset_nx(USER_PASS_TABLE, username, &hash).await? {
			if self.kv.hget(USER_AUTH_ID_TABLE, username).await?.is_some() {
				return Ok(false);
			}

			warn!(username, "repairing half-registered account");
			self.kv.hset(USER_PASS_TABLE, &[(username, hash.as_str())]).await?;
		}

		let new_id = incr_with_reset(&*self.kv, AUTH_ID_COUNTER).await?;

		if !self
			.kv
			.hset_nx(USER_AUTH_ID_TABLE, username, &new_id.to_string())
			.await?
		{
			return Err(StoreError::Invariant(format!(
				"atomic counter did not return a unique id: {AUTH_ID_COUNTER}"
			)));
		}

		self.kv
			.hset(
				&user_key(&new_id.to_string()),
				&[
					(FIELD_USERNAME, username),
					(FIELD_TOKEN, ""),
					(FIELD_TOKEN_STALE, "0"),
					(FIELD_TOKEN_USES, "0"),
				],
			)
			.await?;

		Ok(true)
	}

	/// Remove an account and its id mappings. Mostly exercised by tests.
	pub async fn delete_user(&self, username: &str) -> Result<bool, StoreError> {
		if !self.kv.hdel(USER_PASS_TABLE, username).await? {
			return Ok(false);
		}

		let auth_id = self.kv.hget(USER_AUTH_ID_TABLE, username).await?;

		if !self.kv.hdel(USER_AUTH_ID_TABLE, username).await? {
			return Err(StoreError::Invariant("could not delete auth id".to_string()));
		}

		if let Some(auth_id) = auth_id {
			self.kv.del(&user_key(&auth_id)).await?;
		}

		Ok(true)
	}

	/// True iff the username exists and the salted hash matches.
	pub async fn valid_login(&self, username: &str, password: &str) -> Result<bool, StoreError> {
		if username.len() > USERNAME_MAX {
			return Ok(false);
		}

		let expected = self.hash_password(password);
		match self.kv.hget(USER_PASS_TABLE, username).await? {
			Some(stored) => Ok(stored == expected),
			None => Ok(false),
		}
	}

	/// Resolve a username to its userId.
	pub async fn auth_id_for(&self, username: &str) -> Result<Option<String>, StoreError> {
		if username.len() > USERNAME_MAX {
			return Err(StoreError::Invariant("attempting to use too large of a username".to_string()));
		}

		Ok(self
			.kv
			.hget(USER_AUTH_ID_TABLE, username)
			.await?
			.filter(|id| !id.is_empty()))
	}

	/// Issue a fresh token: 256 random bytes, use counter reset to zero,
	/// staleness deadline `now + token_ttl`. Replaces any prior token.
	pub async fn issue_token(&self, auth_id: &str) -> Result<Vec<u8>, StoreError> {
		let mut token = vec![0u8; TOKEN_LENGTH];
		rand::thread_rng().fill_bytes(&mut token);

		let stale_at = unix_now() + self.token_ttl.as_secs() as i64;

		self.kv
			.hset(
				&user_key(auth_id),
				&[
					(FIELD_TOKEN, STANDARD_NO_PAD.encode(&token).as_str()),
					(FIELD_TOKEN_STALE, stale_at.to_string().as_str()),
					(FIELD_TOKEN_USES, "0"),
				],
			)
			.await?;

		Ok(token)
	}

	/// Load the token state for a user.
	pub async fn token(&self, auth_id: &str) -> Result<AuthToken, AuthError> {
		let key = user_key(auth_id);
		let fields = self
			.kv
			.hmget(&key, &[FIELD_TOKEN, FIELD_TOKEN_STALE, FIELD_TOKEN_USES])
			.await
			.map_err(AuthError::Store)?;

		let [token, stale, uses] = fields.as_slice() else {
			return Err(AuthError::Store(StoreError::Backend("hmget arity mismatch".to_string())));
		};

		let (Some(token), Some(stale), Some(uses)) = (token, stale, uses) else {
			return Err(AuthError::UnknownUser(auth_id.to_string()));
		};

		let token = if token.is_empty() {
			Vec::new()
		} else {
			STANDARD_NO_PAD.decode(token).map_err(|e| {
				AuthError::Store(StoreError::Malformed {
					key: key.clone(),
					detail: format!("token: {e}"),
				})
			})?
		};

		let parse = |field: &str, value: &str| -> Result<i64, AuthError> {
			value.parse().map_err(|_| {
				AuthError::Store(StoreError::Malformed {
					key: key.clone(),
					detail: format!("{field} is not an integer"),
				})
			})
		};

		Ok(AuthToken {
			token,
			stale_at: parse(FIELD_TOKEN_STALE, stale)?,
			uses: parse(FIELD_TOKEN_USES, uses)?,
		})
	}

	/// Verify a content signature and advance the use counter.
	///
	/// The expected digest is computed against the pre-increment counter
	/// value; the advance itself is a single atomic increment.
	pub async fn verify_signature(&self, auth_id: &str, sig: &[u8], content: &[u8]) -> Result<(), AuthError> {
		let token = self.token(auth_id).await?;

		if unix_now() >= token.stale_at {
			return Err(AuthError::TokenStale);
		}

		let expected = Self::expected_signature(&token, content);
		if sig != expected {
			return Err(AuthError::SignatureMismatch);
		}

		self.kv
			.hincr_by(&user_key(auth_id), FIELD_TOKEN_USES, 1)
			.await
			.map_err(AuthError::Store)?;

		Ok(())
	}

	/// `SHA-256(content ‖ token ‖ decimalAscii(uses))` — the digest a
	/// cooperating client submits as its signature.
	pub fn expected_signature(token: &AuthToken, content: &[u8]) -> [u8; 32] {
		let mut hasher = Sha256::new();
		hasher.update(content);
		hasher.update(&token.token);
		hasher.update(token.uses.to_string().as_bytes());
		hasher.finalize().into()
	}
}

fn decode_salt(encoded: &str) -> Result<Vec<u8>, StoreError> {
	STANDARD_NO_PAD.decode(encoded).map_err(|e| StoreError::Malformed {
		key: PASS_HASH_SALT_KEY.to_string(),
		detail: format!("salt: {e}"),
	})
}
