#![forbid(unsafe_code)]

pub mod auth;
pub mod keys;
pub mod kv;
pub mod memory;
pub mod rooms;

pub use auth::{AuthError, AuthStore, AuthToken};
pub use kv::{Kv, RedisKv, StoreError};
pub use memory::MemoryKv;
pub use rooms::{DeleteOutcome, LeaveOutcome, RoomsStore};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix time in seconds.
#[inline]
pub fn unix_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_secs() as i64
}
