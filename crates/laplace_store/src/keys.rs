//! KV keyspace names. These are wire-visible state; renaming any of them
//! is a breaking change for deployments sharing a store.

/// Hash: `username -> hex(SHA-512(salt ‖ password))`.
pub const USER_PASS_TABLE: &str = "userPassword";

/// Integer counter for userId allocation.
pub const AUTH_ID_COUNTER: &str = "authIDAtomicCounter";

/// Hash: `username -> userId`.
pub const USER_AUTH_ID_TABLE: &str = "userToAuthID";

/// Per-user hash key prefix; concatenated with the userId.
pub const AUTH_ID_SET_PREFIX: &str = "authID:";

pub const FIELD_USERNAME: &str = "username";
pub const FIELD_TOKEN: &str = "token";
pub const FIELD_TOKEN_STALE: &str = "stale";
pub const FIELD_TOKEN_USES: &str = "tokenUses";

/// String: the deployment-wide password hashing salt.
pub const PASS_HASH_SALT_KEY: &str = "PasswordSalt";

/// List: roomIds in creation order.
pub const GAME_LIST: &str = "gameList";

/// Hash: `roomId -> stateBlob` (JSON). Authoritative room existence.
pub const GAME_HASH: &str = "gameHash";

/// Hash: `userId -> roomId`, at most one room per owner.
pub const OWNER_MAP: &str = "ownerMapGame";

/// Set key prefix for per-room rosters.
pub const ROSTER_PREFIX: &str = "roster:";

/// Integer counter for roomId allocation.
pub const GAME_COUNTER: &str = "gameCountInteger";

/// Per-room metadata hash key prefix.
pub const METADATA_PREFIX: &str = "metadataHash:";

pub const FIELD_OWNER: &str = "owner";
pub const FIELD_CREATED_AT: &str = "createdAt";
pub const FIELD_LAST_USED: &str = "lastUsed";

/// Well-known empty set, union-stored over rosters to clear them.
pub const EMPTY_SET: &str = "empty";

/// List: roomIds awaiting a health pass.
pub const HEALTH_TASK_QUEUE: &str = "healthTaskQueue";

/// Per-user hash key for a userId.
pub fn user_key(auth_id: &str) -> String {
	format!("{AUTH_ID_SET_PREFIX}{auth_id}")
}

/// Roster set key for a room.
pub fn roster_key(room_id: &str) -> String {
	format!("{ROSTER_PREFIX}{room_id}")
}

/// Metadata hash key for a room.
pub fn metadata_key(room_id: &str) -> String {
	format!("{METADATA_PREFIX}{room_id}")
}
