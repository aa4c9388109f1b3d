//! Room index, rosters, metadata, ownership, and the stale-room queue.

use std::sync::Arc;

use laplace_domain::{RoomMetadata, room_id};
use tracing::{info, warn};

use crate::keys::{
	EMPTY_SET, FIELD_CREATED_AT, FIELD_LAST_USED, FIELD_OWNER, GAME_COUNTER, GAME_HASH, GAME_LIST,
	HEALTH_TASK_QUEUE, OWNER_MAP, metadata_key, roster_key,
};
use crate::kv::{Kv, StoreError, incr_with_reset};
use crate::unix_now;

/// Attempts at allocating a collision-free roomId before giving up.
const MAX_ALLOC_ATTEMPTS: usize = 100;

/// Result of LeaveRoom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveOutcome {
	NoSuchRoom,
	NotAMember,
	Left,
}

/// Result of DeleteRoom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
	NoRoomOwned,
	Deleted(String),
}

/// Room operations against the KV store. The store is authoritative; no
/// room state is held in memory between requests.
#[derive(Clone)]
pub struct RoomsStore {
	kv: Arc<dyn Kv>,
	/// Optional global cap on concurrent rooms.
	throttle: Option<usize>,
}

impl RoomsStore {
	/// Seed the allocation counter and return the store.
	pub async fn start(kv: Arc<dyn Kv>, throttle: Option<usize>) -> Result<Self, StoreError> {
		kv.set_nx(GAME_COUNTER, "0").await?;
		Ok(Self { kv, throttle })
	}

	/// Whether `owner` may create a room: under the global cap (if any)
	/// and not already mapped to a room.
	pub async fn can_create(&self, owner: &str) -> Result<bool, StoreError> {
		if let Some(cap) = self.throttle
			&& self.kv.hlen(GAME_HASH).await? >= cap
		{
			return Ok(false);
		}

		Ok(!self.kv.hexists(OWNER_MAP, owner).await?)
	}

	/// Allocate a room for `owner` and initialize its state, ownership,
	/// metadata, roster, and list entry. Returns None when the owner may
	/// not create a room or allocation attempts are exhausted.
	pub async fn create_room(&self, owner: &str) -> Result<Option<RoomMetadata>, StoreError> {
		if !self.can_create(owner).await? {
			return Ok(None);
		}

		for _ in 0..MAX_ALLOC_ATTEMPTS {
			let counter = incr_with_reset(&*self.kv, GAME_COUNTER).await?;
			let id = room_id::encode(counter as u64);

			if !self.kv.hset_nx(GAME_HASH, &id, "{}").await? {
				info!(room_id = %id, "room id collision, re-allocating");
				continue;
			}

			let now = unix_now();
			let metadata = RoomMetadata {
				id: id.clone(),
				owner: owner.to_string(),
				created_at: now,
				last_used: now,
			};

			if !self.kv.hset_nx(OWNER_MAP, owner, &id).await? {
				return Err(StoreError::Invariant(format!("could not map user {owner} to {id}")));
			}

			self.set_metadata(&metadata).await?;

			if !self.kv.sadd(&roster_key(&id), owner).await? {
				return Err(StoreError::Invariant("failed to add owner to fresh roster".to_string()));
			}

			self.kv.rpush(GAME_LIST, &id).await?;

			return Ok(Some(metadata));
		}

		warn!(owner, "room allocation attempts exhausted");
		Ok(None)
	}

	/// Add `user` to the roster and return the welcome data. A missing
	/// room yields None (a miss, not an error); re-joining is a no-op.
	pub async fn join_room(&self, user: &str, room: &str) -> Result<Option<laplace_domain::RoomWelcome>, StoreError> {
		let Some(state) = self.state(room).await? else {
			return Ok(None);
		};

		if !self.kv.sadd(&roster_key(room), user).await? {
			info!(room_id = %room, user_id = %user, "user tried to join a room twice");
		}

		let players = self.kv.scard(&roster_key(room)).await?;

		Ok(Some(laplace_domain::RoomWelcome {
			id: room.to_string(),
			num_players: players as u16,
			data: state,
		}))
	}

	/// Remove `user` from the roster. Emptying the roster enqueues the
	/// room for a health pass rather than deleting it inline.
	pub async fn leave_room(&self, user: &str, room: &str) -> Result<LeaveOutcome, StoreError> {
		if !self.kv.hexists(GAME_HASH, room).await? {
			return Ok(LeaveOutcome::NoSuchRoom);
		}

		if !self.kv.srem(&roster_key(room), user).await? {
			return Ok(LeaveOutcome::NotAMember);
		}

		if self.kv.scard(&roster_key(room)).await? == 0 {
			self.submit_health_check(room).await?;
		}

		Ok(LeaveOutcome::Left)
	}

	/// Delete the room owned by `owner`, discovered via the owner map.
	pub async fn delete_owned_room(&self, owner: &str) -> Result<DeleteOutcome, StoreError> {
		let Some(room) = self.kv.hget(OWNER_MAP, owner).await?.filter(|id| !id.is_empty()) else {
			return Ok(DeleteOutcome::NoRoomOwned);
		};

		self.clear_room(&room, Some(owner)).await?;
		Ok(DeleteOutcome::Deleted(room))
	}

	/// Delete a room by id, resolving its owner from metadata. Used by
	/// internal callers (the stale-room collector).
	pub async fn delete_room_by_id(&self, room: &str) -> Result<DeleteOutcome, StoreError> {
		let owner = self.metadata(room).await?.map(|m| m.owner);
		self.clear_room(room, owner.as_deref()).await?;
		Ok(DeleteOutcome::Deleted(room.to_string()))
	}

	/// Remove the state blob, metadata, roster, and ownership entry.
	/// Only the state-blob delete is authoritative; the other removals
	/// log on failure and the delete still counts.
	async fn clear_room(&self, room: &str, owner: Option<&str>) -> Result<(), StoreError> {
		if !self.kv.hdel(GAME_HASH, room).await? {
			return Err(StoreError::Invariant(format!("room state already missing for {room}")));
		}

		if !self.kv.del(&metadata_key(room)).await? {
			warn!(room_id = %room, "failed to delete metadata");
		}

		let remaining = self.kv.sunionstore(&roster_key(room), &[EMPTY_SET]).await?;
		if remaining > 0 {
			warn!(room_id = %room, remaining, "failed to clear roster");
		}

		if let Some(owner) = owner {
			self.kv.hdel(OWNER_MAP, owner).await?;
		}

		Ok(())
	}

	/// Last-used timestamp from metadata, or None when metadata is gone.
	pub async fn room_health(&self, room: &str) -> Result<Option<i64>, StoreError> {
		let Some(last_used) = self
			.kv
			.hget(&metadata_key(room), FIELD_LAST_USED)
			.await?
			.filter(|v| !v.is_empty())
		else {
			return Ok(None);
		};

		last_used
			.parse()
			.map(Some)
			.map_err(|_| StoreError::Malformed {
				key: metadata_key(room),
				detail: "lastUsed is not an integer".to_string(),
			})
	}

	pub async fn is_user_in_room(&self, user: &str, room: &str) -> Result<bool, StoreError> {
		self.kv.sismember(&roster_key(room), user).await
	}

	/// The opaque state blob, or None when the room does not exist.
	pub async fn state(&self, room: &str) -> Result<Option<String>, StoreError> {
		Ok(self.kv.hget(GAME_HASH, room).await?.filter(|s| !s.is_empty()))
	}

	pub async fn set_metadata(&self, metadata: &RoomMetadata) -> Result<(), StoreError> {
		self.kv
			.hset(
				&metadata_key(&metadata.id),
				&[
					(FIELD_OWNER, metadata.owner.as_str()),
					(FIELD_CREATED_AT, metadata.created_at.to_string().as_str()),
					(FIELD_LAST_USED, metadata.last_used.to_string().as_str()),
				],
			)
			.await
	}

	pub async fn metadata(&self, room: &str) -> Result<Option<RoomMetadata>, StoreError> {
		let fields = self
			.kv
			.hmget(&metadata_key(room), &[FIELD_OWNER, FIELD_CREATED_AT, FIELD_LAST_USED])
			.await?;

		let [Some(owner), Some(created_at), Some(last_used)] = fields.as_slice() else {
			return Ok(None);
		};

		let parse = |field: &str, value: &str| -> Result<i64, StoreError> {
			value.parse().map_err(|_| StoreError::Malformed {
				key: metadata_key(room),
				detail: format!("{field} is not an integer"),
			})
		};

		Ok(Some(RoomMetadata {
			id: room.to_string(),
			owner: owner.clone(),
			created_at: parse(FIELD_CREATED_AT, created_at)?,
			last_used: parse(FIELD_LAST_USED, last_used)?,
		}))
	}

	/// Advance `lastUsed` to now. Last writer wins under concurrency;
	/// the timestamp is a hint for garbage collection.
	pub async fn touch(&self, room: &str) -> Result<(), StoreError> {
		self.kv
			.hset(&metadata_key(room), &[(FIELD_LAST_USED, unix_now().to_string().as_str())])
			.await
	}

	/// Enqueue a room for a later health pass.
	pub async fn submit_health_check(&self, room: &str) -> Result<(), StoreError> {
		self.kv.rpush(HEALTH_TASK_QUEUE, room).await
	}

	/// Drain up to `cap` roomIds from the head of the stale-room queue.
	pub async fn pop_health_batch(&self, cap: usize) -> Result<Vec<String>, StoreError> {
		if cap == 0 {
			return Ok(Vec::new());
		}

		let batch = self.kv.lrange(HEALTH_TASK_QUEUE, 0, cap as isize - 1).await?;
		self.kv.ltrim(HEALTH_TASK_QUEUE, cap as isize, -1).await?;

		Ok(batch.into_iter().filter(|id| !id.is_empty()).collect())
	}

	/// Number of live rooms.
	pub async fn room_count(&self) -> Result<usize, StoreError> {
		self.kv.hlen(GAME_HASH).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::memory::MemoryKv;

	async fn store() -> (Arc<MemoryKv>, RoomsStore) {
		let kv = Arc::new(MemoryKv::new());
		let rooms = RoomsStore::start(kv.clone(), None).await.unwrap();
		(kv, rooms)
	}

	#[tokio::test]
	async fn create_room_initializes_every_mapping() {
		let (kv, rooms) = store().await;

		let meta = rooms.create_room("7").await.unwrap().unwrap();
		assert_eq!(meta.owner, "7");
		assert_eq!(meta.created_at, meta.last_used);
		assert_eq!(meta.id.len(), room_id::ROOM_ID_LEN);

		assert_eq!(kv.hget(OWNER_MAP, "7").await.unwrap().unwrap(), meta.id);
		assert_eq!(kv.hget(GAME_HASH, &meta.id).await.unwrap().unwrap(), "{}");
		assert!(rooms.is_user_in_room("7", &meta.id).await.unwrap());
		assert_eq!(kv.lrange(GAME_LIST, 0, -1).await.unwrap(), vec![meta.id.clone()]);
	}

	#[tokio::test]
	async fn one_room_per_owner() {
		let (_kv, rooms) = store().await;

		assert!(rooms.create_room("7").await.unwrap().is_some());
		assert!(rooms.create_room("7").await.unwrap().is_none());
		assert!(rooms.create_room("8").await.unwrap().is_some());
	}

	#[tokio::test]
	async fn throttle_caps_room_count() {
		let kv = Arc::new(MemoryKv::new());
		let rooms = RoomsStore::start(kv, Some(1)).await.unwrap();

		assert!(rooms.create_room("7").await.unwrap().is_some());
		assert!(rooms.create_room("8").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn allocation_retries_on_collision() {
		let (kv, rooms) = store().await;

		// Seed the id the next counter value would produce.
		kv.hset(GAME_HASH, &[(room_id::encode(1).as_str(), "{}")]).await.unwrap();

		let meta = rooms.create_room("7").await.unwrap().unwrap();
		assert_eq!(meta.id, room_id::encode(2));
	}

	#[tokio::test]
	async fn join_is_idempotent_on_the_roster() {
		let (_kv, rooms) = store().await;

		let meta = rooms.create_room("7").await.unwrap().unwrap();

		let first = rooms.join_room("9", &meta.id).await.unwrap().unwrap();
		assert_eq!(first.num_players, 2);

		let second = rooms.join_room("9", &meta.id).await.unwrap().unwrap();
		assert_eq!(second, first);
	}

	#[tokio::test]
	async fn join_missing_room_is_a_miss() {
		let (_kv, rooms) = store().await;
		assert!(rooms.join_room("9", "aaaaaaaaaaaab").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn leaving_last_member_enqueues_health_check() {
		let (kv, rooms) = store().await;

		let meta = rooms.create_room("7").await.unwrap().unwrap();

		assert_eq!(rooms.leave_room("7", &meta.id).await.unwrap(), LeaveOutcome::Left);
		assert_eq!(
			kv.lrange(HEALTH_TASK_QUEUE, 0, -1).await.unwrap(),
			vec![meta.id.clone()]
		);
		assert_eq!(kv.scard(&roster_key(&meta.id)).await.unwrap(), 0);
	}

	#[tokio::test]
	async fn leave_by_non_member_does_not_enqueue() {
		let (kv, rooms) = store().await;

		let meta = rooms.create_room("7").await.unwrap().unwrap();

		assert_eq!(rooms.leave_room("9", &meta.id).await.unwrap(), LeaveOutcome::NotAMember);
		assert!(kv.lrange(HEALTH_TASK_QUEUE, 0, -1).await.unwrap().is_empty());

		assert_eq!(
			rooms.leave_room("9", "aaaaaaaaaaaab").await.unwrap(),
			LeaveOutcome::NoSuchRoom
		);
	}

	#[tokio::test]
	async fn delete_clears_state_metadata_roster_and_ownership() {
		let (kv, rooms) = store().await;

		let meta = rooms.create_room("7").await.unwrap().unwrap();
		rooms.join_room("9", &meta.id).await.unwrap();

		let outcome = rooms.delete_owned_room("7").await.unwrap();
		assert_eq!(outcome, DeleteOutcome::Deleted(meta.id.clone()));

		assert!(kv.hget(GAME_HASH, &meta.id).await.unwrap().is_none());
		assert!(rooms.metadata(&meta.id).await.unwrap().is_none());
		assert_eq!(kv.scard(&roster_key(&meta.id)).await.unwrap(), 0);
		assert!(kv.hget(OWNER_MAP, "7").await.unwrap().is_none());

		// The owner can create again afterwards.
		assert!(rooms.create_room("7").await.unwrap().is_some());
	}

	#[tokio::test]
	async fn delete_without_ownership_reports_it() {
		let (_kv, rooms) = store().await;
		assert_eq!(rooms.delete_owned_room("7").await.unwrap(), DeleteOutcome::NoRoomOwned);
	}

	#[tokio::test]
	async fn delete_by_id_resolves_owner_from_metadata() {
		let (kv, rooms) = store().await;

		let meta = rooms.create_room("7").await.unwrap().unwrap();
		rooms.delete_room_by_id(&meta.id).await.unwrap();

		assert!(kv.hget(OWNER_MAP, "7").await.unwrap().is_none());
		assert!(kv.hget(GAME_HASH, &meta.id).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn health_reads_last_used() {
		let (_kv, rooms) = store().await;

		let meta = rooms.create_room("7").await.unwrap().unwrap();
		assert_eq!(rooms.room_health(&meta.id).await.unwrap(), Some(meta.last_used));
		assert_eq!(rooms.room_health("aaaaaaaaaaaab").await.unwrap(), None);
	}

	#[tokio::test]
	async fn touch_advances_last_used() {
		let (kv, rooms) = store().await;

		let meta = rooms.create_room("7").await.unwrap().unwrap();
		kv.hset(&metadata_key(&meta.id), &[(FIELD_LAST_USED, "5")]).await.unwrap();

		rooms.touch(&meta.id).await.unwrap();
		assert!(rooms.room_health(&meta.id).await.unwrap().unwrap() >= meta.last_used);
	}

	#[tokio::test]
	async fn health_batch_drains_fifo() {
		let (_kv, rooms) = store().await;

		for id in ["r1", "r2", "r3"] {
			rooms.submit_health_check(id).await.unwrap();
		}

		assert_eq!(rooms.pop_health_batch(2).await.unwrap(), vec!["r1", "r2"]);
		assert_eq!(rooms.pop_health_batch(2).await.unwrap(), vec!["r3"]);
		assert!(rooms.pop_health_batch(2).await.unwrap().is_empty());
	}
}
