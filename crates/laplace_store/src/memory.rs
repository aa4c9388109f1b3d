//! In-memory [`Kv`] backend for tests and local development.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::kv::{Kv, StoreError};

/// HashMap-backed stand-in for the external store. Semantics match the
/// subset of Redis the stores rely on, including counter overflow.
#[derive(Debug, Default)]
pub struct MemoryKv {
	inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
	strings: HashMap<String, String>,
	hashes: HashMap<String, HashMap<String, String>>,
	sets: HashMap<String, HashSet<String>>,
	lists: HashMap<String, Vec<String>>,
}

impl MemoryKv {
	pub fn new() -> Self {
		Self::default()
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
		self.inner.lock().expect("memory kv poisoned")
	}

	fn parse_counter(key: &str, value: &str) -> Result<i64, StoreError> {
		value.parse().map_err(|_| StoreError::Malformed {
			key: key.to_string(),
			detail: "not an integer".to_string(),
		})
	}
}

#[async_trait]
impl Kv for MemoryKv {
	async fn ping(&self) -> Result<(), StoreError> {
		Ok(())
	}

	async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
		Ok(self.lock().strings.get(key).cloned())
	}

	async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
		self.lock().strings.insert(key.to_string(), value.to_string());
		Ok(())
	}

	async fn set_nx(&self, key: &str, value: &str) -> Result<bool, StoreError> {
		let mut inner = self.lock();
		if inner.strings.contains_key(key) {
			return Ok(false);
		}
		inner.strings.insert(key.to_string(), value.to_string());
		Ok(true)
	}

	async fn del(&self, key: &str) -> Result<bool, StoreError> {
		let mut inner = self.lock();
		let removed = inner.strings.remove(key).is_some()
			| inner.hashes.remove(key).is_some()
			| inner.sets.remove(key).is_some()
			| inner.lists.remove(key).is_some();
		Ok(removed)
	}

	async fn incr(&self, key: &str) -> Result<i64, StoreError> {
		let mut inner = self.lock();
		let current = match inner.strings.get(key) {
			Some(v) => Self::parse_counter(key, v)?,
			None => 0,
		};
		let next = current
			.checked_add(1)
			.ok_or_else(|| StoreError::CounterOverflow(key.to_string()))?;
		inner.strings.insert(key.to_string(), next.to_string());
		Ok(next)
	}

	async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
		Ok(self.lock().hashes.get(key).and_then(|h| h.get(field)).cloned())
	}

	async fn hset(&self, key: &str, pairs: &[(&str, &str)]) -> Result<(), StoreError> {
		let mut inner = self.lock();
		let hash = inner.hashes.entry(key.to_string()).or_default();
		for (field, value) in pairs {
			hash.insert(field.to_string(), value.to_string());
		}
		Ok(())
	}

	async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError> {
		let mut inner = self.lock();
		let hash = inner.hashes.entry(key.to_string()).or_default();
		if hash.contains_key(field) {
			return Ok(false);
		}
		hash.insert(field.to_string(), value.to_string());
		Ok(true)
	}

	async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError> {
		Ok(self
			.lock()
			.hashes
			.get_mut(key)
			.is_some_and(|h| h.remove(field).is_some()))
	}

	async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>, StoreError> {
		let inner = self.lock();
		let hash = inner.hashes.get(key);
		Ok(fields
			.iter()
			.map(|f| hash.and_then(|h| h.get(*f)).cloned())
			.collect())
	}

	async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
		let mut inner = self.lock();
		let hash = inner.hashes.entry(key.to_string()).or_default();
		let current = match hash.get(field) {
			Some(v) => Self::parse_counter(key, v)?,
			None => 0,
		};
		let next = current
			.checked_add(delta)
			.ok_or_else(|| StoreError::CounterOverflow(key.to_string()))?;
		hash.insert(field.to_string(), next.to_string());
		Ok(next)
	}

	async fn hexists(&self, key: &str, field: &str) -> Result<bool, StoreError> {
		Ok(self.lock().hashes.get(key).is_some_and(|h| h.contains_key(field)))
	}

	async fn hlen(&self, key: &str) -> Result<usize, StoreError> {
		Ok(self.lock().hashes.get(key).map_or(0, |h| h.len()))
	}

	async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
		Ok(self
			.lock()
			.sets
			.entry(key.to_string())
			.or_default()
			.insert(member.to_string()))
	}

	async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
		Ok(self.lock().sets.get_mut(key).is_some_and(|s| s.remove(member)))
	}

	async fn scard(&self, key: &str) -> Result<usize, StoreError> {
		Ok(self.lock().sets.get(key).map_or(0, |s| s.len()))
	}

	async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
		Ok(self.lock().sets.get(key).is_some_and(|s| s.contains(member)))
	}

	async fn sunionstore(&self, dest: &str, sources: &[&str]) -> Result<usize, StoreError> {
		let mut inner = self.lock();
		let mut union: HashSet<String> = HashSet::new();
		for source in sources {
			if let Some(set) = inner.sets.get(*source) {
				union.extend(set.iter().cloned());
			}
		}
		let len = union.len();
		inner.sets.insert(dest.to_string(), union);
		Ok(len)
	}

	async fn rpush(&self, key: &str, value: &str) -> Result<(), StoreError> {
		self.lock().lists.entry(key.to_string()).or_default().push(value.to_string());
		Ok(())
	}

	async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError> {
		let inner = self.lock();
		let Some(list) = inner.lists.get(key) else {
			return Ok(Vec::new());
		};

		let len = list.len() as isize;
		let clamp = |idx: isize| -> isize {
			if idx < 0 { (len + idx).max(0) } else { idx.min(len) }
		};

		let from = clamp(start);
		let to = if stop < 0 { len + stop } else { stop.min(len - 1) };
		if from > to || len == 0 {
			return Ok(Vec::new());
		}

		Ok(list[from as usize..=(to.min(len - 1)) as usize].to_vec())
	}

	async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<(), StoreError> {
		let mut inner = self.lock();
		let Some(list) = inner.lists.get_mut(key) else {
			return Ok(());
		};

		let len = list.len() as isize;
		let from = if start < 0 { (len + start).max(0) } else { start.min(len) };
		let to = if stop < 0 { len + stop } else { stop.min(len - 1) };

		if from > to || len == 0 {
			list.clear();
			return Ok(());
		}

		*list = list[from as usize..=(to.min(len - 1)) as usize].to_vec();
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn counter_semantics() {
		let kv = MemoryKv::new();
		assert_eq!(kv.incr("n").await.unwrap(), 1);
		assert_eq!(kv.incr("n").await.unwrap(), 2);

		kv.set("n", &i64::MAX.to_string()).await.unwrap();
		assert!(matches!(kv.incr("n").await, Err(StoreError::CounterOverflow(_))));
	}

	#[tokio::test]
	async fn list_range_and_trim() {
		let kv = MemoryKv::new();
		for v in ["a", "b", "c", "d"] {
			kv.rpush("q", v).await.unwrap();
		}

		assert_eq!(kv.lrange("q", 0, 1).await.unwrap(), vec!["a", "b"]);
		assert_eq!(kv.lrange("q", 0, -1).await.unwrap(), vec!["a", "b", "c", "d"]);

		kv.ltrim("q", 2, -1).await.unwrap();
		assert_eq!(kv.lrange("q", 0, -1).await.unwrap(), vec!["c", "d"]);

		kv.ltrim("q", 5, -1).await.unwrap();
		assert!(kv.lrange("q", 0, -1).await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn union_store_with_empty_clears() {
		let kv = MemoryKv::new();
		kv.sadd("roster:x", "1").await.unwrap();
		kv.sadd("roster:x", "2").await.unwrap();

		let n = kv.sunionstore("roster:x", &["empty"]).await.unwrap();
		assert_eq!(n, 0);
		assert_eq!(kv.scard("roster:x").await.unwrap(), 0);
	}
}
