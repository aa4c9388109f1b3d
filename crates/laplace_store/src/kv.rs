//! The KV client seam.
//!
//! All persisted state lives in an external Redis-compatible store; the
//! trait below is the narrow surface the auth and rooms stores rely on.
//! Production uses [`RedisKv`]; tests and local development use
//! [`crate::MemoryKv`].

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("kv backend: {0}")]
	Backend(String),

	#[error("counter overflow on {0}")]
	CounterOverflow(String),

	#[error("malformed value at {key}: {detail}")]
	Malformed {
		key: String,
		detail: String,
	},

	#[error("{0}")]
	Invariant(String),
}

/// Atomic primitives offered by the store. Single-key operations only;
/// uniqueness is expressed with SETNX-style inserts and allocation with
/// server-side counters.
#[async_trait]
pub trait Kv: Send + Sync {
	async fn ping(&self) -> Result<(), StoreError>;

	async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
	async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
	async fn set_nx(&self, key: &str, value: &str) -> Result<bool, StoreError>;
	async fn del(&self, key: &str) -> Result<bool, StoreError>;
	async fn incr(&self, key: &str) -> Result<i64, StoreError>;

	async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;
	async fn hset(&self, key: &str, pairs: &[(&str, &str)]) -> Result<(), StoreError>;
	async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError>;
	async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError>;
	async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>, StoreError>;
	async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError>;
	async fn hexists(&self, key: &str, field: &str) -> Result<bool, StoreError>;
	async fn hlen(&self, key: &str) -> Result<usize, StoreError>;

	async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError>;
	async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError>;
	async fn scard(&self, key: &str) -> Result<usize, StoreError>;
	async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError>;
	async fn sunionstore(&self, dest: &str, sources: &[&str]) -> Result<usize, StoreError>;

	async fn rpush(&self, key: &str, value: &str) -> Result<(), StoreError>;
	async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError>;
	async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<(), StoreError>;
}

/// INCR with the overflow recovery policy: a counter that hits the top of
/// the 64-bit range is deleted so allocation restarts from 1. Reuse is
/// absorbed by the SETNX guards at every allocation site.
pub async fn incr_with_reset(kv: &dyn Kv, key: &str) -> Result<i64, StoreError> {
	for _ in 0..2 {
		match kv.incr(key).await {
			Ok(value) if value == i64::MAX => {
				kv.del(key).await?;
				return Ok(value);
			}
			Ok(value) => return Ok(value),
			Err(StoreError::CounterOverflow(_)) => {
				info!(key, "counter overflowed, resetting");
				kv.del(key).await?;
			}
			Err(e) => return Err(e),
		}
	}

	Err(StoreError::CounterOverflow(key.to_string()))
}

/// Redis-backed client over a multiplexed connection manager.
#[derive(Clone)]
pub struct RedisKv {
	manager: ConnectionManager,
}

impl RedisKv {
	/// Connect and verify the store is reachable.
	pub async fn connect(url: &str) -> Result<Self, StoreError> {
		let client = redis::Client::open(url).map_err(map_err)?;
		let manager = ConnectionManager::new(client).await.map_err(map_err)?;

		let kv = Self { manager };
		kv.ping().await?;
		info!(url, "kv store connected");
		Ok(kv)
	}

	fn conn(&self) -> ConnectionManager {
		self.manager.clone()
	}
}

fn map_err(err: redis::RedisError) -> StoreError {
	StoreError::Backend(err.to_string())
}

fn map_incr_err(key: &str, err: redis::RedisError) -> StoreError {
	// Redis reports 64-bit counter saturation as a plain error string.
	let text = err.to_string();
	if text.contains("increment or decrement would overflow") {
		StoreError::CounterOverflow(key.to_string())
	} else {
		StoreError::Backend(text)
	}
}

#[async_trait]
impl Kv for RedisKv {
	async fn ping(&self) -> Result<(), StoreError> {
		let _: String = redis::cmd("PING").query_async(&mut self.conn()).await.map_err(map_err)?;
		Ok(())
	}

	async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
		redis::cmd("GET").arg(key).query_async(&mut self.conn()).await.map_err(map_err)
	}

	async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
		let _: () = redis::cmd("SET")
			.arg(key)
			.arg(value)
			.query_async(&mut self.conn())
			.await
			.map_err(map_err)?;
		Ok(())
	}

	async fn set_nx(&self, key: &str, value: &str) -> Result<bool, StoreError> {
		let n: i64 = redis::cmd("SETNX")
			.arg(key)
			.arg(value)
			.query_async(&mut self.conn())
			.await
			.map_err(map_err)?;
		Ok(n != 0)
	}

	async fn del(&self, key: &str) -> Result<bool, StoreError> {
		let n: i64 = redis::cmd("DEL").arg(key).query_async(&mut self.conn()).await.map_err(map_err)?;
		Ok(n != 0)
	}

	async fn incr(&self, key: &str) -> Result<i64, StoreError> {
		redis::cmd("INCR")
			.arg(key)
			.query_async(&mut self.conn())
			.await
			.map_err(|e| map_incr_err(key, e))
	}

	async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
		redis::cmd("HGET")
			.arg(key)
			.arg(field)
			.query_async(&mut self.conn())
			.await
			.map_err(map_err)
	}

	async fn hset(&self, key: &str, pairs: &[(&str, &str)]) -> Result<(), StoreError> {
		let mut cmd = redis::cmd("HSET");
		cmd.arg(key);
		for (field, value) in pairs {
			cmd.arg(field).arg(value);
		}
		let _: i64 = cmd.query_async(&mut self.conn()).await.map_err(map_err)?;
		Ok(())
	}

	async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError> {
		let n: i64 = redis::cmd("HSETNX")
			.arg(key)
			.arg(field)
			.arg(value)
			.query_async(&mut self.conn())
			.await
			.map_err(map_err)?;
		Ok(n != 0)
	}

	async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError> {
		let n: i64 = redis::cmd("HDEL")
			.arg(key)
			.arg(field)
			.query_async(&mut self.conn())
			.await
			.map_err(map_err)?;
		Ok(n != 0)
	}

	async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>, StoreError> {
		let mut cmd = redis::cmd("HMGET");
		cmd.arg(key);
		for field in fields {
			cmd.arg(field);
		}
		cmd.query_async(&mut self.conn()).await.map_err(map_err)
	}

	async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
		redis::cmd("HINCRBY")
			.arg(key)
			.arg(field)
			.arg(delta)
			.query_async(&mut self.conn())
			.await
			.map_err(|e| map_incr_err(key, e))
	}

	async fn hexists(&self, key: &str, field: &str) -> Result<bool, StoreError> {
		let n: i64 = redis::cmd("HEXISTS")
			.arg(key)
			.arg(field)
			.query_async(&mut self.conn())
			.await
			.map_err(map_err)?;
		Ok(n != 0)
	}

	async fn hlen(&self, key: &str) -> Result<usize, StoreError> {
		let n: i64 = redis::cmd("HLEN").arg(key).query_async(&mut self.conn()).await.map_err(map_err)?;
		Ok(n.max(0) as usize)
	}

	async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
		let n: i64 = redis::cmd("SADD")
			.arg(key)
			.arg(member)
			.query_async(&mut self.conn())
			.await
			.map_err(map_err)?;
		Ok(n != 0)
	}

	async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
		let n: i64 = redis::cmd("SREM")
			.arg(key)
			.arg(member)
			.query_async(&mut self.conn())
			.await
			.map_err(map_err)?;
		Ok(n != 0)
	}

	async fn scard(&self, key: &str) -> Result<usize, StoreError> {
		let n: i64 = redis::cmd("SCARD").arg(key).query_async(&mut self.conn()).await.map_err(map_err)?;
		Ok(n.max(0) as usize)
	}

	async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
		let n: i64 = redis::cmd("SISMEMBER")
			.arg(key)
			.arg(member)
			.query_async(&mut self.conn())
			.await
			.map_err(map_err)?;
		Ok(n != 0)
	}

	async fn sunionstore(&self, dest: &str, sources: &[&str]) -> Result<usize, StoreError> {
		let mut cmd = redis::cmd("SUNIONSTORE");
		cmd.arg(dest);
		for source in sources {
			cmd.arg(source);
		}
		let n: i64 = cmd.query_async(&mut self.conn()).await.map_err(map_err)?;
		Ok(n.max(0) as usize)
	}

	async fn rpush(&self, key: &str, value: &str) -> Result<(), StoreError> {
		let _: i64 = redis::cmd("RPUSH")
			.arg(key)
			.arg(value)
			.query_async(&mut self.conn())
			.await
			.map_err(map_err)?;
		Ok(())
	}

	async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError> {
		redis::cmd("LRANGE")
			.arg(key)
			.arg(start)
			.arg(stop)
			.query_async(&mut self.conn())
			.await
			.map_err(map_err)
	}

	async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<(), StoreError> {
		let _: String = redis::cmd("LTRIM")
			.arg(key)
			.arg(start)
			.arg(stop)
			.query_async(&mut self.conn())
			.await
			.map_err(map_err)?;
		Ok(())
	}
}
