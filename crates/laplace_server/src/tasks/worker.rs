#![forbid(unsafe_code)]

//! The fixed worker pool consuming from the broker backend, and the
//! registered task handlers.
//!
//! Task strings are `<prefix>~<arg0>~<arg1>~…`; the first token selects
//! the handler. Failed tasks are logged and dropped, never redelivered —
//! the stale-room task re-schedules itself by re-enqueuing the room.

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use laplace_domain::{AuthContext, SelectRoomBody};
use laplace_store::unix_now;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::dispatch::RequestBody;
use crate::handlers;
use crate::services::Services;
use crate::tasks::broker::WorkerSocket;

/// In-band delimiter of task strings. Arguments must not contain it.
pub const MAGIC_RUNE: char = '~';

/// Garbage collection of idle rooms.
pub const HEALTH_TASK_PREFIX: &str = "healthTask";

/// Adds a member to a KV set; integration-test traffic only.
pub const TEST_TASK_PREFIX: &str = "unitTest";

/// Join a prefix and its arguments with the delimiter.
pub fn construct_task(prefix: &str, args: &[&str]) -> String {
	let mut out = String::from(prefix);
	for arg in args {
		out.push(MAGIC_RUNE);
		out.push_str(arg);
	}
	out
}

/// Split a task string into its dispatch key and arguments.
pub fn parse_task(msg: &str) -> (&str, Vec<&str>) {
	let mut parts = msg.split(MAGIC_RUNE);
	let prefix = parts.next().unwrap_or_default();
	(prefix, parts.collect())
}

/// Handles to the running pool.
pub struct WorkerPool {
	handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
	/// Wait for every worker to confirm shutdown, bounded per worker.
	pub async fn join(self, grace: Duration) {
		for (i, handle) in self.handles.into_iter().enumerate() {
			if timeout(grace, handle).await.is_err() {
				warn!(worker = i, "task worker did not stop within the grace");
			}
		}
	}
}

/// Start one worker task per socket.
pub fn spawn_workers(services: Arc<Services>, sockets: Vec<WorkerSocket>, shutdown: watch::Receiver<bool>) -> WorkerPool {
	let handles = sockets
		.into_iter()
		.enumerate()
		.map(|(id, socket)| tokio::spawn(worker_loop(id, services.clone(), socket, shutdown.clone())))
		.collect();

	WorkerPool { handles }
}

async fn worker_loop(id: usize, services: Arc<Services>, socket: WorkerSocket, mut shutdown: watch::Receiver<bool>) {
	debug!(worker = id, "task worker started");

	let recv_timeout = services.cfg.workers.recv_timeout;
	let idle_sleep = services.cfg.workers.idle_sleep;

	loop {
		match socket.try_recv(recv_timeout).await {
			Ok(Some(delivery)) => {
				socket.receipt(delivery.id).await;

				if let Err(e) = on_task(&services, &delivery.task).await {
					error!(worker = id, task = %delivery.task, error = %e, "task failed");
				}

				socket.done(delivery.id).await;
			}
			Ok(None) => {
				debug!(worker = id, "nothing to consume");
				tokio::select! {
					_ = tokio::time::sleep(idle_sleep) => {}
					changed = shutdown.changed() => {
						if changed.is_err() {
							break;
						}
					}
				}
			}
			Err(e) => {
				warn!(worker = id, error = %e, "worker receive failed");
				break;
			}
		}

		if *shutdown.borrow() {
			break;
		}
	}

	debug!(worker = id, "task worker stopped");
}

/// Parse a task string and run the registered handler for its prefix.
pub async fn on_task(services: &Services, msg: &str) -> anyhow::Result<()> {
	if msg.is_empty() {
		debug!("empty task message");
		return Ok(());
	}

	metrics::counter!("laplace_tasks_worked_total").increment(1);

	let (prefix, args) = parse_task(msg);
	match prefix {
		HEALTH_TASK_PREFIX => health_task(services, &args).await,
		TEST_TASK_PREFIX => test_task(services, &args).await,
		other => bail!("unknown task prefix: {other}"),
	}
}

/// Evaluate one room: delete it when it has gone stale, otherwise put it
/// back in the queue for a later pass.
async fn health_task(services: &Services, args: &[&str]) -> anyhow::Result<()> {
	let Some(room) = args.first() else {
		bail!("health task did not receive a room id");
	};

	let Some(last_used) = services.rooms.room_health(room).await? else {
		bail!("room metadata missing for {room}");
	};

	let stale_after = last_used + services.cfg.stale_room.as_secs() as i64;
	if unix_now() > stale_after {
		info!(room_id = %room, "room went stale, collecting");

		let body = RequestBody::Value(serde_json::to_value(SelectRoomBody {
			room_id: room.to_string(),
		})?);
		handlers::rooms::delete(services, &AuthContext::Internal, &body).await?;
	} else {
		services.rooms.submit_health_check(room).await?;
	}

	Ok(())
}

/// `unitTest~<set>~<member>`: add a member to a set.
async fn test_task(services: &Services, args: &[&str]) -> anyhow::Result<()> {
	let [set, member, ..] = args else {
		bail!("test task did not receive a set key and value");
	};

	info!(set = %set, member = %member, "unit test task running");
	services.kv.sadd(set, member).await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn task_strings_round_trip() {
		let task = construct_task(HEALTH_TASK_PREFIX, &["aaaaaaaaaaaab"]);
		assert_eq!(task, "healthTask~aaaaaaaaaaaab");

		let (prefix, args) = parse_task(&task);
		assert_eq!(prefix, HEALTH_TASK_PREFIX);
		assert_eq!(args, vec!["aaaaaaaaaaaab"]);
	}

	#[test]
	fn parse_task_handles_multiple_args() {
		let (prefix, args) = parse_task("unitTest~someSet~someValue");
		assert_eq!(prefix, TEST_TASK_PREFIX);
		assert_eq!(args, vec!["someSet", "someValue"]);
	}

	#[test]
	fn parse_task_with_no_args() {
		let (prefix, args) = parse_task("healthTask");
		assert_eq!(prefix, "healthTask");
		assert!(args.is_empty());
	}
}
