#![forbid(unsafe_code)]

//! Seconds-granularity cron scheduling.
//!
//! The ledger below is fixed at startup. Each tick of the stale-room job
//! drains a batch from the health queue and fans it out through the
//! broker as prefixed task strings.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context as _;
use chrono::Utc;
use cron::Schedule;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::services::Services;
use crate::tasks::worker::{HEALTH_TASK_PREFIX, construct_task};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CronJob {
	StaleRooms,
}

/// The cron ledger: `sec min hour dom mon dow` expressions.
const CRON_LEDGER: &[(&str, CronJob)] = &[("5 * * * * *", CronJob::StaleRooms)];

/// Parse the ledger and start the scheduler loop.
pub fn spawn_scheduler(services: Arc<Services>, shutdown: watch::Receiver<bool>) -> anyhow::Result<JoinHandle<()>> {
	let jobs = CRON_LEDGER
		.iter()
		.map(|(expr, job)| {
			Schedule::from_str(expr)
				.map(|schedule| (schedule, *job))
				.with_context(|| format!("cron expression {expr:?}"))
		})
		.collect::<anyhow::Result<Vec<_>>>()?;

	info!(jobs = jobs.len(), "cron scheduler started");
	Ok(tokio::spawn(scheduler_loop(services, jobs, shutdown)))
}

async fn scheduler_loop(services: Arc<Services>, jobs: Vec<(Schedule, CronJob)>, mut shutdown: watch::Receiver<bool>) {
	loop {
		let now = Utc::now();
		let Some((next_at, job)) = jobs
			.iter()
			.filter_map(|(schedule, job)| schedule.after(&now).next().map(|at| (at, *job)))
			.min_by_key(|(at, _)| *at)
		else {
			info!("cron ledger has no future fire times, scheduler exiting");
			return;
		};

		let wait = (next_at - Utc::now()).to_std().unwrap_or_default();

		tokio::select! {
			_ = tokio::time::sleep(wait) => {
				match job {
					CronJob::StaleRooms => tick_stale_rooms(&services).await,
				}
			}
			changed = shutdown.changed() => {
				if changed.is_err() || *shutdown.borrow() {
					info!("cron scheduler stopped");
					return;
				}
			}
		}
	}
}

/// One stale-room tick: peek a batch off the queue, trim it, and publish
/// each roomId as a prefixed task string.
pub async fn tick_stale_rooms(services: &Services) {
	let batch = match services.rooms.pop_health_batch(services.cfg.health_batch_cap).await {
		Ok(batch) => batch,
		Err(e) => {
			error!(error = %e, "fatal: could not drain the stale-room queue");
			return;
		}
	};

	if batch.is_empty() {
		return;
	}

	debug!(count = batch.len(), "dispatching health tasks");

	for room in batch {
		let task = construct_task(HEALTH_TASK_PREFIX, &[&room]);
		if let Err(e) = services.producer.publish(task).await {
			error!(room_id = %room, error = %e, "fatal: could not publish health task");
		}
	}
}
