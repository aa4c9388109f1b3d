#![forbid(unsafe_code)]

//! In-process task fabric with three endpoints: a producer frontend that
//! acknowledges accepted tasks, a worker backend with pull semantics, and
//! a control endpoint for orderly termination.
//!
//! Delivery is exactly-once while the broker lives: a task handed to a
//! worker is never re-queued. Pulls are served FIFO, which fair-queues
//! work across however many workers are attached.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info};

const BROKER_CHANNEL_CAPACITY: usize = 256;

/// One task handed to a worker.
#[derive(Debug)]
pub struct Delivery {
	pub id: u64,
	pub task: String,
}

enum BrokerFrame {
	Publish {
		task: String,
		accepted: oneshot::Sender<()>,
	},
	Pull {
		reply: oneshot::Sender<Option<Delivery>>,
	},
	Receipt {
		id: u64,
	},
	Done {
		id: u64,
	},
	Terminate {
		confirm: oneshot::Sender<()>,
	},
}

/// Producer-facing endpoint.
#[derive(Clone)]
pub struct TaskProducer {
	tx: mpsc::Sender<BrokerFrame>,
	ack_timeout: Duration,
}

impl TaskProducer {
	/// Send a task string and wait (bounded) for a worker receipt, so the
	/// caller knows the task was accepted by the broker-worker chain.
	pub async fn publish(&self, task: String) -> anyhow::Result<()> {
		let (accepted_tx, accepted_rx) = oneshot::channel();

		self.tx
			.send(BrokerFrame::Publish {
				task,
				accepted: accepted_tx,
			})
			.await
			.map_err(|_| anyhow!("task broker is down"))?;

		timeout(self.ack_timeout, accepted_rx)
			.await
			.map_err(|_| anyhow!("no worker accepted the task within {:?}", self.ack_timeout))?
			.map_err(|_| anyhow!("task broker dropped the task"))?;

		metrics::counter!("laplace_tasks_published_total").increment(1);
		Ok(())
	}
}

/// Worker-facing endpoint: strict pull / receipt / done.
pub struct WorkerSocket {
	tx: mpsc::Sender<BrokerFrame>,
}

impl WorkerSocket {
	/// Non-blocking receive with a bounded wait. `Ok(None)` means the
	/// queue was empty (or the broker did not answer in time).
	pub async fn try_recv(&self, wait: Duration) -> anyhow::Result<Option<Delivery>> {
		let (reply_tx, reply_rx) = oneshot::channel();

		self.tx
			.send(BrokerFrame::Pull { reply: reply_tx })
			.await
			.map_err(|_| anyhow!("task broker is down"))?;

		match timeout(wait, reply_rx).await {
			Err(_) => Ok(None),
			Ok(Err(_)) => Err(anyhow!("task broker is down")),
			Ok(Ok(delivery)) => Ok(delivery),
		}
	}

	/// Acknowledge receipt; unblocks the producer's publish.
	pub async fn receipt(&self, id: u64) {
		let _ = self.tx.send(BrokerFrame::Receipt { id }).await;
	}

	/// Signal completion of the work.
	pub async fn done(&self, id: u64) {
		let _ = self.tx.send(BrokerFrame::Done { id }).await;
	}
}

/// Control endpoint used by the shutdown path.
pub struct BrokerControl {
	tx: mpsc::Sender<BrokerFrame>,
}

impl BrokerControl {
	/// Inject the termination command and await the broker's confirm.
	pub async fn terminate(&self) -> anyhow::Result<()> {
		let (confirm_tx, confirm_rx) = oneshot::channel();

		self.tx
			.send(BrokerFrame::Terminate { confirm: confirm_tx })
			.await
			.map_err(|_| anyhow!("task broker already stopped"))?;

		confirm_rx.await.map_err(|_| anyhow!("task broker exited without confirming"))
	}
}

pub struct TaskBroker;

impl TaskBroker {
	/// Spawn the broker task and hand out its three endpoints plus one
	/// worker socket per worker.
	pub fn spawn(
		worker_count: usize,
		ack_timeout: Duration,
	) -> (TaskProducer, Vec<WorkerSocket>, BrokerControl, JoinHandle<()>) {
		let (tx, rx) = mpsc::channel(BROKER_CHANNEL_CAPACITY);

		let sockets = (0..worker_count).map(|_| WorkerSocket { tx: tx.clone() }).collect();
		let producer = TaskProducer {
			tx: tx.clone(),
			ack_timeout,
		};
		let control = BrokerControl { tx };

		let handle = tokio::spawn(broker_loop(rx));

		(producer, sockets, control, handle)
	}
}

async fn broker_loop(mut rx: mpsc::Receiver<BrokerFrame>) {
	let mut queue: VecDeque<Delivery> = VecDeque::new();
	let mut pending_receipts: HashMap<u64, oneshot::Sender<()>> = HashMap::new();
	let mut next_id: u64 = 0;

	while let Some(frame) = rx.recv().await {
		match frame {
			BrokerFrame::Publish { task, accepted } => {
				next_id += 1;
				debug!(id = next_id, task = %task, "task queued");
				queue.push_back(Delivery { id: next_id, task });
				pending_receipts.insert(next_id, accepted);
			}
			BrokerFrame::Pull { reply } => {
				let _ = reply.send(queue.pop_front());
			}
			BrokerFrame::Receipt { id } => {
				if let Some(accepted) = pending_receipts.remove(&id) {
					let _ = accepted.send(());
				}
			}
			BrokerFrame::Done { id } => {
				debug!(id, "task completed");
				metrics::counter!("laplace_tasks_completed_total").increment(1);
			}
			BrokerFrame::Terminate { confirm } => {
				info!(queued = queue.len(), "task broker terminating");
				let _ = confirm.send(());
				break;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const WAIT: Duration = Duration::from_millis(200);

	#[tokio::test]
	async fn published_task_arrives_at_exactly_one_worker() {
		let (producer, sockets, _control, _handle) = TaskBroker::spawn(3, Duration::from_secs(1));

		let publish = tokio::spawn(async move { producer.publish("healthTask~room1".to_string()).await });

		// Give the publish a moment to enqueue.
		tokio::time::sleep(Duration::from_millis(20)).await;

		let mut seen = Vec::new();
		for socket in &sockets {
			if let Some(delivery) = socket.try_recv(WAIT).await.unwrap() {
				socket.receipt(delivery.id).await;
				socket.done(delivery.id).await;
				seen.push(delivery.task);
			}
		}

		assert_eq!(seen, vec!["healthTask~room1".to_string()]);
		publish.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn publish_times_out_without_workers() {
		let (producer, _sockets, _control, _handle) = TaskBroker::spawn(0, Duration::from_millis(50));

		let err = producer.publish("healthTask~room1".to_string()).await.unwrap_err();
		assert!(err.to_string().contains("accepted"));
	}

	#[tokio::test]
	async fn empty_queue_pull_returns_none() {
		let (_producer, sockets, _control, _handle) = TaskBroker::spawn(1, Duration::from_secs(1));
		assert!(sockets[0].try_recv(WAIT).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn terminate_confirms_and_stops_the_fabric() {
		let (producer, sockets, control, handle) = TaskBroker::spawn(1, Duration::from_millis(50));

		control.terminate().await.unwrap();
		handle.await.unwrap();

		assert!(producer.publish("x".to_string()).await.is_err());
		assert!(sockets[0].try_recv(WAIT).await.is_err());
	}

	#[tokio::test]
	async fn deliveries_are_fifo() {
		let (producer, sockets, _control, _handle) = TaskBroker::spawn(1, Duration::from_secs(1));
		let socket = &sockets[0];

		for task in ["a", "b", "c"] {
			let producer = producer.clone();
			let task = task.to_string();
			tokio::spawn(async move { producer.publish(task).await });
			// Serialize the publishes so the queue order is deterministic.
			tokio::time::sleep(Duration::from_millis(10)).await;
		}

		let mut order = Vec::new();
		for _ in 0..3 {
			let delivery = socket.try_recv(WAIT).await.unwrap().unwrap();
			socket.receipt(delivery.id).await;
			order.push(delivery.task);
		}

		assert_eq!(order, vec!["a", "b", "c"]);
	}
}
