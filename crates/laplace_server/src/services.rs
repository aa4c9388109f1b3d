#![forbid(unsafe_code)]

use std::sync::Arc;

use laplace_store::{AuthStore, Kv, RoomsStore};

use crate::config::ServerConfig;
use crate::engine::EngineBridge;
use crate::tasks::broker::TaskProducer;

/// Process-scope record built once by the startup sequence and threaded
/// through every subsystem. Write-once; read-only in steady state.
pub struct Services {
	pub cfg: ServerConfig,
	pub kv: Arc<dyn Kv>,
	pub auth: AuthStore,
	pub rooms: RoomsStore,
	pub engine: EngineBridge,
	pub producer: TaskProducer,
}
