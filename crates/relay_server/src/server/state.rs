#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use relay_domain::ConnId;
use tokio::sync::Mutex;

use crate::server::connection::{ConnectionHandle, ConnectionSettings};
use crate::server::dispatch::HandlerTable;
use crate::server::registry::UserRegistry;
use crate::server::router::MessageRouter;

/// Everything a session needs, constructed once at startup.
#[derive(Debug, Clone)]
pub struct ServerState {
	pub registry: UserRegistry,
	pub router: MessageRouter,
	pub handlers: Arc<HandlerTable>,
	pub connections: ConnectionSet,
	pub settings: ConnectionSettings,
}

impl ServerState {
	pub fn new(handlers: HandlerTable, settings: ConnectionSettings) -> Self {
		let registry = UserRegistry::new();
		let router = MessageRouter::new(registry.clone(), settings.max_frame_bytes);
		Self {
			registry,
			router,
			handlers: Arc::new(handlers),
			connections: ConnectionSet::default(),
			settings,
		}
	}
}

/// Open connections, keyed by id. Sessions add themselves on open and remove
/// themselves on close.
#[derive(Debug, Clone, Default)]
pub struct ConnectionSet {
	inner: Arc<Mutex<HashMap<ConnId, ConnectionHandle>>>,
}

impl ConnectionSet {
	pub async fn insert(&self, handle: ConnectionHandle) {
		self.inner.lock().await.insert(handle.conn_id(), handle);
	}

	pub async fn remove(&self, conn_id: ConnId) -> Option<ConnectionHandle> {
		self.inner.lock().await.remove(&conn_id)
	}

	pub async fn len(&self) -> usize {
		self.inner.lock().await.len()
	}

	/// Ask every open session to close; returns how many were signalled.
	pub async fn close_all(&self) -> usize {
		let conns = self.inner.lock().await;
		for handle in conns.values() {
			handle.close();
		}
		conns.len()
	}

	/// Wait until every session has deregistered or `timeout` elapses.
	///
	/// Returns `true` when the set drained in time.
	pub async fn wait_idle(&self, timeout: Duration) -> bool {
		let deadline = Instant::now() + timeout;
		loop {
			if self.len().await == 0 {
				return true;
			}
			if Instant::now() >= deadline {
				return false;
			}
			tokio::time::sleep(Duration::from_millis(25)).await;
		}
	}
}
