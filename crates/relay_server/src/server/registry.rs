#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use relay_domain::{ConnId, UserId};
use tokio::sync::RwLock;

use crate::server::connection::ConnectionHandle;

/// Result of looking a user up in the registry.
#[derive(Debug, Clone)]
pub enum Presence {
	Online(ConnectionHandle),
	Offline,
}

impl Presence {
	pub fn is_online(&self) -> bool {
		matches!(self, Presence::Online(_))
	}

	pub fn into_handle(self) -> Option<ConnectionHandle> {
		match self {
			Presence::Online(handle) => Some(handle),
			Presence::Offline => None,
		}
	}
}

/// Maps a logged-in user to the connection currently representing them.
///
/// At most one handle per user: a later `put` replaces the earlier entry
/// without closing the earlier connection. Every operation takes the lock
/// once, so readers never observe a half-applied change.
#[derive(Debug, Clone, Default)]
pub struct UserRegistry {
	inner: Arc<RwLock<HashMap<UserId, ConnectionHandle>>>,
}

impl UserRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Bind `user` to `handle`, returning the handle it replaced.
	pub async fn put(&self, user: UserId, handle: ConnectionHandle) -> Option<ConnectionHandle> {
		self.inner.write().await.insert(user, handle)
	}

	pub async fn get(&self, user: UserId) -> Presence {
		match self.inner.read().await.get(&user) {
			Some(handle) => Presence::Online(handle.clone()),
			None => Presence::Offline,
		}
	}

	/// Remove `user` only if it is still bound to `handle`'s connection.
	///
	/// A stale connection cannot evict a newer login for the same user.
	pub async fn remove(&self, user: UserId, handle: &ConnectionHandle) -> bool {
		let mut map = self.inner.write().await;
		match map.get(&user) {
			Some(current) if current.conn_id() == handle.conn_id() => {
				map.remove(&user);
				true
			}
			_ => false,
		}
	}

	/// Drop every entry owned by `conn_id`; returns the users released.
	pub async fn remove_by_handle(&self, conn_id: ConnId) -> Vec<UserId> {
		let mut map = self.inner.write().await;
		let mut released = Vec::new();
		map.retain(|user, handle| {
			if handle.conn_id() == conn_id {
				released.push(*user);
				false
			} else {
				true
			}
		});
		released.sort_unstable();
		released
	}

	/// Snapshot of online users, ascending.
	pub async fn online_users(&self) -> Vec<UserId> {
		let mut users: Vec<UserId> = self.inner.read().await.keys().copied().collect();
		users.sort_unstable();
		users
	}

	pub async fn len(&self) -> usize {
		self.inner.read().await.len()
	}
}
