#![forbid(unsafe_code)]

use std::collections::HashSet;

use bytes::Bytes;
use relay_domain::UserId;
use relay_protocol::{Response, encode_frame};
use tracing::{debug, warn};

use crate::server::registry::{Presence, UserRegistry};

/// Outcome of pushing one document to one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
	/// Queued on the recipient's connection.
	Delivered,
	/// Recipient has no live connection.
	Offline,
	/// Recipient is online but the frame could not be queued.
	Dropped,
}

impl Delivery {
	fn as_str(self) -> &'static str {
		match self {
			Delivery::Delivered => "delivered",
			Delivery::Offline => "offline",
			Delivery::Dropped => "dropped",
		}
	}
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
	pub delivered: usize,
	pub offline: usize,
	pub dropped: usize,
}

impl DeliveryReport {
	fn record(&mut self, outcome: Delivery) {
		match outcome {
			Delivery::Delivered => self.delivered += 1,
			Delivery::Offline => self.offline += 1,
			Delivery::Dropped => self.dropped += 1,
		}
	}
}

/// Fire-and-forget delivery to other users' connections.
///
/// Offline recipients and full queues are normal outcomes, never errors; no
/// document is held for a user who is not connected.
#[derive(Debug, Clone)]
pub struct MessageRouter {
	registry: UserRegistry,
	max_frame_bytes: usize,
}

impl MessageRouter {
	pub fn new(registry: UserRegistry, max_frame_bytes: usize) -> Self {
		Self {
			registry,
			max_frame_bytes,
		}
	}

	pub async fn deliver(&self, user: UserId, doc: &Response) -> Delivery {
		let Some(frame) = self.encode(doc) else {
			return record(Delivery::Dropped);
		};
		self.deliver_frame(user, frame, &doc.action).await
	}

	/// Deliver one document to each user independently; duplicates are sent once.
	pub async fn deliver_many<I>(&self, users: I, doc: &Response) -> DeliveryReport
	where
		I: IntoIterator<Item = UserId>,
	{
		self.deliver_many_except(users, None, doc).await
	}

	/// Like [`MessageRouter::deliver_many`], skipping `except` (usually the sender).
	pub async fn deliver_many_except<I>(&self, users: I, except: Option<UserId>, doc: &Response) -> DeliveryReport
	where
		I: IntoIterator<Item = UserId>,
	{
		let mut report = DeliveryReport::default();
		let mut seen = HashSet::new();
		let recipients: Vec<UserId> = users
			.into_iter()
			.filter(|u| Some(*u) != except && seen.insert(*u))
			.collect();
		if recipients.is_empty() {
			return report;
		}

		let Some(frame) = self.encode(doc) else {
			for _ in &recipients {
				report.record(record(Delivery::Dropped));
			}
			return report;
		};

		for user in recipients {
			report.record(self.deliver_frame(user, frame.clone(), &doc.action).await);
		}
		report
	}

	fn encode(&self, doc: &Response) -> Option<Bytes> {
		match encode_frame(doc, self.max_frame_bytes) {
			Ok(frame) => Some(Bytes::from(frame)),
			Err(e) => {
				warn!(action = %doc.action, error = %e, "failed to encode delivery");
				None
			}
		}
	}

	async fn deliver_frame(&self, user: UserId, frame: Bytes, action: &str) -> Delivery {
		let handle = match self.registry.get(user).await {
			Presence::Online(handle) => handle,
			Presence::Offline => {
				debug!(user_id = %user, %action, "recipient offline");
				return record(Delivery::Offline);
			}
		};

		match handle.try_enqueue(frame) {
			Ok(()) => record(Delivery::Delivered),
			Err(e) => {
				warn!(user_id = %user, conn_id = %handle.conn_id(), %action, error = %e, "delivery dropped");
				record(Delivery::Dropped)
			}
		}
	}
}

fn record(outcome: Delivery) -> Delivery {
	metrics::counter!("relay_server_deliveries_total", "outcome" => outcome.as_str()).increment(1);
	outcome
}
