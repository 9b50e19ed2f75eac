#![forbid(unsafe_code)]

//! Durable chat state: accounts, direct messages, friendships and groups.
//!
//! The relay core never touches this; the business handlers do.

pub mod memory;
pub mod sqlite;

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use relay_domain::{GroupId, UserId};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Messages returned by a direct-history query.
pub const DIRECT_HISTORY_LIMIT: usize = 20;

/// Messages returned by a group-history query.
pub const GROUP_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("username already taken")]
	UsernameTaken,

	#[error("no such user: {0}")]
	UnknownUser(UserId),

	#[error("no such group: {0}")]
	UnknownGroup(GroupId),

	#[error("a friendship or pending request already exists")]
	AlreadyRelated,

	#[error("no pending friend request")]
	NoPendingRequest,

	#[error("user is already a member of the group")]
	AlreadyMember,

	#[error(transparent)]
	Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserSummary {
	#[serde(rename = "userID")]
	pub user_id: UserId,
	pub username: String,
	/// 1 while logged in, 0 otherwise.
	pub status: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectMessage {
	#[serde(rename = "senderID")]
	pub sender: UserId,
	#[serde(rename = "receiverID")]
	pub receiver: UserId,
	pub content: String,
	/// Unix milliseconds.
	#[serde(rename = "sentAt")]
	pub sent_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSummary {
	#[serde(rename = "groupID")]
	pub group_id: GroupId,
	#[serde(rename = "groupName")]
	pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupMember {
	#[serde(rename = "userID")]
	pub user_id: UserId,
	pub username: String,
	pub status: i64,
	/// Unix milliseconds.
	#[serde(rename = "joinedAt")]
	pub joined_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupMessage {
	#[serde(rename = "groupID")]
	pub group_id: GroupId,
	#[serde(rename = "senderID")]
	pub sender: UserId,
	#[serde(rename = "senderName")]
	pub sender_name: String,
	pub content: String,
	/// Unix milliseconds.
	#[serde(rename = "sentAt")]
	pub sent_at: i64,
}

/// Relationship of one user to another, as seen from the first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FriendStatus {
	None,
	/// The first user sent a request that is not yet accepted.
	OutgoingPending,
	Friends,
	/// The other user sent a request that is not yet accepted.
	IncomingPending,
}

impl FriendStatus {
	/// Numeric wire code: -1 none, 0 outgoing, 1 friends, 2 incoming.
	pub fn code(self) -> i64 {
		match self {
			FriendStatus::None => -1,
			FriendStatus::OutgoingPending => 0,
			FriendStatus::Friends => 1,
			FriendStatus::IncomingPending => 2,
		}
	}
}

#[async_trait]
pub trait ChatStore: Send + Sync {
	/// Create an account; fails with [`StoreError::UsernameTaken`] on a duplicate.
	async fn register_user(&self, username: &str, password: &str) -> StoreResult<UserId>;

	/// `Some(user)` when the credentials match.
	async fn verify_login(&self, username: &str, password: &str) -> StoreResult<Option<UserId>>;

	async fn set_online(&self, user: UserId, online: bool) -> StoreResult<()>;

	async fn username(&self, user: UserId) -> StoreResult<Option<String>>;

	/// Every account, ordered by id.
	async fn list_users(&self) -> StoreResult<Vec<UserSummary>>;

	async fn insert_message(&self, sender: UserId, receiver: UserId, content: &str) -> StoreResult<DirectMessage>;

	/// The newest `limit` messages exchanged by `a` and `b`, oldest first.
	async fn messages_between(&self, a: UserId, b: UserId, limit: usize) -> StoreResult<Vec<DirectMessage>>;

	async fn request_friendship(&self, from: UserId, to: UserId) -> StoreResult<()>;

	/// Accept the request `from` sent to `to`.
	async fn accept_friendship(&self, from: UserId, to: UserId) -> StoreResult<()>;

	async fn friend_status(&self, user: UserId, other: UserId) -> StoreResult<FriendStatus>;

	async fn friends_of(&self, user: UserId) -> StoreResult<Vec<UserSummary>>;

	/// Users with a pending request addressed to `user`.
	async fn incoming_requests(&self, user: UserId) -> StoreResult<Vec<UserSummary>>;

	/// Users other than `user` with no friendship or request in either direction.
	async fn non_friends(&self, user: UserId) -> StoreResult<Vec<UserSummary>>;

	/// Remove a friendship or pending request; `false` when none existed.
	async fn remove_friendship(&self, a: UserId, b: UserId) -> StoreResult<bool>;

	/// Create a group with `owner` as its first member.
	async fn create_group(&self, name: &str, owner: UserId) -> StoreResult<GroupId>;

	async fn add_group_member(&self, group: GroupId, user: UserId) -> StoreResult<()>;

	/// `false` when `user` was not a member.
	async fn remove_group_member(&self, group: GroupId, user: UserId) -> StoreResult<bool>;

	/// Members ordered by username.
	async fn group_members(&self, group: GroupId) -> StoreResult<Vec<GroupMember>>;

	async fn user_groups(&self, user: UserId) -> StoreResult<Vec<GroupSummary>>;

	async fn insert_group_message(&self, group: GroupId, sender: UserId, content: &str) -> StoreResult<GroupMessage>;

	/// The newest `limit` messages of `group`, oldest first.
	async fn group_messages(&self, group: GroupId, limit: usize) -> StoreResult<Vec<GroupMessage>>;
}

/// Unix milliseconds stamped on stored messages and memberships.
pub(crate) fn now_ms() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
		.unwrap_or(0)
}

/// Stored form of a password: base64 of its SHA-256 digest.
pub fn password_digest(password: &str) -> String {
	STANDARD.encode(Sha256::digest(password.as_bytes()))
}
