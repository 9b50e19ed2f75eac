#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use relay_domain::{GroupId, UserId};
use tokio::sync::RwLock;

use crate::store::{
	ChatStore, DirectMessage, FriendStatus, GroupMember, GroupMessage, GroupSummary, StoreError, StoreResult,
	UserSummary, now_ms, password_digest,
};

#[derive(Debug, Clone)]
struct Account {
	username: String,
	password_digest: String,
	online: bool,
}

#[derive(Debug, Clone, Copy)]
struct Friendship {
	requester: UserId,
	accepted: bool,
}

#[derive(Debug, Clone)]
struct Group {
	name: String,
	/// member -> joined_at (unix ms)
	members: BTreeMap<UserId, i64>,
}

#[derive(Debug, Default)]
struct Inner {
	next_user_id: i64,
	next_group_id: i64,
	accounts: BTreeMap<UserId, Account>,
	by_username: HashMap<String, UserId>,
	messages: Vec<DirectMessage>,
	/// keyed by (lower id, higher id)
	friendships: HashMap<(UserId, UserId), Friendship>,
	groups: BTreeMap<GroupId, Group>,
	group_messages: Vec<GroupMessage>,
}

impl Inner {
	fn summary(&self, user: UserId) -> Option<UserSummary> {
		self.accounts.get(&user).map(|a| UserSummary {
			user_id: user,
			username: a.username.clone(),
			status: i64::from(a.online),
		})
	}

	fn require_user(&self, user: UserId) -> StoreResult<&Account> {
		self.accounts.get(&user).ok_or(StoreError::UnknownUser(user))
	}

	fn require_group_mut(&mut self, group: GroupId) -> StoreResult<&mut Group> {
		self.groups.get_mut(&group).ok_or(StoreError::UnknownGroup(group))
	}

	fn summaries<I: IntoIterator<Item = UserId>>(&self, users: I) -> Vec<UserSummary> {
		let mut out: Vec<UserSummary> = users.into_iter().filter_map(|u| self.summary(u)).collect();
		out.sort_by_key(|s| s.user_id);
		out
	}
}

fn pair_key(a: UserId, b: UserId) -> (UserId, UserId) {
	if a <= b { (a, b) } else { (b, a) }
}

fn other_side(key: (UserId, UserId), user: UserId) -> Option<UserId> {
	if key.0 == user {
		Some(key.1)
	} else if key.1 == user {
		Some(key.0)
	} else {
		None
	}
}

/// Newest `limit` items of an oldest-first list, still oldest first.
fn tail<T: Clone>(items: Vec<&T>, limit: usize) -> Vec<T> {
	let skip = items.len().saturating_sub(limit);
	items.into_iter().skip(skip).cloned().collect()
}

/// Process-local store; state is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
	inner: RwLock<Inner>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl ChatStore for MemoryStore {
	async fn register_user(&self, username: &str, password: &str) -> StoreResult<UserId> {
		let mut inner = self.inner.write().await;
		if inner.by_username.contains_key(username) {
			return Err(StoreError::UsernameTaken);
		}
		inner.next_user_id += 1;
		let id = UserId::new(inner.next_user_id).map_err(|e| StoreError::Backend(e.into()))?;
		inner.accounts.insert(
			id,
			Account {
				username: username.to_string(),
				password_digest: password_digest(password),
				online: false,
			},
		);
		inner.by_username.insert(username.to_string(), id);
		Ok(id)
	}

	async fn verify_login(&self, username: &str, password: &str) -> StoreResult<Option<UserId>> {
		let inner = self.inner.read().await;
		let Some(id) = inner.by_username.get(username).copied() else {
			return Ok(None);
		};
		let account = inner.require_user(id)?;
		Ok((account.password_digest == password_digest(password)).then_some(id))
	}

	async fn set_online(&self, user: UserId, online: bool) -> StoreResult<()> {
		let mut inner = self.inner.write().await;
		let account = inner.accounts.get_mut(&user).ok_or(StoreError::UnknownUser(user))?;
		account.online = online;
		Ok(())
	}

	async fn username(&self, user: UserId) -> StoreResult<Option<String>> {
		Ok(self.inner.read().await.accounts.get(&user).map(|a| a.username.clone()))
	}

	async fn list_users(&self) -> StoreResult<Vec<UserSummary>> {
		let inner = self.inner.read().await;
		Ok(inner.summaries(inner.accounts.keys().copied()))
	}

	async fn insert_message(&self, sender: UserId, receiver: UserId, content: &str) -> StoreResult<DirectMessage> {
		let mut inner = self.inner.write().await;
		inner.require_user(sender)?;
		inner.require_user(receiver)?;
		let msg = DirectMessage {
			sender,
			receiver,
			content: content.to_string(),
			sent_at: now_ms(),
		};
		inner.messages.push(msg.clone());
		Ok(msg)
	}

	async fn messages_between(&self, a: UserId, b: UserId, limit: usize) -> StoreResult<Vec<DirectMessage>> {
		let inner = self.inner.read().await;
		let matching: Vec<&DirectMessage> = inner
			.messages
			.iter()
			.filter(|m| (m.sender == a && m.receiver == b) || (m.sender == b && m.receiver == a))
			.collect();
		Ok(tail(matching, limit))
	}

	async fn request_friendship(&self, from: UserId, to: UserId) -> StoreResult<()> {
		let mut inner = self.inner.write().await;
		inner.require_user(from)?;
		inner.require_user(to)?;
		let key = pair_key(from, to);
		if inner.friendships.contains_key(&key) {
			return Err(StoreError::AlreadyRelated);
		}
		inner.friendships.insert(
			key,
			Friendship {
				requester: from,
				accepted: false,
			},
		);
		Ok(())
	}

	async fn accept_friendship(&self, from: UserId, to: UserId) -> StoreResult<()> {
		let mut inner = self.inner.write().await;
		match inner.friendships.get_mut(&pair_key(from, to)) {
			Some(f) if !f.accepted && f.requester == from => {
				f.accepted = true;
				Ok(())
			}
			_ => Err(StoreError::NoPendingRequest),
		}
	}

	async fn friend_status(&self, user: UserId, other: UserId) -> StoreResult<FriendStatus> {
		let inner = self.inner.read().await;
		Ok(match inner.friendships.get(&pair_key(user, other)) {
			None => FriendStatus::None,
			Some(f) if f.accepted => FriendStatus::Friends,
			Some(f) if f.requester == user => FriendStatus::OutgoingPending,
			Some(_) => FriendStatus::IncomingPending,
		})
	}

	async fn friends_of(&self, user: UserId) -> StoreResult<Vec<UserSummary>> {
		let inner = self.inner.read().await;
		let friends = inner
			.friendships
			.iter()
			.filter(|(_, f)| f.accepted)
			.filter_map(|(key, _)| other_side(*key, user));
		Ok(inner.summaries(friends))
	}

	async fn incoming_requests(&self, user: UserId) -> StoreResult<Vec<UserSummary>> {
		let inner = self.inner.read().await;
		let requesters = inner
			.friendships
			.iter()
			.filter(|(_, f)| !f.accepted && f.requester != user)
			.filter_map(|(key, _)| other_side(*key, user));
		Ok(inner.summaries(requesters))
	}

	async fn non_friends(&self, user: UserId) -> StoreResult<Vec<UserSummary>> {
		let inner = self.inner.read().await;
		let others = inner
			.accounts
			.keys()
			.copied()
			.filter(|other| *other != user && !inner.friendships.contains_key(&pair_key(user, *other)));
		Ok(inner.summaries(others))
	}

	async fn remove_friendship(&self, a: UserId, b: UserId) -> StoreResult<bool> {
		Ok(self.inner.write().await.friendships.remove(&pair_key(a, b)).is_some())
	}

	async fn create_group(&self, name: &str, owner: UserId) -> StoreResult<GroupId> {
		let mut inner = self.inner.write().await;
		inner.require_user(owner)?;
		inner.next_group_id += 1;
		let id = GroupId::new(inner.next_group_id).map_err(|e| StoreError::Backend(e.into()))?;
		let mut members = BTreeMap::new();
		members.insert(owner, now_ms());
		inner.groups.insert(
			id,
			Group {
				name: name.to_string(),
				members,
			},
		);
		Ok(id)
	}

	async fn add_group_member(&self, group: GroupId, user: UserId) -> StoreResult<()> {
		let mut inner = self.inner.write().await;
		inner.require_user(user)?;
		let group = inner.require_group_mut(group)?;
		if group.members.contains_key(&user) {
			return Err(StoreError::AlreadyMember);
		}
		group.members.insert(user, now_ms());
		Ok(())
	}

	async fn remove_group_member(&self, group: GroupId, user: UserId) -> StoreResult<bool> {
		let mut inner = self.inner.write().await;
		Ok(inner.require_group_mut(group)?.members.remove(&user).is_some())
	}

	async fn group_members(&self, group: GroupId) -> StoreResult<Vec<GroupMember>> {
		let inner = self.inner.read().await;
		let g = inner.groups.get(&group).ok_or(StoreError::UnknownGroup(group))?;
		let mut members: Vec<GroupMember> = g
			.members
			.iter()
			.filter_map(|(user, joined_at)| {
				inner.summary(*user).map(|s| GroupMember {
					user_id: s.user_id,
					username: s.username,
					status: s.status,
					joined_at: *joined_at,
				})
			})
			.collect();
		members.sort_by(|a, b| a.username.cmp(&b.username));
		Ok(members)
	}

	async fn user_groups(&self, user: UserId) -> StoreResult<Vec<GroupSummary>> {
		let inner = self.inner.read().await;
		Ok(inner
			.groups
			.iter()
			.filter(|(_, g)| g.members.contains_key(&user))
			.map(|(id, g)| GroupSummary {
				group_id: *id,
				name: g.name.clone(),
			})
			.collect())
	}

	async fn insert_group_message(&self, group: GroupId, sender: UserId, content: &str) -> StoreResult<GroupMessage> {
		let mut inner = self.inner.write().await;
		let sender_name = inner.require_user(sender)?.username.clone();
		inner.require_group_mut(group)?;
		let msg = GroupMessage {
			group_id: group,
			sender,
			sender_name,
			content: content.to_string(),
			sent_at: now_ms(),
		};
		inner.group_messages.push(msg.clone());
		Ok(msg)
	}

	async fn group_messages(&self, group: GroupId, limit: usize) -> StoreResult<Vec<GroupMessage>> {
		let inner = self.inner.read().await;
		if !inner.groups.contains_key(&group) {
			return Err(StoreError::UnknownGroup(group));
		}
		let matching: Vec<&GroupMessage> = inner.group_messages.iter().filter(|m| m.group_id == group).collect();
		Ok(tail(matching, limit))
	}
}
