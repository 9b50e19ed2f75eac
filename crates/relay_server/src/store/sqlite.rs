#![forbid(unsafe_code)]

use std::str::FromStr;

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use relay_domain::{GroupId, UserId};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::store::{
	ChatStore, DirectMessage, FriendStatus, GroupMember, GroupMessage, GroupSummary, StoreError, StoreResult,
	UserSummary, now_ms, password_digest,
};

/// SQLite-backed store with embedded migrations.
#[derive(Debug, Clone)]
pub struct SqliteStore {
	pool: SqlitePool,
}

impl SqliteStore {
	/// Open (creating if missing) the database at `database_url` and migrate it.
	///
	/// In-memory URLs get a single long-lived connection so every query sees
	/// the same database.
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let options = SqliteConnectOptions::from_str(database_url)
			.with_context(|| format!("parse sqlite url {database_url}"))?
			.create_if_missing(true)
			.foreign_keys(true);

		let mut pool_options = SqlitePoolOptions::new();
		if database_url.contains(":memory:") || database_url.contains("mode=memory") {
			pool_options = pool_options.max_connections(1).idle_timeout(None).max_lifetime(None);
		}

		let pool = pool_options.connect_with(options).await.context("connect sqlite")?;
		sqlx::migrate!("migrations/sqlite")
			.run(&pool)
			.await
			.context("run sqlite migrations")?;

		info!(url = %database_url, "sqlite store ready");
		Ok(Self { pool })
	}

	async fn ensure_user(&self, user: UserId) -> StoreResult<()> {
		let found: Option<i64> = sqlx::query_scalar("SELECT id FROM users WHERE id = ?")
			.bind(user.get())
			.fetch_optional(&self.pool)
			.await
			.map_err(backend("select user"))?;
		found.map(|_| ()).ok_or(StoreError::UnknownUser(user))
	}

	async fn ensure_group(&self, group: GroupId) -> StoreResult<()> {
		let found: Option<i64> = sqlx::query_scalar("SELECT id FROM chat_groups WHERE id = ?")
			.bind(group.get())
			.fetch_optional(&self.pool)
			.await
			.map_err(backend("select group"))?;
		found.map(|_| ()).ok_or(StoreError::UnknownGroup(group))
	}

	async fn user_rows(&self, sql: &str, binds: &[i64]) -> StoreResult<Vec<UserSummary>> {
		let mut query = sqlx::query_as::<_, (i64, String, i64)>(sql);
		for b in binds {
			query = query.bind(*b);
		}
		let rows = query.fetch_all(&self.pool).await.map_err(backend("select users"))?;
		rows.into_iter()
			.map(|(id, username, online)| {
				Ok(UserSummary {
					user_id: user_id(id)?,
					username,
					status: online,
				})
			})
			.collect()
	}
}

fn backend(context: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
	move |e| StoreError::Backend(anyhow::Error::new(e).context(context))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
	matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn user_id(v: i64) -> StoreResult<UserId> {
	UserId::new(v).map_err(|e| StoreError::Backend(anyhow!(e).context("invalid user id in store")))
}

fn group_id(v: i64) -> StoreResult<GroupId> {
	GroupId::new(v).map_err(|e| StoreError::Backend(anyhow!(e).context("invalid group id in store")))
}

fn pair_key(a: UserId, b: UserId) -> (i64, i64) {
	if a <= b { (a.get(), b.get()) } else { (b.get(), a.get()) }
}

#[async_trait]
impl ChatStore for SqliteStore {
	async fn register_user(&self, username: &str, password: &str) -> StoreResult<UserId> {
		let res = sqlx::query("INSERT INTO users (username, password_digest, online, created_at) VALUES (?, ?, 0, ?)")
			.bind(username)
			.bind(password_digest(password))
			.bind(now_ms())
			.execute(&self.pool)
			.await;
		match res {
			Ok(done) => user_id(done.last_insert_rowid()),
			Err(e) if is_unique_violation(&e) => Err(StoreError::UsernameTaken),
			Err(e) => Err(backend("insert user")(e)),
		}
	}

	async fn verify_login(&self, username: &str, password: &str) -> StoreResult<Option<UserId>> {
		let row: Option<(i64, String)> = sqlx::query_as("SELECT id, password_digest FROM users WHERE username = ?")
			.bind(username)
			.fetch_optional(&self.pool)
			.await
			.map_err(backend("select credentials"))?;
		match row {
			Some((id, digest)) if digest == password_digest(password) => Ok(Some(user_id(id)?)),
			_ => Ok(None),
		}
	}

	async fn set_online(&self, user: UserId, online: bool) -> StoreResult<()> {
		let done = sqlx::query("UPDATE users SET online = ? WHERE id = ?")
			.bind(i64::from(online))
			.bind(user.get())
			.execute(&self.pool)
			.await
			.map_err(backend("update online status"))?;
		if done.rows_affected() == 0 {
			return Err(StoreError::UnknownUser(user));
		}
		Ok(())
	}

	async fn username(&self, user: UserId) -> StoreResult<Option<String>> {
		sqlx::query_scalar("SELECT username FROM users WHERE id = ?")
			.bind(user.get())
			.fetch_optional(&self.pool)
			.await
			.map_err(backend("select username"))
	}

	async fn list_users(&self) -> StoreResult<Vec<UserSummary>> {
		self.user_rows("SELECT id, username, online FROM users ORDER BY id", &[])
			.await
	}

	async fn insert_message(&self, sender: UserId, receiver: UserId, content: &str) -> StoreResult<DirectMessage> {
		self.ensure_user(sender).await?;
		self.ensure_user(receiver).await?;
		let sent_at = now_ms();
		sqlx::query("INSERT INTO messages (sender_id, receiver_id, content, sent_at) VALUES (?, ?, ?, ?)")
			.bind(sender.get())
			.bind(receiver.get())
			.bind(content)
			.bind(sent_at)
			.execute(&self.pool)
			.await
			.map_err(backend("insert message"))?;
		Ok(DirectMessage {
			sender,
			receiver,
			content: content.to_string(),
			sent_at,
		})
	}

	async fn messages_between(&self, a: UserId, b: UserId, limit: usize) -> StoreResult<Vec<DirectMessage>> {
		let rows: Vec<(i64, i64, String, i64)> = sqlx::query_as(
			"SELECT sender_id, receiver_id, content, sent_at FROM ( \
				SELECT id, sender_id, receiver_id, content, sent_at FROM messages \
				WHERE (sender_id = ? AND receiver_id = ?) OR (sender_id = ? AND receiver_id = ?) \
				ORDER BY id DESC LIMIT ? \
			) ORDER BY id ASC",
		)
		.bind(a.get())
		.bind(b.get())
		.bind(b.get())
		.bind(a.get())
		.bind(limit as i64)
		.fetch_all(&self.pool)
		.await
		.map_err(backend("select messages"))?;

		rows.into_iter()
			.map(|(sender, receiver, content, sent_at)| {
				Ok(DirectMessage {
					sender: user_id(sender)?,
					receiver: user_id(receiver)?,
					content,
					sent_at,
				})
			})
			.collect()
	}

	async fn request_friendship(&self, from: UserId, to: UserId) -> StoreResult<()> {
		self.ensure_user(from).await?;
		self.ensure_user(to).await?;
		let (low, high) = pair_key(from, to);
		let res = sqlx::query(
			"INSERT INTO friendships (user_low, user_high, requester, accepted, created_at) VALUES (?, ?, ?, 0, ?)",
		)
		.bind(low)
		.bind(high)
		.bind(from.get())
		.bind(now_ms())
		.execute(&self.pool)
		.await;
		match res {
			Ok(_) => Ok(()),
			Err(e) if is_unique_violation(&e) => Err(StoreError::AlreadyRelated),
			Err(e) => Err(backend("insert friendship")(e)),
		}
	}

	async fn accept_friendship(&self, from: UserId, to: UserId) -> StoreResult<()> {
		let (low, high) = pair_key(from, to);
		let done = sqlx::query(
			"UPDATE friendships SET accepted = 1 \
			WHERE user_low = ? AND user_high = ? AND requester = ? AND accepted = 0",
		)
		.bind(low)
		.bind(high)
		.bind(from.get())
		.execute(&self.pool)
		.await
		.map_err(backend("accept friendship"))?;
		if done.rows_affected() == 0 {
			return Err(StoreError::NoPendingRequest);
		}
		Ok(())
	}

	async fn friend_status(&self, user: UserId, other: UserId) -> StoreResult<FriendStatus> {
		let (low, high) = pair_key(user, other);
		let row: Option<(i64, i64)> =
			sqlx::query_as("SELECT requester, accepted FROM friendships WHERE user_low = ? AND user_high = ?")
				.bind(low)
				.bind(high)
				.fetch_optional(&self.pool)
				.await
				.map_err(backend("select friendship"))?;
		Ok(match row {
			None => FriendStatus::None,
			Some((_, accepted)) if accepted != 0 => FriendStatus::Friends,
			Some((requester, _)) if requester == user.get() => FriendStatus::OutgoingPending,
			Some(_) => FriendStatus::IncomingPending,
		})
	}

	async fn friends_of(&self, user: UserId) -> StoreResult<Vec<UserSummary>> {
		let id = user.get();
		self.user_rows(
			"SELECT u.id, u.username, u.online FROM friendships f \
			JOIN users u ON u.id = CASE WHEN f.user_low = ? THEN f.user_high ELSE f.user_low END \
			WHERE (f.user_low = ? OR f.user_high = ?) AND f.accepted = 1 ORDER BY u.id",
			&[id, id, id],
		)
		.await
	}

	async fn incoming_requests(&self, user: UserId) -> StoreResult<Vec<UserSummary>> {
		let id = user.get();
		self.user_rows(
			"SELECT u.id, u.username, u.online FROM friendships f \
			JOIN users u ON u.id = f.requester \
			WHERE (f.user_low = ? OR f.user_high = ?) AND f.accepted = 0 AND f.requester != ? ORDER BY u.id",
			&[id, id, id],
		)
		.await
	}

	async fn non_friends(&self, user: UserId) -> StoreResult<Vec<UserSummary>> {
		let id = user.get();
		self.user_rows(
			"SELECT u.id, u.username, u.online FROM users u \
			WHERE u.id != ? AND NOT EXISTS ( \
				SELECT 1 FROM friendships f \
				WHERE (f.user_low = u.id AND f.user_high = ?) OR (f.user_high = u.id AND f.user_low = ?) \
			) ORDER BY u.id",
			&[id, id, id],
		)
		.await
	}

	async fn remove_friendship(&self, a: UserId, b: UserId) -> StoreResult<bool> {
		let (low, high) = pair_key(a, b);
		let done = sqlx::query("DELETE FROM friendships WHERE user_low = ? AND user_high = ?")
			.bind(low)
			.bind(high)
			.execute(&self.pool)
			.await
			.map_err(backend("delete friendship"))?;
		Ok(done.rows_affected() > 0)
	}

	async fn create_group(&self, name: &str, owner: UserId) -> StoreResult<GroupId> {
		self.ensure_user(owner).await?;
		let now = now_ms();
		let mut tx = self.pool.begin().await.map_err(backend("begin create group"))?;
		let done = sqlx::query("INSERT INTO chat_groups (name, created_at) VALUES (?, ?)")
			.bind(name)
			.bind(now)
			.execute(&mut *tx)
			.await
			.map_err(backend("insert group"))?;
		let id = group_id(done.last_insert_rowid())?;
		sqlx::query("INSERT INTO group_members (group_id, user_id, joined_at) VALUES (?, ?, ?)")
			.bind(id.get())
			.bind(owner.get())
			.bind(now)
			.execute(&mut *tx)
			.await
			.map_err(backend("insert group owner"))?;
		tx.commit().await.map_err(backend("commit create group"))?;
		Ok(id)
	}

	async fn add_group_member(&self, group: GroupId, user: UserId) -> StoreResult<()> {
		self.ensure_user(user).await?;
		self.ensure_group(group).await?;
		let res = sqlx::query("INSERT INTO group_members (group_id, user_id, joined_at) VALUES (?, ?, ?)")
			.bind(group.get())
			.bind(user.get())
			.bind(now_ms())
			.execute(&self.pool)
			.await;
		match res {
			Ok(_) => Ok(()),
			Err(e) if is_unique_violation(&e) => Err(StoreError::AlreadyMember),
			Err(e) => Err(backend("insert group member")(e)),
		}
	}

	async fn remove_group_member(&self, group: GroupId, user: UserId) -> StoreResult<bool> {
		self.ensure_group(group).await?;
		let done = sqlx::query("DELETE FROM group_members WHERE group_id = ? AND user_id = ?")
			.bind(group.get())
			.bind(user.get())
			.execute(&self.pool)
			.await
			.map_err(backend("delete group member"))?;
		Ok(done.rows_affected() > 0)
	}

	async fn group_members(&self, group: GroupId) -> StoreResult<Vec<GroupMember>> {
		self.ensure_group(group).await?;
		let rows: Vec<(i64, String, i64, i64)> = sqlx::query_as(
			"SELECT u.id, u.username, u.online, gm.joined_at FROM group_members gm \
			JOIN users u ON u.id = gm.user_id WHERE gm.group_id = ? ORDER BY u.username ASC",
		)
		.bind(group.get())
		.fetch_all(&self.pool)
		.await
		.map_err(backend("select group members"))?;

		rows.into_iter()
			.map(|(id, username, online, joined_at)| {
				Ok(GroupMember {
					user_id: user_id(id)?,
					username,
					status: online,
					joined_at,
				})
			})
			.collect()
	}

	async fn user_groups(&self, user: UserId) -> StoreResult<Vec<GroupSummary>> {
		let rows: Vec<(i64, String)> = sqlx::query_as(
			"SELECT g.id, g.name FROM chat_groups g \
			JOIN group_members gm ON gm.group_id = g.id WHERE gm.user_id = ? ORDER BY g.id",
		)
		.bind(user.get())
		.fetch_all(&self.pool)
		.await
		.map_err(backend("select user groups"))?;

		rows.into_iter()
			.map(|(id, name)| {
				Ok(GroupSummary {
					group_id: group_id(id)?,
					name,
				})
			})
			.collect()
	}

	async fn insert_group_message(&self, group: GroupId, sender: UserId, content: &str) -> StoreResult<GroupMessage> {
		let sender_name = self.username(sender).await?.ok_or(StoreError::UnknownUser(sender))?;
		self.ensure_group(group).await?;
		let sent_at = now_ms();
		sqlx::query("INSERT INTO group_messages (group_id, sender_id, content, sent_at) VALUES (?, ?, ?, ?)")
			.bind(group.get())
			.bind(sender.get())
			.bind(content)
			.bind(sent_at)
			.execute(&self.pool)
			.await
			.map_err(backend("insert group message"))?;
		Ok(GroupMessage {
			group_id: group,
			sender,
			sender_name,
			content: content.to_string(),
			sent_at,
		})
	}

	async fn group_messages(&self, group: GroupId, limit: usize) -> StoreResult<Vec<GroupMessage>> {
		self.ensure_group(group).await?;
		let rows: Vec<(i64, String, String, i64)> = sqlx::query_as(
			"SELECT m.sender_id, u.username, m.content, m.sent_at FROM ( \
				SELECT id, sender_id, content, sent_at FROM group_messages \
				WHERE group_id = ? ORDER BY id DESC LIMIT ? \
			) m JOIN users u ON u.id = m.sender_id ORDER BY m.id ASC",
		)
		.bind(group.get())
		.bind(limit as i64)
		.fetch_all(&self.pool)
		.await
		.map_err(backend("select group messages"))?;

		rows.into_iter()
			.map(|(sender, sender_name, content, sent_at)| {
				Ok(GroupMessage {
					group_id: group,
					sender: user_id(sender)?,
					sender_name,
					content,
					sent_at,
				})
			})
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	async fn store() -> SqliteStore {
		SqliteStore::connect("sqlite::memory:").await.expect("in-memory sqlite")
	}

	#[tokio::test]
	async fn accounts_round_trip_through_sqlite() {
		let store = store().await;
		let alice = store.register_user("alice", "pw").await.expect("register");
		assert!(matches!(
			store.register_user("alice", "pw").await,
			Err(StoreError::UsernameTaken)
		));

		assert_eq!(store.verify_login("alice", "pw").await.unwrap(), Some(alice));
		assert_eq!(store.verify_login("alice", "nope").await.unwrap(), None);

		store.set_online(alice, true).await.unwrap();
		let users = store.list_users().await.unwrap();
		assert_eq!(users.len(), 1);
		assert_eq!(users[0].status, 1);

		let ghost = UserId::new(404).unwrap();
		assert!(matches!(
			store.set_online(ghost, true).await,
			Err(StoreError::UnknownUser(_))
		));
	}

	#[tokio::test]
	async fn friendships_and_history() {
		let store = store().await;
		let a = store.register_user("a", "pw").await.unwrap();
		let b = store.register_user("b", "pw").await.unwrap();
		let c = store.register_user("c", "pw").await.unwrap();

		store.request_friendship(b, a).await.unwrap();
		assert_eq!(store.friend_status(a, b).await.unwrap(), FriendStatus::IncomingPending);
		assert!(matches!(
			store.request_friendship(a, b).await,
			Err(StoreError::AlreadyRelated)
		));
		assert_eq!(store.incoming_requests(a).await.unwrap()[0].user_id, b);
		assert_eq!(
			store.non_friends(a).await.unwrap().into_iter().map(|u| u.user_id).collect::<Vec<_>>(),
			vec![c]
		);

		store.accept_friendship(b, a).await.unwrap();
		assert_eq!(store.friends_of(a).await.unwrap()[0].user_id, b);

		for i in 0..3 {
			store.insert_message(a, b, &format!("m{i}")).await.unwrap();
		}
		let last_two = store.messages_between(b, a, 2).await.unwrap();
		assert_eq!(
			last_two.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
			vec!["m1", "m2"]
		);
	}

	#[tokio::test]
	async fn groups_round_trip_through_sqlite() {
		let store = store().await;
		let owner = store.register_user("owner", "pw").await.unwrap();
		let member = store.register_user("member", "pw").await.unwrap();

		let group = store.create_group("crew", owner).await.unwrap();
		store.add_group_member(group, member).await.unwrap();
		assert!(matches!(
			store.add_group_member(group, member).await,
			Err(StoreError::AlreadyMember)
		));
		assert_eq!(store.group_members(group).await.unwrap().len(), 2);

		let sent = store.insert_group_message(group, member, "hi").await.unwrap();
		assert_eq!(sent.sender_name, "member");
		assert_eq!(store.group_messages(group, 50).await.unwrap(), vec![sent]);

		assert!(store.remove_group_member(group, member).await.unwrap());
		assert_eq!(store.user_groups(owner).await.unwrap()[0].name, "crew");
		assert!(store.user_groups(member).await.unwrap().is_empty());
	}
}
