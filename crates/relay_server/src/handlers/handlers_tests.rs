#![forbid(unsafe_code)]

use std::sync::Arc;

use bytes::Bytes;
use relay_domain::UserId;
use relay_protocol::{DEFAULT_MAX_FRAME_SIZE, Request, Response, decode_frame};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::handlers::register_all;
use crate::server::connection::detached_handle;
use crate::server::dispatch::{HandlerContext, HandlerTable};
use crate::server::registry::UserRegistry;
use crate::server::router::MessageRouter;
use crate::store::{ChatStore, MemoryStore};

struct Harness {
	table: HandlerTable,
	registry: UserRegistry,
	router: MessageRouter,
}

struct Client {
	ctx: HandlerContext,
	rx: mpsc::Receiver<Bytes>,
}

impl Harness {
	fn new() -> Self {
		let store: Arc<dyn ChatStore> = Arc::new(MemoryStore::new());
		let mut builder = HandlerTable::builder();
		register_all(&mut builder, store).expect("register handlers");
		let registry = UserRegistry::new();
		let router = MessageRouter::new(registry.clone(), DEFAULT_MAX_FRAME_SIZE);
		Self {
			table: builder.build(),
			registry,
			router,
		}
	}

	fn client(&self, conn_id: u64) -> Client {
		let (handle, rx) = detached_handle(conn_id, 16);
		Client {
			ctx: HandlerContext::new(handle, self.registry.clone(), self.router.clone()),
			rx,
		}
	}

	async fn call(&self, client: &Client, req: Request) -> Response {
		self.table.dispatch(req, &client.ctx).await
	}

	async fn register(&self, client: &Client, name: &str) -> UserId {
		let resp = self
			.call(
				client,
				Request::new("register").with("username", name).with("password", "pw"),
			)
			.await;
		assert!(resp.is_success(), "register {name} failed: {resp:?}");
		UserId::new(int(&resp, "userId")).expect("positive user id")
	}
}

fn int(resp: &Response, key: &str) -> i64 {
	resp.get(key)
		.and_then(Value::as_i64)
		.unwrap_or_else(|| panic!("missing integer `{key}` in {resp:?}"))
}

fn forwarded(client: &mut Client) -> Option<Response> {
	let frame = client.rx.try_recv().ok()?;
	Some(decode_frame::<Response>(&frame, DEFAULT_MAX_FRAME_SIZE).expect("decode forward").0)
}

#[test]
fn every_chat_action_is_registered() {
	let harness = Harness::new();
	for action in [
		"register",
		"login",
		"logout",
		"sendMessage",
		"getAllMessages",
		"getAllUsers",
		"friendRequest",
		"acceptFriendRequest",
		"queryFriendStatus",
		"getFriendsList",
		"getFriendRequests",
		"getNonFriendUsers",
		"unfriend",
		"createGroup",
		"addUserToGroup",
		"removeUserFromGroup",
		"leaveGroup",
		"sendGroupMessage",
		"getGroupMessages",
		"getUserGroups",
		"getGroupMembers",
	] {
		assert!(harness.table.has_action(action), "missing handler for {action}");
	}
	assert_eq!(harness.table.len(), 21);
}

#[tokio::test]
async fn register_and_login_bind_the_calling_connection() {
	let harness = Harness::new();
	let first = harness.client(1);
	let second = harness.client(2);

	let alice = harness.register(&first, "alice").await;
	assert_eq!(
		harness.registry.get(alice).await.into_handle().map(|h| h.conn_id().get()),
		Some(1)
	);

	let dup = harness
		.call(
			&second,
			Request::new("register").with("username", "alice").with("password", "x"),
		)
		.await;
	assert_eq!(dup.action, "registerResponse");
	assert!(!dup.is_success());
	assert_eq!(int(&dup, "userId"), -1);

	let bad = harness
		.call(
			&second,
			Request::new("login").with("username", "alice").with("password", "wrong"),
		)
		.await;
	assert_eq!(bad.action, "loginResponse");
	assert!(!bad.is_success());
	assert_eq!(int(&bad, "userId"), -1);

	let good = harness
		.call(
			&second,
			Request::new("login").with("username", "alice").with("password", "pw"),
		)
		.await;
	assert!(good.is_success(), "{good:?}");
	assert_eq!(int(&good, "userId"), alice.get());
	assert_eq!(
		harness.registry.get(alice).await.into_handle().map(|h| h.conn_id().get()),
		Some(2)
	);
}

#[tokio::test]
async fn login_without_credentials_is_refused() {
	let harness = Harness::new();
	let client = harness.client(1);

	let resp = harness.call(&client, Request::new("login").with("username", "  ")).await;
	assert_eq!(resp.action, "loginResponse");
	assert!(!resp.is_success());
	assert_eq!(int(&resp, "userId"), -1);
	assert_eq!(harness.registry.len().await, 0);
}

#[tokio::test]
async fn stale_logout_keeps_the_newer_binding() {
	let harness = Harness::new();
	let old = harness.client(1);
	let new = harness.client(2);

	let alice = harness.register(&old, "alice").await;
	let relog = harness
		.call(&new, Request::new("login").with("username", "alice").with("password", "pw"))
		.await;
	assert!(relog.is_success());

	let resp = harness
		.call(&old, Request::new("logout").with("userId", alice.get()))
		.await;
	assert_eq!(resp.action, "logoutResponse");
	assert!(resp.is_success());
	assert!(harness.registry.get(alice).await.is_online());

	harness
		.call(&new, Request::new("logout").with("userId", alice.get()))
		.await;
	assert!(!harness.registry.get(alice).await.is_online());
}

#[tokio::test]
async fn direct_message_is_forwarded_to_an_online_receiver() {
	let harness = Harness::new();
	let a = harness.client(1);
	let mut b = harness.client(2);
	let alice = harness.register(&a, "alice").await;
	let bob = harness.register(&b, "bob").await;

	let resp = harness
		.call(
			&a,
			Request::new("sendMessage")
				.with("senderID", alice.get())
				.with("receiverID", bob.get())
				.with("content", "hi bob"),
		)
		.await;
	assert!(resp.is_success(), "{resp:?}");
	assert_eq!(resp.get("delivered"), Some(&json!(true)));

	let fwd = forwarded(&mut b).expect("bob receives the message");
	assert_eq!(fwd.action, "receiveMessage");
	assert_eq!(fwd.success, None);
	assert_eq!(int(&fwd, "senderID"), alice.get());
	assert_eq!(fwd.get("content"), Some(&json!("hi bob")));
	assert!(forwarded(&mut b).is_none());
}

#[tokio::test]
async fn direct_message_to_offline_user_is_kept_for_history() {
	let harness = Harness::new();
	let a = harness.client(1);
	let b = harness.client(2);
	let alice = harness.register(&a, "alice").await;
	let bob = harness.register(&b, "bob").await;
	harness.call(&b, Request::new("logout").with("userId", bob.get())).await;

	let resp = harness
		.call(
			&a,
			Request::new("sendMessage")
				.with("senderID", alice.get())
				.with("receiverID", bob.get())
				.with("content", "later"),
		)
		.await;
	assert!(resp.is_success());
	assert_eq!(resp.get("delivered"), Some(&json!(false)));

	let history = harness
		.call(
			&b,
			Request::new("getAllMessages")
				.with("userID", bob.get())
				.with("friendID", alice.get()),
		)
		.await;
	assert!(history.is_success());
	let messages = history.get("messages").and_then(Value::as_array).expect("messages array");
	assert_eq!(messages.len(), 1);
	assert_eq!(messages[0]["content"], json!("later"));
	assert_eq!(messages[0]["receiverID"], json!(bob.get()));
}

#[tokio::test]
async fn malformed_ids_become_error_replies() {
	let harness = Harness::new();
	let client = harness.client(1);

	let resp = harness
		.call(
			&client,
			Request::new("sendMessage")
				.with("senderID", "abc")
				.with("receiverID", 2)
				.with("content", "x"),
		)
		.await;
	assert_eq!(resp.action, "sendMessage");
	assert!(!resp.is_success());
	assert!(resp.message().unwrap_or_default().contains("senderID"), "{resp:?}");

	let resp = harness
		.call(&client, Request::new("getGroupMembers").with("groupID", 99))
		.await;
	assert!(!resp.is_success());
	assert_eq!(resp.message(), Some("not found: group 99"));
}

#[tokio::test]
async fn friendship_lifecycle_through_handlers() {
	let harness = Harness::new();
	let a = harness.client(1);
	let b = harness.client(2);
	let alice = harness.register(&a, "alice").await;
	let bob = harness.register(&b, "bob").await;

	let status = |from: UserId, to: UserId| {
		Request::new("queryFriendStatus")
			.with("fromUserID", from.get())
			.with("toUserID", to.get())
	};

	assert_eq!(int(&harness.call(&a, status(alice, bob)).await, "status"), -1);

	let sent = harness
		.call(
			&a,
			Request::new("friendRequest")
				.with("fromUserID", alice.get())
				.with("toUserID", bob.get()),
		)
		.await;
	assert!(sent.is_success());
	assert_eq!(int(&harness.call(&a, status(alice, bob)).await, "status"), 0);
	assert_eq!(int(&harness.call(&b, status(bob, alice)).await, "status"), 2);

	let requests = harness
		.call(&b, Request::new("getFriendRequests").with("userID", bob.get()))
		.await;
	assert_eq!(
		requests.get("requests"),
		Some(&json!([{"userID": alice.get(), "username": "alice", "status": 1}]))
	);

	let accepted = harness
		.call(
			&b,
			Request::new("acceptFriendRequest")
				.with("fromUserID", bob.get())
				.with("toUserID", alice.get()),
		)
		.await;
	assert!(accepted.is_success(), "{accepted:?}");
	assert_eq!(int(&harness.call(&a, status(alice, bob)).await, "status"), 1);

	let friends = harness
		.call(&a, Request::new("getFriendsList").with("userID", alice.get()))
		.await;
	let friends = friends.get("friends").and_then(Value::as_array).expect("friends");
	assert_eq!(friends.len(), 1);
	assert_eq!(friends[0]["username"], json!("bob"));

	let gone = harness
		.call(
			&a,
			Request::new("unfriend")
				.with("fromUserID", alice.get())
				.with("toUserID", bob.get()),
		)
		.await;
	assert!(gone.is_success());
	assert_eq!(int(&harness.call(&a, status(alice, bob)).await, "status"), -1);

	let self_request = harness
		.call(
			&a,
			Request::new("friendRequest")
				.with("fromUserID", alice.get())
				.with("toUserID", alice.get()),
		)
		.await;
	assert!(!self_request.is_success());
}

#[tokio::test]
async fn group_message_reaches_online_members() {
	let harness = Harness::new();
	let mut a = harness.client(1);
	let mut b = harness.client(2);
	let c = harness.client(3);
	let alice = harness.register(&a, "alice").await;
	let bob = harness.register(&b, "bob").await;
	let carol = harness.register(&c, "carol").await;
	harness.call(&c, Request::new("logout").with("userId", carol.get())).await;

	let created = harness
		.call(
			&a,
			Request::new("createGroup")
				.with("groupName", "team")
				.with("ownerID", alice.get()),
		)
		.await;
	assert!(created.is_success());
	assert_eq!(created.get("groupName"), Some(&json!("team")));
	let group = int(&created, "groupID");

	for user in [bob, carol] {
		let added = harness
			.call(
				&a,
				Request::new("addUserToGroup")
					.with("groupID", group)
					.with("userID", user.get()),
			)
			.await;
		assert!(added.is_success(), "{added:?}");
	}

	let sent = harness
		.call(
			&a,
			Request::new("sendGroupMessage")
				.with("groupID", group)
				.with("senderID", alice.get())
				.with("content", "standup"),
		)
		.await;
	assert!(sent.is_success());
	assert_eq!(sent.get("senderName"), Some(&json!("alice")));

	let to_bob = forwarded(&mut b).expect("bob is online");
	assert_eq!(to_bob.action, "receiveGroupMessage");
	assert_eq!(int(&to_bob, "groupID"), group);
	assert_eq!(to_bob.get("senderName"), Some(&json!("alice")));
	assert_eq!(to_bob.get("content"), Some(&json!("standup")));
	assert!(forwarded(&mut a).is_some(), "online sender gets the member copy too");

	let members = harness
		.call(&a, Request::new("getGroupMembers").with("groupID", group))
		.await;
	let names: Vec<&str> = members
		.get("members")
		.and_then(Value::as_array)
		.expect("members")
		.iter()
		.filter_map(|m| m["username"].as_str())
		.collect();
	assert_eq!(names, vec!["alice", "bob", "carol"]);

	let history = harness
		.call(&c, Request::new("getGroupMessages").with("groupID", group))
		.await;
	assert_eq!(history.get("messages").and_then(Value::as_array).map(Vec::len), Some(1));
}

#[tokio::test]
async fn leaving_a_group_twice_fails_the_second_time() {
	let harness = Harness::new();
	let a = harness.client(1);
	let alice = harness.register(&a, "alice").await;

	let created = harness
		.call(
			&a,
			Request::new("createGroup")
				.with("groupName", "solo")
				.with("ownerID", alice.get()),
		)
		.await;
	let group = int(&created, "groupID");

	let groups = harness
		.call(&a, Request::new("getUserGroups").with("userID", alice.get()))
		.await;
	assert_eq!(groups.get("groups"), Some(&json!([{"groupID": group, "groupName": "solo"}])));

	let leave = || {
		Request::new("leaveGroup")
			.with("groupID", group)
			.with("userID", alice.get())
	};
	let first = harness.call(&a, leave()).await;
	assert_eq!(first.action, "leaveGroup");
	assert!(first.is_success());
	let second = harness.call(&a, leave()).await;
	assert!(!second.is_success());
}
