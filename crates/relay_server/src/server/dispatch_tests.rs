#![forbid(unsafe_code)]

use relay_domain::UserId;
use relay_protocol::{DEFAULT_MAX_FRAME_SIZE, Request, Response};

use crate::server::connection::detached_handle;
use crate::server::dispatch::{
	HandlerContext, HandlerError, HandlerResult, HandlerTable, INTERNAL_ERROR_MESSAGE, RegistrationError, UNKNOWN_ACTION_MESSAGE,
	handler_fn,
};
use crate::server::registry::UserRegistry;
use crate::server::router::MessageRouter;

fn ctx_for(conn_id: u64, registry: &UserRegistry) -> HandlerContext {
	let (handle, _rx) = detached_handle(conn_id, 8);
	HandlerContext::new(
		handle,
		registry.clone(),
		MessageRouter::new(registry.clone(), DEFAULT_MAX_FRAME_SIZE),
	)
}

fn reply(resp: Response) -> HandlerResult {
	Ok(resp)
}

fn fail(e: HandlerError) -> HandlerResult {
	Err(e)
}

fn table() -> HandlerTable {
	let mut builder = HandlerTable::builder();
	builder
		.register(
			"echo",
			handler_fn(|req: Request, _ctx| async move { reply(Response::ok("echo").with_document(req.fields)) }),
		)
		.expect("register echo");
	builder
		.register_as(
			"login",
			"loginResponse",
			handler_fn(|_req, _ctx| async move { fail(HandlerError::Rejected("bad credentials".to_string())) }),
		)
		.expect("register login");
	builder
		.register(
			"boom",
			handler_fn(|_req, _ctx| async move {
				if true {
					panic!("handler blew up");
				}
				reply(Response::ok("boom"))
			}),
		)
		.expect("register boom");
	builder
		.register(
			"store",
			handler_fn(|_req, _ctx| async move {
				fail(HandlerError::Store(anyhow::anyhow!("disk on fire").context("insert message")))
			}),
		)
		.expect("register store");
	builder.build()
}

#[test]
fn registration_rejects_duplicates_and_blank_actions() {
	let mut builder = HandlerTable::builder();
	let noop = || handler_fn(|_req, _ctx| async move { reply(Response::ok("x")) });

	assert_eq!(builder.register("x", noop()), Ok(()));
	assert_eq!(
		builder.register("x", noop()),
		Err(RegistrationError::DuplicateAction("x".to_string()))
	);
	assert_eq!(builder.register("   ", noop()), Err(RegistrationError::EmptyAction));

	let table = builder.build();
	assert_eq!(table.len(), 1);
	assert!(table.has_action("x"));
}

#[test]
fn actions_are_listed_sorted() {
	assert_eq!(table().actions(), vec!["boom", "echo", "login", "store"]);
}

#[tokio::test]
async fn unknown_action_echoes_the_requested_name() {
	let registry = UserRegistry::new();
	let ctx = ctx_for(1, &registry);

	let resp = table().dispatch(Request::new("nope"), &ctx).await;
	assert_eq!(resp.action, "nope");
	assert_eq!(resp.success, Some(false));
	assert_eq!(resp.message(), Some(UNKNOWN_ACTION_MESSAGE));
}

#[tokio::test]
async fn handler_payload_is_returned_as_is() {
	let registry = UserRegistry::new();
	let ctx = ctx_for(1, &registry);

	let resp = table()
		.dispatch(Request::new("echo").with("seq", 7), &ctx)
		.await;
	assert!(resp.is_success());
	assert_eq!(resp.get("seq"), Some(&serde_json::json!(7)));
}

#[tokio::test]
async fn handler_errors_use_the_reply_label() {
	let registry = UserRegistry::new();
	let ctx = ctx_for(1, &registry);
	let table = table();

	let resp = table.dispatch(Request::new("login"), &ctx).await;
	assert_eq!(resp.action, "loginResponse");
	assert_eq!(resp.message(), Some("bad credentials"));

}

#[tokio::test]
async fn backend_failures_are_not_leaked_to_the_client() {
	let registry = UserRegistry::new();
	let ctx = ctx_for(1, &registry);

	let resp = table().dispatch(Request::new("store"), &ctx).await;
	assert_eq!(resp.action, "store");
	assert!(!resp.is_success());
	assert_eq!(resp.message(), Some(INTERNAL_ERROR_MESSAGE));
	let body = serde_json::to_string(&resp).expect("serialize reply");
	assert!(!body.contains("disk on fire"), "{body}");
	assert!(!body.contains("insert message"), "{body}");
}

#[tokio::test]
async fn handler_panic_becomes_error_reply_and_table_survives() {
	let registry = UserRegistry::new();
	let ctx = ctx_for(1, &registry);
	let table = table();

	let resp = table.dispatch(Request::new("boom"), &ctx).await;
	assert_eq!(resp.action, "boom");
	assert_eq!(resp.message(), Some(INTERNAL_ERROR_MESSAGE));

	let resp = table.dispatch(Request::new("echo"), &ctx).await;
	assert!(resp.is_success());
}

#[tokio::test]
async fn bind_and_unbind_follow_connection_ownership() {
	let registry = UserRegistry::new();
	let first = ctx_for(1, &registry);
	let second = ctx_for(2, &registry);
	let user = UserId::new(5).expect("valid id");

	first.bind_user(user).await;
	second.bind_user(user).await;
	assert!(!first.unbind_user(user).await, "stale connection must not release the user");
	assert!(registry.get(user).await.is_online());

	assert!(second.unbind_user(user).await);
	assert!(!registry.get(user).await.is_online());
}
