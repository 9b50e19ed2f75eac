#![forbid(unsafe_code)]

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt as _;
use relay_domain::UserId;
use relay_protocol::{Request, Response};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::server::connection::ConnectionHandle;
use crate::server::registry::UserRegistry;
use crate::server::router::MessageRouter;

/// `message` of the reply to an action nobody registered.
pub const UNKNOWN_ACTION_MESSAGE: &str = "unknown action";

/// `message` of the reply when a handler panics or its backend fails. Details
/// stay in the server log.
pub const INTERNAL_ERROR_MESSAGE: &str = "internal error";

/// Failure of a single request; the session keeps running. Rendered into the
/// reply's `message`, except `Store`, which is only logged.
#[derive(Debug, Error)]
pub enum HandlerError {
	#[error("invalid request: {0}")]
	InvalidRequest(String),

	#[error("not found: {0}")]
	NotFound(String),

	#[error("{0}")]
	Rejected(String),

	#[error("store error: {0:#}")]
	Store(#[from] anyhow::Error),
}

pub type HandlerResult = Result<Response, HandlerError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
	#[error("action already registered: {0}")]
	DuplicateAction(String),

	#[error("action name must be non-empty")]
	EmptyAction,
}

/// Business logic bound to one action name.
#[async_trait]
pub trait ActionHandler: Send + Sync {
	async fn handle(&self, request: &Request, ctx: &HandlerContext) -> HandlerResult;
}

/// Adapter turning an async closure into an [`ActionHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
	F: Fn(Request, HandlerContext) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = HandlerResult> + Send + 'static,
{
	FnHandler(f)
}

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
	F: Fn(Request, HandlerContext) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = HandlerResult> + Send + 'static,
{
	async fn handle(&self, request: &Request, ctx: &HandlerContext) -> HandlerResult {
		(self.0)(request.clone(), ctx.clone()).await
	}
}

/// What a handler sees of the world: the calling connection, the registry and
/// the router.
#[derive(Debug, Clone)]
pub struct HandlerContext {
	conn: ConnectionHandle,
	registry: UserRegistry,
	router: MessageRouter,
}

impl HandlerContext {
	pub fn new(conn: ConnectionHandle, registry: UserRegistry, router: MessageRouter) -> Self {
		Self { conn, registry, router }
	}

	pub fn conn(&self) -> &ConnectionHandle {
		&self.conn
	}

	pub fn router(&self) -> &MessageRouter {
		&self.router
	}

	/// Make this connection the live one for `user`. Only authentication
	/// handlers call this.
	pub async fn bind_user(&self, user: UserId) {
		let conn_id = self.conn.conn_id();
		match self.registry.put(user, self.conn.clone()).await {
			Some(prev) if prev.conn_id() != conn_id => {
				info!(user_id = %user, previous = %prev.conn_id(), current = %conn_id, "user rebound to a new connection");
			}
			Some(_) => {}
			None => debug!(user_id = %user, %conn_id, peer = %self.conn.peer(), "user bound"),
		}
	}

	/// Release `user` if this connection still owns the binding.
	pub async fn unbind_user(&self, user: UserId) -> bool {
		self.registry.remove(user, &self.conn).await
	}
}

struct Route {
	handler: Arc<dyn ActionHandler>,
	reply_action: String,
}

/// Collects handlers before the listener starts.
#[derive(Default)]
pub struct HandlerTableBuilder {
	routes: HashMap<String, Route>,
}

impl HandlerTableBuilder {
	/// Register `handler` for `action`; error replies reuse the action name.
	pub fn register<H>(&mut self, action: &str, handler: H) -> Result<(), RegistrationError>
	where
		H: ActionHandler + 'static,
	{
		self.register_as(action, action, handler)
	}

	/// Register `handler` for `action`; error replies are labelled `reply_action`.
	pub fn register_as<H>(&mut self, action: &str, reply_action: &str, handler: H) -> Result<(), RegistrationError>
	where
		H: ActionHandler + 'static,
	{
		let action = action.trim();
		if action.is_empty() {
			return Err(RegistrationError::EmptyAction);
		}
		if self.routes.contains_key(action) {
			return Err(RegistrationError::DuplicateAction(action.to_string()));
		}
		self.routes.insert(
			action.to_string(),
			Route {
				handler: Arc::new(handler),
				reply_action: reply_action.to_string(),
			},
		);
		Ok(())
	}

	pub fn build(self) -> HandlerTable {
		HandlerTable { routes: self.routes }
	}
}

/// Immutable action -> handler map, shared by every session.
pub struct HandlerTable {
	routes: HashMap<String, Route>,
}

impl HandlerTable {
	pub fn builder() -> HandlerTableBuilder {
		HandlerTableBuilder::default()
	}

	pub fn has_action(&self, action: &str) -> bool {
		self.routes.contains_key(action)
	}

	/// Registered actions, sorted.
	pub fn actions(&self) -> Vec<&str> {
		let mut actions: Vec<&str> = self.routes.keys().map(String::as_str).collect();
		actions.sort_unstable();
		actions
	}

	pub fn len(&self) -> usize {
		self.routes.len()
	}

	/// Run the handler for `request.action` and produce the reply.
	///
	/// Never fails: unknown actions, handler errors and handler panics all
	/// become `success=false` replies.
	pub async fn dispatch(&self, request: Request, ctx: &HandlerContext) -> Response {
		let conn_id = ctx.conn().conn_id();
		let Some(route) = self.routes.get(request.action.as_str()) else {
			metrics::counter!("relay_server_unknown_action_total").increment(1);
			debug!(%conn_id, action = %request.action, "unknown action");
			return Response::error(request.action, UNKNOWN_ACTION_MESSAGE);
		};

		metrics::counter!("relay_server_requests_total", "action" => request.action.clone()).increment(1);

		let outcome = AssertUnwindSafe(route.handler.handle(&request, ctx))
			.catch_unwind()
			.await;
		match outcome {
			Ok(Ok(response)) => response,
			Ok(Err(e)) => {
				metrics::counter!("relay_server_handler_errors_total").increment(1);
				let message = match &e {
					HandlerError::Store(_) => {
						warn!(%conn_id, action = %request.action, error = %e, "handler failed");
						INTERNAL_ERROR_MESSAGE.to_string()
					}
					_ => {
						debug!(%conn_id, action = %request.action, error = %e, "request rejected");
						e.to_string()
					}
				};
				Response::error(route.reply_action.clone(), message)
			}
			Err(panic) => {
				metrics::counter!("relay_server_handler_errors_total").increment(1);
				error!(%conn_id, action = %request.action, panic = %panic_message(panic.as_ref()), "handler panicked");
				Response::error(route.reply_action.clone(), INTERNAL_ERROR_MESSAGE)
			}
		}
	}
}

impl fmt::Debug for HandlerTable {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("HandlerTable").field("actions", &self.actions()).finish()
	}
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
	if let Some(s) = panic.downcast_ref::<&str>() {
		(*s).to_string()
	} else if let Some(s) = panic.downcast_ref::<String>() {
		s.clone()
	} else {
		"non-string panic payload".to_string()
	}
}
