#![forbid(unsafe_code)]

//! Chat actions registered into the handler table at startup.

pub mod auth;
pub mod direct;
pub mod friends;
pub mod groups;

use std::future::Future;
use std::sync::Arc;

use anyhow::anyhow;
use relay_domain::{GroupId, UserId};
use relay_protocol::Request;
use serde::Serialize;
use serde_json::Value;

use crate::server::dispatch::{
	ActionHandler, HandlerContext, HandlerError, HandlerResult, HandlerTableBuilder, RegistrationError, handler_fn,
};
use crate::store::{ChatStore, StoreError};

/// Register every chat action backed by `store`.
pub fn register_all(table: &mut HandlerTableBuilder, store: Arc<dyn ChatStore>) -> Result<(), RegistrationError> {
	auth::register(table, &store)?;
	direct::register(table, &store)?;
	friends::register(table, &store)?;
	groups::register(table, &store)?;
	Ok(())
}

/// Bind an async handler fn to a shared store.
fn with_store<F, Fut>(store: &Arc<dyn ChatStore>, f: F) -> impl ActionHandler + 'static
where
	F: Fn(Arc<dyn ChatStore>, Request, HandlerContext) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = HandlerResult> + Send + 'static,
{
	let store = Arc::clone(store);
	handler_fn(move |req, ctx| f(Arc::clone(&store), req, ctx))
}

fn user_field(req: &Request, key: &str) -> Result<UserId, HandlerError> {
	let raw = req
		.i64_field(key)
		.ok_or_else(|| HandlerError::InvalidRequest(format!("missing or non-integer `{key}`")))?;
	UserId::new(raw).map_err(|e| HandlerError::InvalidRequest(format!("`{key}`: {e}")))
}

fn group_field(req: &Request, key: &str) -> Result<GroupId, HandlerError> {
	let raw = req
		.i64_field(key)
		.ok_or_else(|| HandlerError::InvalidRequest(format!("missing or non-integer `{key}`")))?;
	GroupId::new(raw).map_err(|e| HandlerError::InvalidRequest(format!("`{key}`: {e}")))
}

/// Non-blank string field.
fn text_field<'a>(req: &'a Request, key: &str) -> Result<&'a str, HandlerError> {
	match req.str_field(key) {
		Some(s) if !s.trim().is_empty() => Ok(s),
		_ => Err(HandlerError::InvalidRequest(format!("missing or empty `{key}`"))),
	}
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, HandlerError> {
	serde_json::to_value(value).map_err(|e| HandlerError::Store(anyhow!(e).context("serialize reply payload")))
}

impl From<StoreError> for HandlerError {
	fn from(e: StoreError) -> Self {
		match e {
			StoreError::UnknownUser(user) => HandlerError::NotFound(format!("user {user}")),
			StoreError::UnknownGroup(group) => HandlerError::NotFound(format!("group {group}")),
			StoreError::Backend(e) => HandlerError::Store(e),
			other => HandlerError::Rejected(other.to_string()),
		}
	}
}

#[cfg(test)]
mod handlers_tests;
