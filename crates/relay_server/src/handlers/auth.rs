#![forbid(unsafe_code)]

use std::sync::Arc;

use relay_protocol::{Request, Response};
use tracing::info;

use super::{user_field, with_store};
use crate::server::dispatch::{HandlerContext, HandlerResult, HandlerTableBuilder, RegistrationError};
use crate::store::{ChatStore, StoreError};

const REGISTER_REPLY: &str = "registerResponse";
const LOGIN_REPLY: &str = "loginResponse";
const LOGOUT_REPLY: &str = "logoutResponse";

pub(super) fn register(table: &mut HandlerTableBuilder, store: &Arc<dyn ChatStore>) -> Result<(), RegistrationError> {
	table.register_as("register", REGISTER_REPLY, with_store(store, handle_register))?;
	table.register_as("login", LOGIN_REPLY, with_store(store, handle_login))?;
	table.register_as("logout", LOGOUT_REPLY, with_store(store, handle_logout))?;
	Ok(())
}

fn credentials(req: &Request) -> Option<(&str, &str)> {
	let username = req.str_field("username").map(str::trim).filter(|s| !s.is_empty())?;
	let password = req.str_field("password").filter(|s| !s.is_empty())?;
	Some((username, password))
}

async fn handle_register(store: Arc<dyn ChatStore>, req: Request, ctx: HandlerContext) -> HandlerResult {
	let Some((username, password)) = credentials(&req) else {
		return Ok(Response::error(REGISTER_REPLY, "Username and password are required.").with("userId", -1));
	};

	match store.register_user(username, password).await {
		Ok(user) => {
			store.set_online(user, true).await?;
			ctx.bind_user(user).await;
			info!(user_id = %user, conn_id = %ctx.conn().conn_id(), %username, "user registered");
			Ok(Response::ok(REGISTER_REPLY)
				.with("message", "Registration successful.")
				.with("userId", user.get()))
		}
		Err(StoreError::UsernameTaken) => Ok(Response::error(
			REGISTER_REPLY,
			"Registration failed. Username may already exist.",
		)
		.with("userId", -1)),
		Err(e) => Err(e.into()),
	}
}

async fn handle_login(store: Arc<dyn ChatStore>, req: Request, ctx: HandlerContext) -> HandlerResult {
	let Some((username, password)) = credentials(&req) else {
		return Ok(Response::error(LOGIN_REPLY, "Username and password are required.").with("userId", -1));
	};

	let Some(user) = store.verify_login(username, password).await? else {
		info!(conn_id = %ctx.conn().conn_id(), %username, "login rejected");
		return Ok(Response::error(LOGIN_REPLY, "Invalid username or password.").with("userId", -1));
	};

	store.set_online(user, true).await?;
	ctx.bind_user(user).await;
	info!(user_id = %user, conn_id = %ctx.conn().conn_id(), %username, "user logged in");
	Ok(Response::ok(LOGIN_REPLY)
		.with("message", "Login successful.")
		.with("userId", user.get()))
}

async fn handle_logout(store: Arc<dyn ChatStore>, req: Request, ctx: HandlerContext) -> HandlerResult {
	let user = user_field(&req, "userId")?;
	store.set_online(user, false).await?;
	let unbound = ctx.unbind_user(user).await;
	info!(user_id = %user, conn_id = %ctx.conn().conn_id(), unbound, "user logged out");
	Ok(Response::ok(LOGOUT_REPLY).with("message", "Logout successful."))
}
