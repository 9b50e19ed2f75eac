#![forbid(unsafe_code)]

use std::sync::Arc;

use relay_protocol::{Request, Response};
use tracing::debug;

use super::{text_field, to_json, user_field, with_store};
use crate::server::dispatch::{HandlerContext, HandlerResult, HandlerTableBuilder, RegistrationError};
use crate::server::router::Delivery;
use crate::store::{ChatStore, DIRECT_HISTORY_LIMIT};

pub(super) fn register(table: &mut HandlerTableBuilder, store: &Arc<dyn ChatStore>) -> Result<(), RegistrationError> {
	table.register("sendMessage", with_store(store, handle_send_message))?;
	table.register("getAllMessages", with_store(store, handle_get_all_messages))?;
	table.register("getAllUsers", with_store(store, handle_get_all_users))?;
	Ok(())
}

/// Persist, reply, then forward `receiveMessage` to the receiver if online.
async fn handle_send_message(store: Arc<dyn ChatStore>, req: Request, ctx: HandlerContext) -> HandlerResult {
	let sender = user_field(&req, "senderID")?;
	let receiver = user_field(&req, "receiverID")?;
	let content = text_field(&req, "content")?;

	let stored = store.insert_message(sender, receiver, content).await?;

	let forward = Response::event("receiveMessage")
		.with_document(req.fields.clone())
		.with("sentAt", stored.sent_at);
	let outcome = ctx.router().deliver(receiver, &forward).await;
	debug!(sender_id = %sender, receiver_id = %receiver, ?outcome, "direct message relayed");

	Ok(Response::ok("sendMessage")
		.with("message", "Message inserted successfully.")
		.with("sentAt", stored.sent_at)
		.with("delivered", outcome == Delivery::Delivered))
}

async fn handle_get_all_messages(store: Arc<dyn ChatStore>, req: Request, _ctx: HandlerContext) -> HandlerResult {
	let user = user_field(&req, "userID")?;
	let friend = user_field(&req, "friendID")?;
	let messages = store.messages_between(user, friend, DIRECT_HISTORY_LIMIT).await?;
	Ok(Response::ok("getAllMessages").with("messages", to_json(&messages)?))
}

async fn handle_get_all_users(store: Arc<dyn ChatStore>, _req: Request, _ctx: HandlerContext) -> HandlerResult {
	let users = store.list_users().await?;
	Ok(Response::ok("getAllUsers").with("users", to_json(&users)?))
}
