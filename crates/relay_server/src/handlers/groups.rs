#![forbid(unsafe_code)]

use std::sync::Arc;

use relay_protocol::{Request, Response};
use tracing::{debug, info};

use super::{group_field, text_field, to_json, user_field, with_store};
use crate::server::dispatch::{HandlerContext, HandlerResult, HandlerTableBuilder, RegistrationError};
use crate::store::{ChatStore, GROUP_HISTORY_LIMIT, StoreError};

pub(super) fn register(table: &mut HandlerTableBuilder, store: &Arc<dyn ChatStore>) -> Result<(), RegistrationError> {
	table.register("createGroup", with_store(store, handle_create))?;
	table.register("addUserToGroup", with_store(store, handle_add_member))?;
	table.register("removeUserFromGroup", with_store(store, |s, r, c| handle_remove_member(s, r, c, "removeUserFromGroup")))?;
	table.register("leaveGroup", with_store(store, |s, r, c| handle_remove_member(s, r, c, "leaveGroup")))?;
	table.register("sendGroupMessage", with_store(store, handle_send_group_message))?;
	table.register("getGroupMessages", with_store(store, handle_group_messages))?;
	table.register("getUserGroups", with_store(store, handle_user_groups))?;
	table.register("getGroupMembers", with_store(store, handle_group_members))?;
	Ok(())
}

async fn handle_create(store: Arc<dyn ChatStore>, req: Request, _ctx: HandlerContext) -> HandlerResult {
	let name = text_field(&req, "groupName")?.trim();
	let owner = user_field(&req, "ownerID")?;
	let group = store.create_group(name, owner).await?;
	info!(group_id = %group, owner = %owner, %name, "group created");
	Ok(Response::ok("createGroup")
		.with("groupID", group.get())
		.with("groupName", name))
}

async fn handle_add_member(store: Arc<dyn ChatStore>, req: Request, _ctx: HandlerContext) -> HandlerResult {
	let group = group_field(&req, "groupID")?;
	let user = user_field(&req, "userID")?;
	match store.add_group_member(group, user).await {
		Ok(()) => Ok(Response::ok("addUserToGroup")),
		Err(StoreError::AlreadyMember) => Ok(Response::error("addUserToGroup", "Failed to add user to group.")),
		Err(e) => Err(e.into()),
	}
}

/// Shared by `removeUserFromGroup` and `leaveGroup`; only the reply label differs.
async fn handle_remove_member(
	store: Arc<dyn ChatStore>,
	req: Request,
	_ctx: HandlerContext,
	action: &'static str,
) -> HandlerResult {
	let group = group_field(&req, "groupID")?;
	let user = user_field(&req, "userID")?;
	if store.remove_group_member(group, user).await? {
		Ok(Response::ok(action))
	} else {
		Ok(Response::error(action, "Failed to remove user from group."))
	}
}

/// Persist, reply, then forward `receiveGroupMessage` to every online member.
async fn handle_send_group_message(store: Arc<dyn ChatStore>, req: Request, ctx: HandlerContext) -> HandlerResult {
	let group = group_field(&req, "groupID")?;
	let sender = user_field(&req, "senderID")?;
	let content = text_field(&req, "content")?;

	let stored = store.insert_group_message(group, sender, content).await?;
	let members = store.group_members(group).await?;

	let forward = Response::event("receiveGroupMessage")
		.with("groupID", group.get())
		.with("senderID", sender.get())
		.with("senderName", stored.sender_name.as_str())
		.with("content", content)
		.with("sentAt", stored.sent_at);
	let report = ctx
		.router()
		.deliver_many(members.iter().map(|m| m.user_id), &forward)
		.await;
	debug!(
		group_id = %group,
		sender_id = %sender,
		delivered = report.delivered,
		offline = report.offline,
		dropped = report.dropped,
		"group message relayed"
	);

	Ok(Response::ok("sendGroupMessage")
		.with("groupID", group.get())
		.with("senderID", sender.get())
		.with("senderName", stored.sender_name)
		.with("content", content)
		.with("sentAt", stored.sent_at))
}

async fn handle_group_messages(store: Arc<dyn ChatStore>, req: Request, _ctx: HandlerContext) -> HandlerResult {
	let group = group_field(&req, "groupID")?;
	let messages = store.group_messages(group, GROUP_HISTORY_LIMIT).await?;
	Ok(Response::ok("getGroupMessages").with("messages", to_json(&messages)?))
}

async fn handle_user_groups(store: Arc<dyn ChatStore>, req: Request, _ctx: HandlerContext) -> HandlerResult {
	let user = user_field(&req, "userID")?;
	let groups = store.user_groups(user).await?;
	Ok(Response::ok("getUserGroups").with("groups", to_json(&groups)?))
}

async fn handle_group_members(store: Arc<dyn ChatStore>, req: Request, _ctx: HandlerContext) -> HandlerResult {
	let group = group_field(&req, "groupID")?;
	let members = store.group_members(group).await?;
	Ok(Response::ok("getGroupMembers").with("members", to_json(&members)?))
}
