#![forbid(unsafe_code)]

use std::sync::Arc;

use relay_domain::UserId;
use relay_protocol::{Request, Response};
use tracing::info;

use super::{to_json, user_field, with_store};
use crate::server::dispatch::{HandlerContext, HandlerError, HandlerResult, HandlerTableBuilder, RegistrationError};
use crate::store::{ChatStore, StoreError};

pub(super) fn register(table: &mut HandlerTableBuilder, store: &Arc<dyn ChatStore>) -> Result<(), RegistrationError> {
	table.register("friendRequest", with_store(store, handle_friend_request))?;
	table.register("acceptFriendRequest", with_store(store, handle_accept))?;
	table.register("queryFriendStatus", with_store(store, handle_query_status))?;
	table.register("getFriendsList", with_store(store, handle_friends_list))?;
	table.register("getFriendRequests", with_store(store, handle_friend_requests))?;
	table.register("getNonFriendUsers", with_store(store, handle_non_friends))?;
	table.register("unfriend", with_store(store, handle_unfriend))?;
	Ok(())
}

/// `(fromUserID, toUserID)`; the two must differ.
fn pair(req: &Request) -> Result<(UserId, UserId), HandlerError> {
	let from = user_field(req, "fromUserID")?;
	let to = user_field(req, "toUserID")?;
	if from == to {
		return Err(HandlerError::InvalidRequest("fromUserID and toUserID must differ".to_string()));
	}
	Ok((from, to))
}

async fn handle_friend_request(store: Arc<dyn ChatStore>, req: Request, _ctx: HandlerContext) -> HandlerResult {
	let (from, to) = pair(&req)?;
	match store.request_friendship(from, to).await {
		Ok(()) => {
			info!(from = %from, to = %to, "friend request sent");
			Ok(Response::ok("friendRequest").with("message", "Friend request sent successfully."))
		}
		Err(StoreError::AlreadyRelated) => Ok(Response::error("friendRequest", "Failed to send friend request.")),
		Err(e) => Err(e.into()),
	}
}

/// Accepts the pending request between the two users, whichever of them sent it.
async fn handle_accept(store: Arc<dyn ChatStore>, req: Request, _ctx: HandlerContext) -> HandlerResult {
	let (from, to) = pair(&req)?;
	let accepted = match store.accept_friendship(to, from).await {
		Err(StoreError::NoPendingRequest) => store.accept_friendship(from, to).await,
		other => other,
	};
	match accepted {
		Ok(()) => {
			info!(from = %from, to = %to, "friend request accepted");
			Ok(Response::ok("acceptFriendRequest").with("message", "Friend request accepted successfully."))
		}
		Err(StoreError::NoPendingRequest) => {
			Ok(Response::error("acceptFriendRequest", "Failed to accept friend request."))
		}
		Err(e) => Err(e.into()),
	}
}

async fn handle_query_status(store: Arc<dyn ChatStore>, req: Request, _ctx: HandlerContext) -> HandlerResult {
	let (from, to) = pair(&req)?;
	let status = store.friend_status(from, to).await?;
	Ok(Response::ok("queryFriendStatus").with("status", status.code()))
}

async fn handle_friends_list(store: Arc<dyn ChatStore>, req: Request, _ctx: HandlerContext) -> HandlerResult {
	let user = user_field(&req, "userID")?;
	let friends = store.friends_of(user).await?;
	Ok(Response::ok("getFriendsList").with("friends", to_json(&friends)?))
}

async fn handle_friend_requests(store: Arc<dyn ChatStore>, req: Request, _ctx: HandlerContext) -> HandlerResult {
	let user = user_field(&req, "userID")?;
	let requests = store.incoming_requests(user).await?;
	Ok(Response::ok("getFriendRequests").with("requests", to_json(&requests)?))
}

async fn handle_non_friends(store: Arc<dyn ChatStore>, req: Request, _ctx: HandlerContext) -> HandlerResult {
	let user = user_field(&req, "userID")?;
	let users = store.non_friends(user).await?;
	Ok(Response::ok("getNonFriendUsers").with("users", to_json(&users)?))
}

async fn handle_unfriend(store: Arc<dyn ChatStore>, req: Request, _ctx: HandlerContext) -> HandlerResult {
	let (from, to) = pair(&req)?;
	if store.remove_friendship(from, to).await? {
		info!(from = %from, to = %to, "friendship removed");
		Ok(Response::ok("unfriend").with("message", "Unfriended successfully."))
	} else {
		Ok(Response::error("unfriend", "Failed to unfriend."))
	}
}
