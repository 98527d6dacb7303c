//! MESSAGE handlers

use super::validate::{self, MAX_HISTORY};
use super::{HandlerResult, Request, Response, Router, Status};
use crate::store::{Created, Lookup, Message};
use std::collections::HashMap;
use tracing::{debug, info};

/// Shown in place of a sender whose account was deleted
const UNKNOWN_SENDER: &str = "[deleted]";

/// CREATE MESSAGE: `sender_display_name, channel_name, content, timestamp_hex`
pub(super) fn create(router: &Router, req: &Request<'_>) -> HandlerResult {
    let [sender, channel_name, content, timestamp] = req.fields else {
        return Ok(Response::invalid_count());
    };
    if !validate::name(sender) || !validate::name(channel_name) || !validate::content(content) {
        return Ok(Response::invalid_fields());
    }
    let Some(timestamp) = validate::timestamp(timestamp) else {
        return Ok(Response::invalid_fields());
    };

    let Some(requester) = router.requester(req.peer)? else {
        return Ok(Response::forbidden("Not logged in"));
    };
    if !requester.is_admin() && requester.display_name != *sender {
        return Ok(Response::forbidden("Cannot post as another user"));
    }

    let stores = router.stores();
    let Lookup::Found(user) = stores.users.find_by_name(sender)? else {
        return Ok(Response::not_found("User not found"));
    };
    let Lookup::Found(channel) = stores.channels.find_by_name(channel_name)? else {
        return Ok(Response::not_found("Channel not found"));
    };
    if channel.is_banned(sender) || !channel.is_member(sender) {
        return Ok(Response::forbidden("Not a member of the channel"));
    }

    let message = Message {
        id: 0,
        user_id: user.id,
        channel_id: channel.id,
        message_content: content.clone(),
        timestamp,
    };
    match stores.messages.create(message)? {
        Created::Inserted(message) => {
            debug!(id = message.id, channel = %channel.channel_name, sender = %sender, "message stored");
            Ok(Response::text(Status::Created, "Message created."))
        }
        Created::Duplicate | Created::DuplicateId => Ok(Response::internal()),
    }
}

/// READ MESSAGE: `channel_name, count`
///
/// Returns the count, then `id, sender, timestamp_hex, content` for each
/// message, newest first.
pub(super) fn read(router: &Router, req: &Request<'_>) -> HandlerResult {
    let [channel_name, count] = req.fields else {
        return Ok(Response::invalid_count());
    };
    if !validate::name(channel_name) {
        return Ok(Response::invalid_fields());
    }
    let Some(count) = validate::decimal::<usize>(count).filter(|&c| c > 0 && c <= MAX_HISTORY) else {
        return Ok(Response::invalid_fields());
    };

    let stores = router.stores();
    let Lookup::Found(channel) = stores.channels.find_by_name(channel_name)? else {
        return Ok(Response::not_found("Channel not found"));
    };
    let requester = router.requester(req.peer)?;
    if let Some(user) = &requester {
        if channel.is_banned(&user.display_name) {
            return Ok(Response::forbidden("Banned from the channel"));
        }
    }
    if channel.is_private() {
        let visible = requester
            .as_ref()
            .is_some_and(|u| u.is_admin() || channel.is_member(&u.display_name));
        if !visible {
            return Ok(Response::forbidden("Private channel"));
        }
    }

    let messages = stores.messages.recent(channel.id, count)?;
    let mut senders: HashMap<u32, String> = HashMap::new();
    let mut payload = Vec::with_capacity(1 + messages.len() * 4);
    payload.push(messages.len().to_string());
    for message in messages {
        if !senders.contains_key(&message.user_id) {
            let name = stores
                .users
                .read(message.user_id)?
                .found()
                .map(|u| u.display_name)
                .unwrap_or_else(|| UNKNOWN_SENDER.to_string());
            senders.insert(message.user_id, name);
        }
        payload.push(message.id.to_string());
        payload.push(senders[&message.user_id].clone());
        payload.push(validate::format_timestamp(message.timestamp));
        payload.push(message.message_content);
    }
    Ok(Response::new(Status::Ok, payload))
}

/// DESTROY MESSAGE: `channel_name, message_id`
///
/// Allowed for the sender, the channel's administrators and global admins.
pub(super) fn destroy(router: &Router, req: &Request<'_>) -> HandlerResult {
    let [channel_name, id] = req.fields else {
        return Ok(Response::invalid_count());
    };
    if !validate::name(channel_name) {
        return Ok(Response::invalid_fields());
    }
    let Some(id) = validate::decimal::<u32>(id) else {
        return Ok(Response::invalid_fields());
    };
    let Some(requester) = router.requester(req.peer)? else {
        return Ok(Response::forbidden("Not logged in"));
    };

    let stores = router.stores();
    let Lookup::Found(channel) = stores.channels.find_by_name(channel_name)? else {
        return Ok(Response::not_found("Channel not found"));
    };
    let mut messages = stores.messages.lock()?;
    let message = match messages.read(id)? {
        Lookup::Found(m) if m.channel_id == channel.id => m,
        _ => {
            messages.close()?;
            return Ok(Response::not_found("Message not found"));
        }
    };
    let allowed = message.user_id == requester.id
        || requester.is_admin()
        || channel.is_admin(&requester.display_name);
    if !allowed {
        messages.close()?;
        return Ok(Response::forbidden("Cannot delete this message"));
    }
    messages.delete(id)?;
    messages.close()?;

    info!(id, channel = %channel.channel_name, by = %requester.display_name, "message deleted");
    Ok(Response::text(Status::Ok, "Message deleted."))
}
