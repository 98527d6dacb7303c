//! CHANNEL handlers

use super::{validate, HandlerResult, Request, Response, Router, Status};
use crate::store::{Channel, Created, Lookup, StoreError, User};
use std::str::FromStr;
use tracing::{debug, info};

/// Membership and role changes accepted by UPDATE CHANNEL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Join,
    Leave,
    Promote,
    Demote,
    Ban,
    Unban,
}

impl FromStr for Action {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "JOIN" => Ok(Action::Join),
            "LEAVE" => Ok(Action::Leave),
            "PROMOTE" => Ok(Action::Promote),
            "DEMOTE" => Ok(Action::Demote),
            "BAN" => Ok(Action::Ban),
            "UNBAN" => Ok(Action::Unban),
            _ => Err(()),
        }
    }
}

/// Why an action was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refusal {
    Forbidden(&'static str),
    NoChange(&'static str),
}

/// Whether `user` may moderate `channel`
fn moderates(user: &User, channel: &Channel) -> bool {
    user.is_admin() || channel.is_admin(&user.display_name)
}

fn remove(list: &mut Vec<String>, name: &str) {
    list.retain(|n| n != name);
}

/// Apply `action` by `actor` on `target` to `channel`
fn apply(channel: &mut Channel, actor: &User, target: &str, action: Action) -> Result<(), Refusal> {
    let moderator = moderates(actor, channel);
    let is_self = actor.display_name == target;

    match action {
        Action::Join => {
            if channel.is_banned(target) {
                return Err(Refusal::Forbidden("User is banned"));
            }
            let allowed = moderator || (is_self && !channel.is_private());
            if !allowed {
                return Err(Refusal::Forbidden("Not allowed to add members"));
            }
            if channel.is_member(target) {
                return Err(Refusal::NoChange("Already a member"));
            }
            channel.users.push(target.to_string());
        }
        Action::Leave => {
            if !is_self && !moderator {
                return Err(Refusal::Forbidden("Not allowed to remove members"));
            }
            if !is_self && channel.creator == target {
                return Err(Refusal::Forbidden("The creator cannot be removed"));
            }
            if !channel.is_member(target) {
                return Err(Refusal::NoChange("Not a member"));
            }
            remove(&mut channel.users, target);
            remove(&mut channel.administrators, target);
        }
        Action::Promote => {
            if !moderator {
                return Err(Refusal::Forbidden("Not a channel administrator"));
            }
            if !channel.is_member(target) {
                return Err(Refusal::NoChange("Not a member"));
            }
            if channel.is_admin(target) {
                return Err(Refusal::NoChange("Already an administrator"));
            }
            channel.administrators.push(target.to_string());
        }
        Action::Demote => {
            if !moderator {
                return Err(Refusal::Forbidden("Not a channel administrator"));
            }
            if channel.creator == target {
                return Err(Refusal::Forbidden("The creator cannot be demoted"));
            }
            if !channel.is_admin(target) {
                return Err(Refusal::NoChange("Not an administrator"));
            }
            remove(&mut channel.administrators, target);
        }
        Action::Ban => {
            if !moderator {
                return Err(Refusal::Forbidden("Not a channel administrator"));
            }
            if channel.creator == target {
                return Err(Refusal::Forbidden("The creator cannot be banned"));
            }
            if channel.is_banned(target) {
                return Err(Refusal::NoChange("Already banned"));
            }
            remove(&mut channel.users, target);
            remove(&mut channel.administrators, target);
            channel.banned_users.push(target.to_string());
        }
        Action::Unban => {
            if !moderator {
                return Err(Refusal::Forbidden("Not a channel administrator"));
            }
            if !channel.is_banned(target) {
                return Err(Refusal::NoChange("Not banned"));
            }
            remove(&mut channel.banned_users, target);
        }
    }
    Ok(())
}

/// CREATE CHANNEL: `channel_name, creator_display_name, publicity_flag`
pub(super) fn create(router: &Router, req: &Request<'_>) -> HandlerResult {
    let [name, creator, publicity] = req.fields else {
        return Ok(Response::invalid_count());
    };
    if !validate::name(name) || !validate::name(creator) {
        return Ok(Response::invalid_fields());
    }
    let Some(publicity) = validate::publicity(publicity) else {
        return Ok(Response::invalid_fields());
    };

    let Some(requester) = router.requester(req.peer)? else {
        return Ok(Response::forbidden("Not logged in"));
    };
    if !requester.is_admin() && requester.display_name != *creator {
        return Ok(Response::forbidden("Cannot create a channel for another user"));
    }

    let stores = router.stores();
    if !stores.users.find_by_name(creator)?.is_found() {
        return Ok(Response::not_found("User not found"));
    }
    match stores.channels.create(Channel::new(name, creator, publicity))? {
        Created::Inserted(channel) => {
            info!(channel = %channel.channel_name, id = channel.id, creator = %creator, "channel created");
            Ok(Response::text(Status::Created, "Channel created."))
        }
        Created::Duplicate | Created::DuplicateId => {
            Ok(Response::text(Status::Conflict, "Channel already exists"))
        }
    }
}

/// READ CHANNEL: `channel_name`
///
/// A private channel is only visible to its members and global admins.
pub(super) fn read(router: &Router, req: &Request<'_>) -> HandlerResult {
    let [name] = req.fields else {
        return Ok(Response::invalid_count());
    };
    if !validate::name(name) {
        return Ok(Response::invalid_fields());
    }

    let Lookup::Found(channel) = router.stores().channels.find_by_name(name)? else {
        return Ok(Response::not_found("Channel not found"));
    };
    if channel.is_private() {
        let visible = match router.requester(req.peer)? {
            Some(user) => user.is_admin() || channel.is_member(&user.display_name),
            None => false,
        };
        if !visible {
            return Ok(Response::forbidden("Private channel"));
        }
    }

    let mut payload = vec![
        channel.id.to_string(),
        channel.channel_name,
        channel.creator,
        channel.publicity.to_string(),
    ];
    for list in [channel.users, channel.administrators, channel.banned_users] {
        payload.push(list.len().to_string());
        payload.extend(list);
    }
    Ok(Response::new(Status::Ok, payload))
}

/// UPDATE CHANNEL: `channel_name, target_display_name, action`
pub(super) fn update(router: &Router, req: &Request<'_>) -> HandlerResult {
    let [name, target, action] = req.fields else {
        return Ok(Response::invalid_count());
    };
    if !validate::name(name) || !validate::name(target) {
        return Ok(Response::invalid_fields());
    }
    let Ok(action) = action.parse::<Action>() else {
        return Ok(Response::invalid_fields());
    };

    let Some(requester) = router.requester(req.peer)? else {
        return Ok(Response::forbidden("Not logged in"));
    };
    let stores = router.stores();
    if !stores.users.find_by_name(target)?.is_found() {
        return Ok(Response::not_found("User not found"));
    }

    let mut channels = stores.channels.lock()?;
    let Lookup::Found(mut channel) = channels.find_by_name(name)? else {
        channels.close()?;
        return Ok(Response::not_found("Channel not found"));
    };
    let outcome = apply(&mut channel, &requester, target, action);
    if outcome.is_ok() {
        channels.update(&channel)?;
    }
    channels.close()?;

    match outcome {
        Ok(()) => {
            info!(channel = %name, target = %target, ?action, by = %requester.display_name, "channel updated");
            Ok(Response::text(Status::Ok, "Channel updated."))
        }
        Err(Refusal::Forbidden(reason)) => Ok(Response::forbidden(reason)),
        Err(Refusal::NoChange(reason)) => Ok(Response::text(Status::Conflict, reason)),
    }
}

/// DESTROY CHANNEL: `channel_name`
///
/// Allowed for the creator, channel administrators and global admins. The
/// channel's messages go with it.
pub(super) fn destroy(router: &Router, req: &Request<'_>) -> HandlerResult {
    let [name] = req.fields else {
        return Ok(Response::invalid_count());
    };
    if !validate::name(name) {
        return Ok(Response::invalid_fields());
    }
    let Some(requester) = router.requester(req.peer)? else {
        return Ok(Response::forbidden("Not logged in"));
    };

    let stores = router.stores();
    let mut channels = stores.channels.lock()?;
    let Lookup::Found(channel) = channels.find_by_name(name)? else {
        channels.close()?;
        return Ok(Response::not_found("Channel not found"));
    };
    if channel.creator != requester.display_name && !moderates(&requester, &channel) {
        channels.close()?;
        return Ok(Response::forbidden("Not a channel administrator"));
    }
    channels.delete(channel.id)?;
    channels.close()?;

    let dropped = stores.messages.delete_channel(channel.id)?;
    info!(channel = %channel.channel_name, dropped, "channel deleted");
    Ok(Response::text(Status::Ok, "Channel deleted."))
}

/// Carry a rename of `old` into every channel naming it
///
/// With `new` of `None` the user is forgotten instead. Callers hold the
/// users lock; channels are always locked after users.
pub(super) fn relabel_member(router: &Router, old: &str, new: Option<&str>) -> Result<usize, StoreError> {
    let mut channels = router.stores().channels.lock()?;
    let touched = channels.scan(|c: &Channel| c.mentions(old))?;
    let count = touched.len();
    for mut channel in touched {
        match new {
            Some(new) => channel.rename_member(old, new),
            None => channel.forget_member(old),
        }
        channels.update(&channel)?;
    }
    channels.close()?;
    debug!(user = %old, renamed = ?new, channels = count, "channel lists relabelled");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{peer, TestRouter};
    use super::*;
    use crate::server::protocol::{ObjectType, OpType};

    const CHANNEL: ObjectType = ObjectType::Channel;

    fn actor(name: &str, admin: bool) -> User {
        let mut user = User::new(name);
        user.privilege_level = admin as i32;
        user
    }

    #[test]
    fn test_create_channel_as_creator() {
        let t = TestRouter::new();
        t.login_new("alice", peer(1));
        t.login_new("bob", peer(2));

        let body = t.send(OpType::Create, CHANNEL, &["gen", "alice", "0"], peer(1));
        assert_eq!(body, "201\x03Channel created.\x03");
        let body = t.send(OpType::Create, CHANNEL, &["gen", "alice", "0"], peer(2));
        assert!(body.starts_with("403\x03"), "{}", body);
        let body = t.send(OpType::Create, CHANNEL, &["gen", "alice", "0"], peer(1));
        assert_eq!(body, "409\x03Channel already exists\x03");
        let body = t.send(OpType::Create, CHANNEL, &["gen2", "alice", "2"], peer(1));
        assert_eq!(body, "400\x03Invalid fields\x03");
    }

    #[test]
    fn test_admin_creates_for_unknown_user() {
        let t = TestRouter::new();
        let root = t.login_new("root", peer(1));
        t.make_admin(root);
        let body = t.send(OpType::Create, CHANNEL, &["gen", "ghost", "0"], peer(1));
        assert_eq!(body, "404\x03User not found\x03");
    }

    #[test]
    fn test_read_channel_layout() {
        let t = TestRouter::new();
        t.login_new("alice", peer(1));
        t.send(OpType::Create, CHANNEL, &["gen", "alice", "0"], peer(1));
        let body = t.send(OpType::Read, CHANNEL, &["gen"], peer(5));
        assert_eq!(body, "200\x031\x03gen\x03alice\x030\x031\x03alice\x031\x03alice\x030\x03");
        let body = t.send(OpType::Read, CHANNEL, &["nope"], peer(5));
        assert_eq!(body, "404\x03Channel not found\x03");
    }

    #[test]
    fn test_private_channel_visibility() {
        let t = TestRouter::new();
        t.login_new("alice", peer(1));
        t.login_new("bob", peer(2));
        t.send(OpType::Create, CHANNEL, &["secret", "alice", "1"], peer(1));

        assert!(t.send(OpType::Read, CHANNEL, &["secret"], peer(1)).starts_with("200\x03"));
        assert!(t.send(OpType::Read, CHANNEL, &["secret"], peer(2)).starts_with("403\x03"));
        assert!(t.send(OpType::Read, CHANNEL, &["secret"], peer(3)).starts_with("403\x03"));

        // No self-join on a private channel; the creator can add members
        let body = t.send(OpType::Update, CHANNEL, &["secret", "bob", "JOIN"], peer(2));
        assert!(body.starts_with("403\x03"));
        let body = t.send(OpType::Update, CHANNEL, &["secret", "bob", "JOIN"], peer(1));
        assert_eq!(body, "200\x03Channel updated.\x03");
        assert!(t.send(OpType::Read, CHANNEL, &["secret"], peer(2)).starts_with("200\x03"));
    }

    #[test]
    fn test_update_membership_flow() {
        let t = TestRouter::new();
        t.login_new("alice", peer(1));
        t.login_new("bob", peer(2));
        t.send(OpType::Create, CHANNEL, &["gen", "alice", "0"], peer(1));

        let upd = |fields: &[&str], p| t.send(OpType::Update, CHANNEL, fields, p);
        assert_eq!(upd(&["gen", "bob", "join"], peer(2)), "200\x03Channel updated.\x03");
        assert_eq!(upd(&["gen", "bob", "JOIN"], peer(2)), "409\x03Already a member\x03");
        assert!(upd(&["gen", "alice", "BAN"], peer(2)).starts_with("403\x03"));
        assert!(upd(&["gen", "bob", "PROMOTE"], peer(1)).starts_with("200\x03"));
        assert_eq!(
            upd(&["gen", "alice", "DEMOTE"], peer(2)),
            "403\x03The creator cannot be demoted\x03"
        );
        assert!(upd(&["gen", "bob", "BAN"], peer(1)).starts_with("200\x03"));
        assert_eq!(upd(&["gen", "bob", "JOIN"], peer(2)), "403\x03User is banned\x03");
        assert!(upd(&["gen", "bob", "UNBAN"], peer(1)).starts_with("200\x03"));
        assert!(upd(&["gen", "bob", "JOIN"], peer(2)).starts_with("200\x03"));
        assert!(upd(&["gen", "bob", "LEAVE"], peer(2)).starts_with("200\x03"));
        assert_eq!(upd(&["gen", "bob", "DANCE"], peer(2)), "400\x03Invalid fields\x03");
        assert_eq!(upd(&["gen", "carol", "JOIN"], peer(2)), "404\x03User not found\x03");
        assert_eq!(upd(&["nope", "bob", "JOIN"], peer(2)), "404\x03Channel not found\x03");
    }

    #[test]
    fn test_ban_removes_roles() {
        let mut channel = Channel::new("gen", "alice", 0);
        let alice = actor("alice", false);
        apply(&mut channel, &alice, "bob", Action::Join).unwrap();
        apply(&mut channel, &alice, "bob", Action::Promote).unwrap();
        apply(&mut channel, &alice, "bob", Action::Ban).unwrap();
        assert!(!channel.is_member("bob"));
        assert!(!channel.is_admin("bob"));
        assert!(channel.is_banned("bob"));
        assert_eq!(
            apply(&mut channel, &alice, "alice", Action::Ban),
            Err(Refusal::Forbidden("The creator cannot be banned"))
        );
    }

    #[test]
    fn test_global_admin_moderates_any_channel() {
        let mut channel = Channel::new("gen", "alice", 1);
        let root = actor("root", true);
        apply(&mut channel, &root, "carol", Action::Join).unwrap();
        apply(&mut channel, &root, "carol", Action::Promote).unwrap();
        assert!(channel.is_admin("carol"));
        let carol = actor("carol", false);
        assert_eq!(
            apply(&mut channel, &carol, "alice", Action::Leave),
            Err(Refusal::Forbidden("The creator cannot be removed"))
        );
    }

    #[test]
    fn test_destroy_channel() {
        let t = TestRouter::new();
        t.login_new("alice", peer(1));
        t.login_new("bob", peer(2));
        t.send(OpType::Create, CHANNEL, &["gen", "alice", "0"], peer(1));
        t.send(OpType::Create, ObjectType::Message, &["alice", "gen", "hi", "10"], peer(1));

        assert!(t.send(OpType::Destroy, CHANNEL, &["gen"], peer(2)).starts_with("403\x03"));
        assert_eq!(
            t.send(OpType::Destroy, CHANNEL, &["gen"], peer(1)),
            "200\x03Channel deleted.\x03"
        );
        assert!(t.router.stores().messages.scan(|_| true).unwrap().is_empty());
        assert!(t.send(OpType::Destroy, CHANNEL, &["gen"], peer(1)).starts_with("404\x03"));
    }

    #[test]
    fn test_reused_name_does_not_inherit_channel_rights() {
        let t = TestRouter::new();
        t.login_new("alice", peer(1));
        t.login_new("bob", peer(2));
        t.send(OpType::Create, CHANNEL, &["gen", "alice", "1"], peer(1));
        t.send(OpType::Update, CHANNEL, &["gen", "bob", "JOIN"], peer(1));
        t.send(OpType::Update, CHANNEL, &["gen", "bob", "PROMOTE"], peer(1));
        assert_eq!(
            t.send(OpType::Destroy, ObjectType::User, &["alice"], peer(1)),
            "200\x03User deleted.\x03"
        );

        let channel = t.router.stores().channels.find_by_name("gen").unwrap().found().unwrap();
        assert_eq!(channel.creator, "");
        assert_eq!(channel.users, vec!["bob"]);
        assert_eq!(channel.administrators, vec!["bob"]);

        // Someone else registers the freed name
        let created = t.send(OpType::Create, ObjectType::User, &["tok_new", "alice", "password1"], peer(3));
        assert!(created.starts_with("201\x03"));
        t.send(OpType::Create, ObjectType::Auth, &["tok_new", "password1"], peer(3));
        assert!(t.send(OpType::Destroy, CHANNEL, &["gen"], peer(3)).starts_with("403\x03"));
        assert!(t.send(OpType::Read, CHANNEL, &["gen"], peer(3)).starts_with("403\x03"));

        // The remaining administrator still moderates
        assert_eq!(
            t.send(OpType::Destroy, CHANNEL, &["gen"], peer(2)),
            "200\x03Channel deleted.\x03"
        );
    }

    #[test]
    fn test_rename_carries_into_channels() {
        let t = TestRouter::new();
        t.login_new("alice", peer(1));
        t.login_new("bob", peer(2));
        t.send(OpType::Create, CHANNEL, &["gen", "alice", "0"], peer(1));
        t.send(OpType::Update, CHANNEL, &["gen", "bob", "JOIN"], peer(2));

        assert_eq!(
            t.send(OpType::Update, ObjectType::User, &["alice", "alicia", "0"], peer(1)),
            "200\x03User updated.\x03"
        );
        let channel = t.router.stores().channels.find_by_name("gen").unwrap().found().unwrap();
        assert_eq!(channel.creator, "alicia");
        assert_eq!(channel.users, vec!["alicia", "bob"]);
        assert_eq!(channel.administrators, vec!["alicia"]);

        // The renamed creator keeps moderating; the old name means nothing
        t.send(OpType::Create, ObjectType::User, &["tok_other", "alice", "password1"], peer(3));
        t.send(OpType::Create, ObjectType::Auth, &["tok_other", "password1"], peer(3));
        assert!(t.send(OpType::Update, CHANNEL, &["gen", "bob", "BAN"], peer(3)).starts_with("403\x03"));
        assert_eq!(
            t.send(OpType::Update, CHANNEL, &["gen", "bob", "BAN"], peer(1)),
            "200\x03Channel updated.\x03"
        );
    }
}
