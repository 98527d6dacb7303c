//! USER handlers

use super::{channels, validate, HandlerResult, Request, Response, Router, Status};
use crate::store::{Auth, Created, Lookup, User};
use tracing::{info, warn};

/// Conflict sub-codes of CREATE USER
const TOKEN_TAKEN: u8 = 1;
const NAME_TAKEN: u8 = 2;

fn user_fields(user: User) -> Vec<String> {
    vec![
        user.id.to_string(),
        user.display_name,
        user.privilege_level.to_string(),
        user.online_status.to_string(),
    ]
}

/// CREATE USER: `login_token, display_name, password`
///
/// The user and its credentials are written together or not at all. Both
/// stores stay locked (auth first, then users) from the name checks to the
/// last insert.
pub(super) fn create(router: &Router, req: &Request<'_>) -> HandlerResult {
    let [token, name, password] = req.fields else {
        return Ok(Response::invalid_count());
    };
    if !validate::name(token) || !validate::name(name) || !validate::password(password) {
        return Ok(Response::invalid_fields());
    }

    // Hash before taking any lock; it is the slow part
    let password_hash = match router.passwords.hash(password) {
        Ok(hash) => hash,
        Err(e) => {
            warn!(error = %e, "password hashing failed");
            return Ok(Response::internal());
        }
    };

    let stores = router.stores();
    let mut auth = stores.auth.lock()?;
    let mut users = stores.users.lock()?;

    let mut conflict = 0;
    if auth.find_by_name(token)?.is_found() {
        conflict |= TOKEN_TAKEN;
    }
    if users.find_by_name(name)?.is_found() {
        conflict |= NAME_TAKEN;
    }
    if conflict != 0 {
        users.close()?;
        auth.close()?;
        return Ok(Response::new(Status::Conflict, vec![conflict.to_string()]));
    }

    let user = match users.create(User::new(name))? {
        Created::Inserted(user) => user,
        Created::Duplicate | Created::DuplicateId => {
            users.close()?;
            auth.close()?;
            return Ok(Response::new(Status::Conflict, vec![NAME_TAKEN.to_string()]));
        }
    };
    let credentials = Auth {
        user_id: user.id,
        login_token: token.clone(),
        password_hash,
    };
    if let Created::DuplicateId = auth.insert(credentials)? {
        // Stale credentials under a fresh user id: undo the user insert
        warn!(user_id = user.id, "credentials already stored for new user id");
        users.delete(user.id)?;
        users.close()?;
        auth.close()?;
        return Ok(Response::internal());
    }
    users.close()?;
    auth.close()?;

    info!(user = %user.display_name, id = user.id, "user created");
    Ok(Response::text(Status::Created, "User created."))
}

/// READ USER: `display_name`
pub(super) fn read(router: &Router, req: &Request<'_>) -> HandlerResult {
    let [name] = req.fields else {
        return Ok(Response::invalid_count());
    };
    if !validate::name(name) {
        return Ok(Response::invalid_fields());
    }
    match router.stores().users.find_by_name(name)? {
        Lookup::Found(user) => Ok(Response::new(Status::Ok, user_fields(user))),
        Lookup::NotFound => Ok(Response::not_found("User not found")),
    }
}

/// UPDATE USER: `display_name, new_display_name, privilege_level`
///
/// Users may rename themselves. Only a global admin may update someone
/// else or change a privilege level. A rename is carried into every channel
/// naming the user.
pub(super) fn update(router: &Router, req: &Request<'_>) -> HandlerResult {
    let [name, new_name, privilege] = req.fields else {
        return Ok(Response::invalid_count());
    };
    if !validate::name(name) || !validate::name(new_name) {
        return Ok(Response::invalid_fields());
    }
    let Some(privilege) = validate::privilege(privilege) else {
        return Ok(Response::invalid_fields());
    };

    let Some(requester) = router.requester(req.peer)? else {
        return Ok(Response::forbidden("Not logged in"));
    };
    if !requester.is_admin() && requester.display_name != *name {
        return Ok(Response::forbidden("Cannot update another user"));
    }

    let mut users = router.stores().users.lock()?;
    let Lookup::Found(mut user) = users.find_by_name(name)? else {
        users.close()?;
        return Ok(Response::not_found("User not found"));
    };
    if !requester.is_admin() && privilege != user.privilege_level {
        users.close()?;
        return Ok(Response::forbidden("Cannot change privilege level"));
    }
    if new_name != name && users.find_by_name(new_name)?.is_found() {
        users.close()?;
        return Ok(Response::new(Status::Conflict, vec![NAME_TAKEN.to_string()]));
    }
    user.display_name = new_name.clone();
    user.privilege_level = privilege;
    users.update(&user)?;
    if new_name != name {
        channels::relabel_member(router, name, Some(new_name))?;
    }
    users.close()?;

    info!(old = %name, new = %new_name, privilege, "user updated");
    Ok(Response::text(Status::Ok, "User updated."))
}

/// DESTROY USER: `display_name`
///
/// Removes the user, its credentials and any session bound to it. The name
/// is dropped from every channel, so whoever registers it next starts with
/// no channel rights.
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
    if !requester.is_admin() && requester.display_name != *name {
        return Ok(Response::forbidden("Cannot delete another user"));
    }

    let stores = router.stores();
    let mut auth = stores.auth.lock()?;
    let mut users = stores.users.lock()?;
    let Lookup::Found(user) = users.find_by_name(name)? else {
        users.close()?;
        auth.close()?;
        return Ok(Response::not_found("User not found"));
    };
    users.delete(user.id)?;
    auth.delete(user.id)?;
    channels::relabel_member(router, &user.display_name, None)?;
    users.close()?;
    auth.close()?;

    let ended = stores.sessions.unbind_user(user.id)?;
    info!(user = %user.display_name, id = user.id, ended, "user deleted");
    Ok(Response::text(Status::Ok, "User deleted."))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{peer, TestRouter};
    use crate::server::protocol::{ObjectType, OpType};

    const CREATE: OpType = OpType::Create;
    const USER: ObjectType = ObjectType::User;

    #[test]
    fn test_create_user() {
        let t = TestRouter::new();
        let body = t.send(CREATE, USER, &["tok1", "alice", "password1"], peer(1));
        assert_eq!(body, "201\x03User created.\x03");
        let auth = t.router.stores().auth.find_by_name("tok1").unwrap().found().unwrap();
        let user = t.router.stores().users.find_by_name("alice").unwrap().found().unwrap();
        assert_eq!(auth.user_id, user.id);
        assert_ne!(auth.password_hash, "password1");
    }

    #[test]
    fn test_create_conflict_subcodes() {
        let t = TestRouter::new();
        t.send(CREATE, USER, &["tok1", "alice", "password1"], peer(1));

        let both = t.send(CREATE, USER, &["tok1", "alice", "password1"], peer(1));
        assert_eq!(both, "409\x033\x03");
        let token = t.send(CREATE, USER, &["tok1", "bob", "password1"], peer(1));
        assert_eq!(token, "409\x031\x03");
        let name = t.send(CREATE, USER, &["tok2", "alice", "password1"], peer(1));
        assert_eq!(name, "409\x032\x03");

        // No partial inserts
        assert_eq!(t.router.stores().users.scan(|_| true).unwrap().len(), 1);
        assert_eq!(t.router.stores().auth.scan(|_| true).unwrap().len(), 1);
    }

    #[test]
    fn test_create_validation() {
        let t = TestRouter::new();
        let body = t.send(CREATE, USER, &["tok1", "alice"], peer(1));
        assert_eq!(body, "400\x03Invalid number of fields\x03");
        let body = t.send(CREATE, USER, &["tok1", &"a".repeat(21), "password1"], peer(1));
        assert_eq!(body, "400\x03Invalid fields\x03");
        let body = t.send(CREATE, USER, &["tok1", "alice", "short"], peer(1));
        assert_eq!(body, "400\x03Invalid fields\x03");
        let body = t.send(CREATE, USER, &["", "alice", "password1"], peer(1));
        assert_eq!(body, "400\x03Invalid fields\x03");
    }

    #[test]
    fn test_read_user() {
        let t = TestRouter::new();
        t.send(CREATE, USER, &["tok1", "alice", "password1"], peer(1));
        let body = t.send(OpType::Read, USER, &["alice"], peer(2));
        assert_eq!(body, "200\x031\x03alice\x030\x030\x03");
        let body = t.send(OpType::Read, USER, &["nobody"], peer(2));
        assert_eq!(body, "404\x03User not found\x03");
    }

    #[test]
    fn test_update_self_rename() {
        let t = TestRouter::new();
        t.login_new("alice", peer(1));
        t.login_new("bob", peer(2));

        let body = t.send(OpType::Update, USER, &["alice", "bob", "0"], peer(1));
        assert_eq!(body, "409\x032\x03");
        let body = t.send(OpType::Update, USER, &["alice", "alicia", "0"], peer(1));
        assert_eq!(body, "200\x03User updated.\x03");
        assert!(t.router.stores().users.find_by_name("alicia").unwrap().is_found());

        let body = t.send(OpType::Update, USER, &["alicia", "alicia", "1"], peer(1));
        assert_eq!(body, "403\x03Cannot change privilege level\x03");
        let body = t.send(OpType::Update, USER, &["bob", "robert", "0"], peer(1));
        assert_eq!(body, "403\x03Cannot update another user\x03");
        let body = t.send(OpType::Update, USER, &["bob", "robert", "0"], peer(9));
        assert_eq!(body, "403\x03Not logged in\x03");
    }

    #[test]
    fn test_admin_updates_others() {
        let t = TestRouter::new();
        let admin = t.login_new("root", peer(1));
        t.make_admin(admin);
        t.login_new("bob", peer(2));
        let body = t.send(OpType::Update, USER, &["bob", "bob", "1"], peer(1));
        assert_eq!(body, "200\x03User updated.\x03");
        let bob = t.router.stores().users.find_by_name("bob").unwrap().found().unwrap();
        assert!(bob.is_admin());
        let body = t.send(OpType::Update, USER, &["ghost", "ghost", "0"], peer(1));
        assert_eq!(body, "404\x03User not found\x03");
    }

    #[test]
    fn test_destroy_user_removes_everything() {
        let t = TestRouter::new();
        let id = t.login_new("alice", peer(1));
        let body = t.send(OpType::Destroy, USER, &["alice"], peer(1));
        assert_eq!(body, "200\x03User deleted.\x03");
        let stores = t.router.stores();
        assert!(!stores.users.read(id).unwrap().is_found());
        assert!(!stores.auth.read(id).unwrap().is_found());
        assert!(!stores.sessions.lookup(peer(1)).unwrap().is_found());

        // Name and token are free again
        let body = t.send(CREATE, USER, &["tok_alice", "alice", "password1"], peer(1));
        assert_eq!(body, "201\x03User created.\x03");
    }

    #[test]
    fn test_destroy_other_user_forbidden() {
        let t = TestRouter::new();
        t.login_new("alice", peer(1));
        t.login_new("bob", peer(2));
        let body = t.send(OpType::Destroy, USER, &["alice"], peer(2));
        assert!(body.starts_with("403\x03"));
    }
}
