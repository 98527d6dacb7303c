//! AUTH handlers: login, password change, logout
//!
//! Passwords arrive in clear on the wire and are stored as Argon2id PHC
//! strings.

use super::{validate, HandlerResult, Request, Response, Router, Status};
use crate::store::{Bind, Lookup};
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, Version};
use tracing::{debug, info, warn};

/// Password hashing with a fixed cost
#[derive(Clone)]
pub struct Passwords {
    argon2: Argon2<'static>,
}

impl Passwords {
    /// `memory_kib` is the Argon2 memory cost
    pub fn new(memory_kib: u32) -> Result<Self, argon2::Error> {
        let params = Params::new(memory_kib, 2, 1, None)?;
        Ok(Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }

    pub fn hash(&self, password: &str) -> Result<String, argon2::password_hash::Error> {
        let salt = SaltString::generate(&mut OsRng);
        Ok(self.argon2.hash_password(password.as_bytes(), &salt)?.to_string())
    }

    /// Whether `password` matches `stored`; a malformed hash never matches
    pub fn verify(&self, password: &str, stored: &str) -> bool {
        match PasswordHash::new(stored) {
            Ok(parsed) => self
                .argon2
                .verify_password(password.as_bytes(), &parsed)
                .is_ok(),
            Err(e) => {
                warn!(error = %e, "stored password hash is malformed");
                false
            }
        }
    }
}

impl std::fmt::Debug for Passwords {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Passwords").finish_non_exhaustive()
    }
}

/// CREATE AUTH: `login_token, password`
pub(super) fn login(router: &Router, req: &Request<'_>) -> HandlerResult {
    let [token, password] = req.fields else {
        return Ok(Response::invalid_count());
    };
    if !validate::name(token) || !validate::password(password) {
        return Ok(Response::invalid_fields());
    }

    let stores = router.stores();
    let Lookup::Found(auth) = stores.auth.find_by_name(token)? else {
        debug!(peer = %req.peer, "login with unknown token");
        return Ok(Response::forbidden("Invalid credentials"));
    };
    if !router.passwords.verify(password, &auth.password_hash) {
        debug!(peer = %req.peer, user_id = auth.user_id, "login with wrong password");
        return Ok(Response::forbidden("Invalid credentials"));
    }

    let mut users = stores.users.lock()?;
    let Lookup::Found(mut user) = users.read(auth.user_id)? else {
        users.close()?;
        warn!(user_id = auth.user_id, "credentials without a user record");
        return Ok(Response::forbidden("Invalid credentials"));
    };
    let already_online = user.is_online();
    user.online_status = 1;
    users.update(&user)?;
    // Bound under the users lock so a concurrent disconnect cannot clear
    // the flag between the two writes
    let bind = stores.sessions.bind(req.peer, user.id, already_online)?;
    users.close()?;

    match bind {
        Bind::Replaced { evicted } if evicted > 0 => {
            info!(user = %user.display_name, peer = %req.peer, evicted, "re-login replaced earlier session")
        }
        _ => info!(user = %user.display_name, peer = %req.peer, "logged in"),
    }

    Ok(Response::new(
        Status::Ok,
        vec![
            user.id.to_string(),
            user.display_name,
            user.privilege_level.to_string(),
            user.online_status.to_string(),
        ],
    ))
}

/// UPDATE AUTH: `login_token, old_password, new_password`
pub(super) fn change_password(router: &Router, req: &Request<'_>) -> HandlerResult {
    let [token, old, new] = req.fields else {
        return Ok(Response::invalid_count());
    };
    if !validate::name(token) || !validate::password(old) || !validate::password(new) {
        return Ok(Response::invalid_fields());
    }

    let stores = router.stores();
    let Lookup::Found(mut auth) = stores.auth.find_by_name(token)? else {
        return Ok(Response::forbidden("Invalid credentials"));
    };
    if !router.passwords.verify(old, &auth.password_hash) {
        return Ok(Response::forbidden("Invalid credentials"));
    }
    auth.password_hash = match router.passwords.hash(new) {
        Ok(hash) => hash,
        Err(e) => {
            warn!(error = %e, "password hashing failed");
            return Ok(Response::internal());
        }
    };
    stores.auth.update(&auth)?;
    debug!(user_id = auth.user_id, "password changed");
    Ok(Response::text(Status::Ok, "Password updated."))
}

/// DESTROY AUTH: `display_name`
///
/// Ends every session of the named user and clears their online flag. A
/// user may log themselves out; a global admin may log out anyone.
pub(super) fn logout(router: &Router, req: &Request<'_>) -> HandlerResult {
    let [name] = req.fields else {
        return Ok(Response::invalid_count());
    };
    if !validate::name(name) {
        return Ok(Response::invalid_fields());
    }

    let stores = router.stores();
    let Lookup::Found(target) = stores.users.find_by_name(name)? else {
        return Ok(Response::not_found("User not found"));
    };
    let Some(requester) = router.requester(req.peer)? else {
        return Ok(Response::forbidden("Not logged in"));
    };
    if requester.id != target.id && !requester.is_admin() {
        return Ok(Response::forbidden("Cannot log out another user"));
    }

    let ended = stores.sessions.unbind_user(target.id)?;
    router.set_offline(target.id)?;
    info!(user = %target.display_name, ended, "logged out");
    Ok(Response::text(Status::Ok, "Logged out."))
}
