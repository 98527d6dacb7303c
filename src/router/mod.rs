//! Dispatch router
//!
//! Turns one decoded request into one response. The router switches on the
//! operation, then the object, and hands the fields to a handler. Handlers
//! answer validation and business failures with a status code; only storage
//! failures come back as `Err`, which the worker turns into a 500.

mod auth;
mod channels;
mod messages;
mod users;
pub mod validate;

pub use auth::Passwords;

use crate::server::protocol::{Dispatch, ObjectType, OpType, ProtocolError, MAX_BODY_SIZE};
use crate::store::{Lookup, StoreError, Stores, User};
use std::fmt;
use std::net::SocketAddrV4;
use tracing::{debug, warn};

/// Response status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Created,
    BadRequest,
    Forbidden,
    NotFound,
    Conflict,
    Internal,
    NotImplemented,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::Created => 201,
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::Conflict => 409,
            Status::Internal => 500,
            Status::NotImplemented => 501,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            200 => Status::Ok,
            201 => Status::Created,
            400 => Status::BadRequest,
            403 => Status::Forbidden,
            404 => Status::NotFound,
            409 => Status::Conflict,
            500 => Status::Internal,
            501 => Status::NotImplemented,
            _ => return None,
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Status plus payload fields, before framing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub payload: Vec<String>,
}

impl Response {
    pub fn new(status: Status, payload: Vec<String>) -> Self {
        Self { status, payload }
    }

    pub fn text(status: Status, text: &str) -> Self {
        Self::new(status, vec![text.to_string()])
    }

    pub fn invalid_count() -> Self {
        Self::text(Status::BadRequest, "Invalid number of fields")
    }

    pub fn invalid_fields() -> Self {
        Self::text(Status::BadRequest, "Invalid fields")
    }

    pub fn forbidden(reason: &str) -> Self {
        Self::text(Status::Forbidden, reason)
    }

    pub fn not_found(what: &str) -> Self {
        Self::text(Status::NotFound, what)
    }

    pub fn internal() -> Self {
        Self::text(Status::Internal, "Internal server error")
    }

    pub fn not_implemented() -> Self {
        Self::text(Status::NotImplemented, "Not implemented")
    }

    pub fn into_dispatch(self, request: &Dispatch) -> Dispatch {
        Dispatch::response(request, self.status.code(), &self.payload)
    }
}

pub type HandlerResult = Result<Response, StoreError>;

/// Everything a handler needs to serve one request
pub struct Request<'a> {
    pub fields: &'a [String],
    pub peer: SocketAddrV4,
}

/// Routes dispatches to handlers over a shared set of stores
pub struct Router {
    stores: Stores,
    passwords: Passwords,
}

impl Router {
    pub fn new(stores: Stores, passwords: Passwords) -> Self {
        Self { stores, passwords }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Serve one request from `peer`
    pub fn route(&self, request: &Dispatch, peer: SocketAddrV4) -> Result<Dispatch, StoreError> {
        let fields = match request.fields() {
            Ok(fields) => fields,
            Err(ProtocolError::InvalidField { index }) => {
                debug!(%peer, index, "undecodable field");
                return Ok(Response::invalid_fields().into_dispatch(request));
            }
            Err(e) => {
                warn!(%peer, error = %e, "cannot split body");
                return Ok(Response::invalid_fields().into_dispatch(request));
            }
        };
        let req = Request {
            fields: &fields,
            peer,
        };

        let response = match request.op {
            OpType::Create => match request.object {
                ObjectType::User => users::create(self, &req)?,
                ObjectType::Auth => auth::login(self, &req)?,
                ObjectType::Channel => channels::create(self, &req)?,
                ObjectType::Message => messages::create(self, &req)?,
                ObjectType::Other(_) => Response::not_implemented(),
            },
            OpType::Read => match request.object {
                ObjectType::User => users::read(self, &req)?,
                ObjectType::Channel => channels::read(self, &req)?,
                ObjectType::Message => messages::read(self, &req)?,
                ObjectType::Auth | ObjectType::Other(_) => Response::not_implemented(),
            },
            OpType::Update => match request.object {
                ObjectType::User => users::update(self, &req)?,
                ObjectType::Auth => auth::change_password(self, &req)?,
                ObjectType::Channel => channels::update(self, &req)?,
                ObjectType::Message | ObjectType::Other(_) => Response::not_implemented(),
            },
            OpType::Destroy => match request.object {
                ObjectType::User => users::destroy(self, &req)?,
                ObjectType::Auth => auth::logout(self, &req)?,
                ObjectType::Channel => channels::destroy(self, &req)?,
                ObjectType::Message => messages::destroy(self, &req)?,
                ObjectType::Other(_) => Response::not_implemented(),
            },
            // Fan-out to other connections is not served by workers
            OpType::PingUser | OpType::PingChannel | OpType::Other(_) => Response::not_implemented(),
        };

        debug!(
            %peer,
            op = %request.op,
            object = %request.object,
            status = response.status.code(),
            "dispatch served"
        );
        let reply = response.into_dispatch(request);
        if reply.body_size() > MAX_BODY_SIZE {
            warn!(
                %peer,
                op = %request.op,
                object = %request.object,
                size = reply.body_size(),
                "response does not fit in one frame"
            );
            return Ok(Response::internal().into_dispatch(request));
        }
        Ok(reply)
    }

    /// The connection at `peer` went away: end its session
    pub fn disconnect(&self, peer: SocketAddrV4) -> Result<Option<u32>, StoreError> {
        let Some(user_id) = self.stores.sessions.unbind(peer)? else {
            return Ok(None);
        };
        self.set_offline(user_id)?;
        debug!(%peer, user_id, "session ended by disconnect");
        Ok(Some(user_id))
    }

    /// The user logged in over `peer`, if any
    fn requester(&self, peer: SocketAddrV4) -> Result<Option<User>, StoreError> {
        match self.stores.sessions.lookup(peer)? {
            Lookup::Found(id) => Ok(self.stores.users.read(id)?.found()),
            Lookup::NotFound => Ok(None),
        }
    }

    /// Clear the online flag of `user_id` if nothing else maps to it
    ///
    /// The check runs under the users lock, which logins also hold while
    /// binding, so a login racing this call is never marked offline.
    fn set_offline(&self, user_id: u32) -> Result<(), StoreError> {
        let mut users = self.stores.users.lock()?;
        if self.stores.sessions.is_bound(user_id)? {
            return users.close();
        }
        if let Lookup::Found(mut user) = users.read(user_id)? {
            if user.online_status != 0 {
                user.online_status = 0;
                users.update(&user)?;
            }
        }
        users.close()
    }

    /// Forget every session left over from a previous run
    ///
    /// No connection survives a restart, so every pair is stale and nobody
    /// is online. Returns how many pairs were dropped.
    pub fn reset_sessions(&self) -> Result<usize, StoreError> {
        let mut users = self.stores.users.lock()?;
        let dropped = self.stores.sessions.clear()?;
        for mut user in users.scan(|u: &User| u.is_online())? {
            user.online_status = 0;
            users.update(&user)?;
        }
        users.close()?;
        Ok(dropped)
    }
}
