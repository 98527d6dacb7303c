//! chatd client
//!
//! Synchronous client for one server connection: send a dispatch, wait for
//! the response. Used by `chatctl` and the end-to-end tests.

use crate::error::Result;
use crate::server::protocol::{
    read_dispatch, write_dispatch, Dispatch, ObjectType, OpType, ProtocolError, MAX_BODY_SIZE,
};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::trace;

/// A decoded response: status code plus payload fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub fields: Vec<String>,
}

impl Reply {
    /// Split a response body into status and payload
    pub fn from_dispatch(dispatch: &Dispatch) -> std::result::Result<Self, ProtocolError> {
        let mut fields = dispatch.fields()?;
        if fields.is_empty() {
            return Err(ProtocolError::InvalidField { index: 0 });
        }
        let status = fields
            .remove(0)
            .parse()
            .map_err(|_| ProtocolError::InvalidField { index: 0 })?;
        Ok(Self { status, fields })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The first payload field, or an empty string
    pub fn text(&self) -> &str {
        self.fields.first().map(String::as_str).unwrap_or("")
    }
}

/// Client for one connection to a chatd server
pub struct ChatClient {
    stream: TcpStream,
}

impl ChatClient {
    /// Connect to the server
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// Bound how long `request` waits for a response
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    /// Send one dispatch and read the response frame
    pub fn send(&mut self, request: &Dispatch) -> Result<Dispatch> {
        write_dispatch(&mut self.stream, request)?;
        let response = read_dispatch(&mut self.stream, MAX_BODY_SIZE)?;
        trace!(op = %response.op, object = %response.object, size = response.body_size(), "response received");
        Ok(response)
    }

    /// Send `fields` as an `op`/`object` request and decode the reply
    pub fn request<S: AsRef<str>>(&mut self, op: OpType, object: ObjectType, fields: &[S]) -> Result<Reply> {
        let response = self.send(&Dispatch::with_fields(op, object, fields))?;
        Ok(Reply::from_dispatch(&response)?)
    }

    /// Write raw bytes, bypassing the codec
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        use std::io::Write;
        self.stream.write_all(bytes)?;
        Ok(())
    }

    /// Close the connection; the server ends any session bound to it
    pub fn close(self) -> Result<()> {
        self.stream.shutdown(Shutdown::Both)?;
        Ok(())
    }
}
