//! Outbound calls. Each operation opens a short-lived connection to one
//! peer, sends a single request, reads a single reply, and closes.
use std::net;
use std::net::TcpStream;
use std::time;

use serde::de::DeserializeOwned;

use crate::service::message::{Entry, NodeList, Request, Response};
use crate::wire;

/// How long to wait for a peer to accept a connection.
pub const CONNECT_TIMEOUT: time::Duration = time::Duration::from_secs(2);
/// How long to wait for a peer to produce or consume a message.
pub const IO_TIMEOUT: time::Duration = time::Duration::from_secs(2);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Wire(#[from] wire::Error),
    /// The peer answered with a reply of the wrong kind.
    #[error("unexpected reply to {request}")]
    UnexpectedReply { request: &'static str },
}

impl Error {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Wire(e) if e.is_unreachable())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Wire(e) if e.is_timeout())
    }
}

/// Exchange one request for one reply with the peer at `addr`.
pub fn call<T: DeserializeOwned>(addr: net::SocketAddr, request: &Request) -> Result<T, Error> {
    let mut stream =
        TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(wire::Error::from)?;
    stream
        .set_read_timeout(Some(IO_TIMEOUT))
        .map_err(wire::Error::from)?;
    stream
        .set_write_timeout(Some(IO_TIMEOUT))
        .map_err(wire::Error::from)?;

    log::trace!(target: "client", "Calling {addr} with {request:?}");

    wire::send(&stream, request)?;
    Ok(wire::recv(&mut stream)?)
}

/// Ask the peer at `addr` for its view of the network, introducing
/// ourselves in the process.
pub fn get_nodes(addr: net::SocketAddr, nickname: &str, port: u16) -> Result<NodeList, Error> {
    call(
        addr,
        &Request::GetNodes {
            nickname: nickname.to_owned(),
            port: Some(port),
        },
    )
}

/// Announce ourselves to the peer at `addr`; returns its next free slot
/// index.
pub fn new_node(addr: net::SocketAddr, nickname: &str, port: u16) -> Result<u64, Error> {
    match call(
        addr,
        &Request::NewNode {
            nickname: nickname.to_owned(),
            port: Some(port),
        },
    )? {
        Response::SystemIndex { index } => Ok(index),
        _ => Err(Error::UnexpectedReply { request: "NEW_NODE" }),
    }
}

/// Fetch the full commit log of the peer at `addr`.
pub fn get_history(addr: net::SocketAddr) -> Result<Vec<Entry>, Error> {
    match call(addr, &Request::GetHistory)? {
        Response::History { history } => Ok(history),
        _ => Err(Error::UnexpectedReply {
            request: "GET_HISTORY",
        }),
    }
}
