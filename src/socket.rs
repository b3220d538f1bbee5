//! Byte stream sockets.
//!
//! A socket has one reader slot (a read or an accept) and one writer slot.
//! Starting a second operation while one is pending is a usage error that is
//! reported immediately. Operations that can fail at the I/O level return an
//! [`Event`] that fails instead.

pub mod ssl;
pub mod tcp;
pub mod virtual_tcp;

use crate::{
    core::{Environment, Event},
    error::Error,
};
use std::{net::SocketAddr, rc::Rc};

pub use ssl::{TlsProvider, TlsSession, TlsStatus, Transport};
pub use tcp::TcpSocket;
pub use virtual_tcp::VirtualSocket;

pub type SharedSocket = Rc<dyn Socket>;

pub trait Socket {
    fn env(&self) -> &Environment;

    fn bind(&self, address: SocketAddr) -> Result<(), Error>;

    fn listen(&self, backlog: usize) -> Result<(), Error>;

    /// Waits for an incoming connection.
    fn accept(&self) -> Result<Event<SharedSocket>, Error>;

    fn connect(&self, address: SocketAddr) -> Result<(), Error>;

    /// Succeeds as soon as at least one and at most `amount` bytes are
    /// available. A peer that closed the connection fails the read with a
    /// connection reset instead of producing an empty read.
    fn read(&self, amount: usize) -> Result<Event<Vec<u8>>, Error>;

    /// Succeeds with the number of bytes written, which may be less than
    /// `data.len()`.
    fn write(&self, data: &[u8]) -> Result<Event<usize>, Error>;

    /// Fails pending operations with [`Error::BadDescriptor`]. Closing twice
    /// does nothing.
    fn close(&self);

    fn address(&self) -> Result<SocketAddr, Error>;

    fn peer_address(&self) -> Result<SocketAddr, Error>;
}

/// Creates sockets for a backend.
pub trait Network {
    fn socket(&self, env: &Environment) -> Result<SharedSocket, Error>;
}
