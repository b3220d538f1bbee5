//! The seam between OS sockets and a TLS library.
//!
//! The crate does no cryptography. A [`TlsProvider`] hands out sessions and
//! the socket orchestrates them: while a session is handshaking, readiness
//! is redirected to the handshake step and reads and writes are parked.
//! Once the handshake is done the parked operations are retried.

use crate::{core::Event, error::Error};
use rustix::{
    fd::BorrowedFd,
    net::{RecvFlags, SendFlags},
};
use std::{fmt, io, rc::Rc};

/// Outcome of a single non-blocking TLS step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsStatus<T> {
    Ready(T),
    /// The step has to be retried once the socket is readable.
    WantRead,
    /// The step has to be retried once the socket is writable.
    WantWrite,
}

/// Raw, non-blocking access to the socket underneath a session. Reads and
/// writes that would block fail with [`io::ErrorKind::WouldBlock`].
pub trait Transport: io::Read + io::Write {}

impl<T: io::Read + io::Write> Transport for T {}

pub trait TlsSession {
    fn handshake(&mut self, transport: &mut dyn Transport) -> Result<TlsStatus<()>, Error>;

    /// Reads decrypted data. `Ready(0)` means the peer closed the session.
    fn read(
        &mut self,
        transport: &mut dyn Transport,
        buf: &mut [u8],
    ) -> Result<TlsStatus<usize>, Error>;

    fn write(&mut self, transport: &mut dyn Transport, data: &[u8])
        -> Result<TlsStatus<usize>, Error>;
}

pub trait TlsProvider {
    fn client(&self) -> Result<Box<dyn TlsSession>, Error>;

    fn server(&self) -> Result<Box<dyn TlsSession>, Error>;
}

pub(crate) struct FdTransport<'fd>(pub(crate) BorrowedFd<'fd>);

impl io::Read for FdTransport<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(rustix::net::recv(self.0, buf, RecvFlags::empty())?)
    }
}

impl io::Write for FdTransport<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        Ok(rustix::net::send(self.0, data, SendFlags::NOSIGNAL)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub(crate) enum Phase {
    /// Waiting for `connect` to start a client handshake.
    Idle,
    Handshaking,
    Established,
    Failed(Error),
}

/// TLS state of one socket.
pub(crate) struct Tls {
    pub(crate) provider: Rc<dyn TlsProvider>,
    pub(crate) session: Option<Box<dyn TlsSession>>,
    pub(crate) phase: Phase,
    pub(crate) done: Option<Event<()>>,
}

impl Tls {
    pub(crate) fn new(provider: Rc<dyn TlsProvider>) -> Self {
        Self {
            provider,
            session: None,
            phase: Phase::Idle,
            done: None,
        }
    }

    pub(crate) fn handshaking(&self) -> bool {
        matches!(self.phase, Phase::Handshaking)
    }

    pub(crate) fn failure(&self) -> Option<Error> {
        match &self.phase {
            Phase::Failed(e) => Some(e.clone()),
            _ => None,
        }
    }

    /// The established session, if reads and writes may go through it.
    pub(crate) fn established(&mut self) -> Option<&mut Box<dyn TlsSession>> {
        match self.phase {
            Phase::Established => self.session.as_mut(),
            _ => None,
        }
    }
}

impl fmt::Debug for Tls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self.phase {
            Phase::Idle => "idle",
            Phase::Handshaking => "handshaking",
            Phase::Established => "established",
            Phase::Failed(_) => "failed",
        };
        f.debug_struct("Tls").field("phase", &phase).finish()
    }
}
