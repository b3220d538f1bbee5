//! Non-blocking OS TCP sockets, shared by the select, poll and dispatch
//! backends.
//!
//! Every operation is attempted right away. Only when the kernel reports
//! that it would block does the socket ask the backend for readiness, and
//! the backend's notification retries the pending operation.

use super::{
    ssl::{FdTransport, Phase, Tls, TlsProvider, TlsStatus},
    Network, SharedSocket, Socket,
};
use crate::{
    backend::Interest,
    core::{Environment, Event, Ready},
    error::{ConnectionError, Error, UsageError},
};
use rustix::{
    fd::{AsFd, AsRawFd, OwnedFd, RawFd},
    io::Errno,
    net::{
        AddressFamily, RecvFlags, SendFlags, SocketAddrAny, SocketFlags, SocketType,
    },
};
use std::{
    cell::{Cell, RefCell},
    net::SocketAddr,
    rc::Rc,
};

/// Creates [`TcpSocket`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsNetwork;

impl Network for OsNetwork {
    fn socket(&self, env: &Environment) -> Result<SharedSocket, Error> {
        let socket: SharedSocket = TcpSocket::open(env)?;
        Ok(socket)
    }
}

enum Reader {
    Read { amount: usize, event: Event<Vec<u8>> },
    Accept(Event<SharedSocket>),
}

struct Writer {
    data: Vec<u8>,
    event: Event<usize>,
}

/// Result of one non-blocking attempt.
enum Attempt<T> {
    Done(Result<T, Error>),
    Blocked(Interest),
}

pub struct TcpSocket {
    env: Environment,
    fd: RefCell<Option<OwnedFd>>,
    descriptor: RawFd,
    reader: RefCell<Option<Reader>>,
    writer: RefCell<Option<Writer>>,
    read_wait: Cell<Interest>,
    write_wait: Cell<Interest>,
    handshake_wait: Cell<Interest>,
    registered: Cell<Interest>,
    tls: RefCell<Option<Tls>>,
}

fn to_socket_addr(address: SocketAddrAny) -> Result<SocketAddr, Error> {
    match address {
        SocketAddrAny::V4(address) => Ok(SocketAddr::V4(address)),
        SocketAddrAny::V6(address) => Ok(SocketAddr::V6(address)),
        _ => Err(ConnectionError::InvalidArgument.into()),
    }
}

impl TcpSocket {
    pub fn open(env: &Environment) -> Result<Rc<Self>, Error> {
        Self::open_with(env, None)
    }

    /// A socket that runs a TLS handshake after connecting. Sockets accepted
    /// from it run the server side of the handshake.
    pub fn secure(env: &Environment, provider: Rc<dyn TlsProvider>) -> Result<Rc<Self>, Error> {
        Self::open_with(env, Some(Tls::new(provider)))
    }

    fn open_with(env: &Environment, tls: Option<Tls>) -> Result<Rc<Self>, Error> {
        let fd = rustix::net::socket_with(
            AddressFamily::INET,
            SocketType::STREAM,
            SocketFlags::NONBLOCK | SocketFlags::CLOEXEC,
            None,
        )?;
        rustix::net::sockopt::set_socket_reuseaddr(&fd, true)?;
        Ok(Self::from_fd(env, fd, tls))
    }

    fn from_fd(env: &Environment, fd: OwnedFd, tls: Option<Tls>) -> Rc<Self> {
        let descriptor = fd.as_raw_fd();
        let socket = Rc::new(Self {
            env: env.clone(),
            fd: RefCell::new(Some(fd)),
            descriptor,
            reader: RefCell::new(None),
            writer: RefCell::new(None),
            read_wait: Cell::new(Interest::NONE),
            write_wait: Cell::new(Interest::NONE),
            handshake_wait: Cell::new(Interest::NONE),
            registered: Cell::new(Interest::NONE),
            tls: RefCell::new(tls),
        });
        env.register(descriptor, socket.clone());
        tracing::debug!(fd = descriptor, "Opened socket");
        socket
    }

    pub fn descriptor(&self) -> RawFd {
        self.descriptor
    }

    /// Completes once the TLS handshake has finished. Plain sockets succeed
    /// right away.
    pub fn handshake(&self) -> Event<()> {
        let event = self.env.event();
        let mut tls = self.tls.borrow_mut();
        let Some(tls) = tls.as_mut() else {
            event.settle(Ok(()));
            return event;
        };
        if let Some(done) = &tls.done {
            return done.clone();
        }
        match &tls.phase {
            Phase::Established => event.settle(Ok(())),
            Phase::Failed(e) => {
                event.defuse();
                event.settle(Err(e.clone()));
            }
            _ => {
                event.defuse();
                tls.done = Some(event.clone());
            }
        }
        event
    }

    fn start_handshake(&self, server: bool) {
        let session = {
            let mut tls = self.tls.borrow_mut();
            let Some(tls) = tls.as_mut() else { return };
            let session = if server {
                tls.provider.server()
            } else {
                tls.provider.client()
            };
            match session {
                Ok(session) => {
                    tls.session = Some(session);
                    tls.phase = Phase::Handshaking;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };
        match session {
            Ok(()) => self.drive_handshake(),
            Err(e) => self.abort_handshake(e),
        }
    }

    fn drive_handshake(&self) {
        let status = {
            let fd = self.fd.borrow();
            let mut tls = self.tls.borrow_mut();
            match (fd.as_ref(), tls.as_mut().and_then(|tls| tls.session.as_mut())) {
                (Some(fd), Some(session)) => {
                    session.handshake(&mut FdTransport(fd.as_fd()))
                }
                _ => Err(Error::BadDescriptor),
            }
        };
        match status {
            Ok(TlsStatus::Ready(())) => {
                let done = self.tls.borrow_mut().as_mut().and_then(|tls| {
                    tls.phase = Phase::Established;
                    tls.done.take()
                });
                self.handshake_wait.set(Interest::NONE);
                tracing::debug!(fd = self.descriptor, "TLS handshake complete");
                if let Some(done) = done {
                    done.settle(Ok(()));
                }
                self.try_read();
                self.try_write();
            }
            Ok(TlsStatus::WantRead) => self.handshake_wait.set(Interest::READ),
            Ok(TlsStatus::WantWrite) => self.handshake_wait.set(Interest::WRITE),
            Err(e) => self.abort_handshake(e),
        }
        self.update_interest();
    }

    fn abort_handshake(&self, error: Error) {
        tracing::warn!(fd = self.descriptor, "TLS handshake failed: {}", error);
        let done = self.tls.borrow_mut().as_mut().and_then(|tls| {
            tls.phase = Phase::Failed(error.clone());
            tls.session = None;
            tls.done.take()
        });
        self.handshake_wait.set(Interest::NONE);
        if let Some(done) = done {
            done.settle(Err(error.clone()));
        }
        self.fail_pending(error);
    }

    fn handshaking(&self) -> bool {
        self.tls.borrow().as_ref().map_or(false, Tls::handshaking)
    }

    fn receive(&self, amount: usize) -> Attempt<Vec<u8>> {
        let fd = self.fd.borrow();
        let Some(fd) = fd.as_ref() else {
            return Attempt::Done(Err(Error::BadDescriptor));
        };
        let mut tls = self.tls.borrow_mut();
        if tls.as_ref().map_or(false, Tls::handshaking) {
            return Attempt::Blocked(Interest::NONE);
        }
        if let Some(e) = tls.as_ref().and_then(Tls::failure) {
            return Attempt::Done(Err(e));
        }

        let mut buf = vec![0; amount];
        let received = match tls.as_mut().and_then(Tls::established) {
            Some(session) => match session.read(&mut FdTransport(fd.as_fd()), &mut buf) {
                Ok(TlsStatus::Ready(count)) => Ok(count),
                Ok(TlsStatus::WantRead) => return Attempt::Blocked(Interest::READ),
                Ok(TlsStatus::WantWrite) => return Attempt::Blocked(Interest::WRITE),
                Err(e) => Err(e),
            },
            None => match rustix::net::recv(fd, &mut buf, RecvFlags::empty()) {
                Ok(count) => Ok(count),
                Err(Errno::WOULDBLOCK) | Err(Errno::INTR) => {
                    return Attempt::Blocked(Interest::READ)
                }
                Err(errno) => Err(errno.into()),
            },
        };
        Attempt::Done(received.and_then(|count| {
            if count == 0 {
                Err(ConnectionError::Reset.into())
            } else {
                buf.truncate(count);
                Ok(buf)
            }
        }))
    }

    fn send(&self, data: &[u8]) -> Attempt<usize> {
        let fd = self.fd.borrow();
        let Some(fd) = fd.as_ref() else {
            return Attempt::Done(Err(Error::BadDescriptor));
        };
        let mut tls = self.tls.borrow_mut();
        if tls.as_ref().map_or(false, Tls::handshaking) {
            return Attempt::Blocked(Interest::NONE);
        }
        if let Some(e) = tls.as_ref().and_then(Tls::failure) {
            return Attempt::Done(Err(e));
        }

        match tls.as_mut().and_then(Tls::established) {
            Some(session) => match session.write(&mut FdTransport(fd.as_fd()), data) {
                Ok(TlsStatus::Ready(count)) => Attempt::Done(Ok(count)),
                Ok(TlsStatus::WantRead) => Attempt::Blocked(Interest::READ),
                Ok(TlsStatus::WantWrite) => Attempt::Blocked(Interest::WRITE),
                Err(e) => Attempt::Done(Err(e)),
            },
            None => match rustix::net::send(fd, data, SendFlags::NOSIGNAL) {
                Ok(count) => Attempt::Done(Ok(count)),
                Err(Errno::WOULDBLOCK) | Err(Errno::INTR) => Attempt::Blocked(Interest::WRITE),
                Err(errno) => Attempt::Done(Err(errno.into())),
            },
        }
    }

    fn accept_one(&self) -> Attempt<SharedSocket> {
        let accepted = {
            let fd = self.fd.borrow();
            let Some(fd) = fd.as_ref() else {
                return Attempt::Done(Err(Error::BadDescriptor));
            };
            rustix::net::accept_with(fd, SocketFlags::NONBLOCK | SocketFlags::CLOEXEC)
        };
        match accepted {
            Ok(fd) => {
                let provider = self.tls.borrow().as_ref().map(|tls| tls.provider.clone());
                let socket = Self::from_fd(&self.env, fd, provider.clone().map(Tls::new));
                if provider.is_some() {
                    socket.start_handshake(true);
                }
                let socket: SharedSocket = socket;
                Attempt::Done(Ok(socket))
            }
            Err(Errno::WOULDBLOCK) | Err(Errno::INTR) => Attempt::Blocked(Interest::READ),
            Err(errno) => Attempt::Done(Err(errno.into())),
        }
    }

    fn try_read(&self) {
        let Some(reader) = self.reader.borrow_mut().take() else {
            return;
        };
        match reader {
            Reader::Read { amount, event } => match self.receive(amount) {
                Attempt::Done(outcome) => {
                    self.read_wait.set(Interest::NONE);
                    event.settle(outcome);
                }
                Attempt::Blocked(interest) => {
                    self.read_wait.set(interest);
                    *self.reader.borrow_mut() = Some(Reader::Read { amount, event });
                }
            },
            Reader::Accept(event) => match self.accept_one() {
                Attempt::Done(outcome) => {
                    self.read_wait.set(Interest::NONE);
                    event.settle(outcome);
                }
                Attempt::Blocked(interest) => {
                    self.read_wait.set(interest);
                    *self.reader.borrow_mut() = Some(Reader::Accept(event));
                }
            },
        }
    }

    fn try_write(&self) {
        let Some(writer) = self.writer.borrow_mut().take() else {
            return;
        };
        match self.send(&writer.data) {
            Attempt::Done(outcome) => {
                self.write_wait.set(Interest::NONE);
                writer.event.settle(outcome);
            }
            Attempt::Blocked(interest) => {
                self.write_wait.set(interest);
                *self.writer.borrow_mut() = Some(writer);
            }
        }
    }

    /// Tells the backend what the pending operations are waiting for.
    fn update_interest(&self) {
        if self.fd.borrow().is_none() {
            return;
        }
        let wanted = if self.handshaking() {
            self.handshake_wait.get()
        } else {
            let mut wanted = Interest::NONE;
            if self.reader.borrow().is_some() {
                wanted = wanted | self.read_wait.get();
            }
            if self.writer.borrow().is_some() {
                wanted = wanted | self.write_wait.get();
            }
            wanted
        };
        if wanted == self.registered.get() {
            return;
        }
        self.registered.set(wanted);
        if let Err(e) = self.env.want(self.descriptor, wanted) {
            self.fail_pending(e);
        }
    }

    fn fail_pending(&self, error: Error) {
        let reader = self.reader.borrow_mut().take();
        match reader {
            Some(Reader::Read { event, .. }) => event.settle(Err(error.clone())),
            Some(Reader::Accept(event)) => event.settle(Err(error.clone())),
            None => {}
        }
        if let Some(writer) = self.writer.borrow_mut().take() {
            writer.event.settle(Err(error));
        }
    }
}

impl Socket for TcpSocket {
    fn env(&self) -> &Environment {
        &self.env
    }

    fn bind(&self, address: SocketAddr) -> Result<(), Error> {
        let fd = self.fd.borrow();
        let fd = fd.as_ref().ok_or(Error::BadDescriptor)?;
        Ok(rustix::net::bind(fd, &address)?)
    }

    fn listen(&self, backlog: usize) -> Result<(), Error> {
        let fd = self.fd.borrow();
        let fd = fd.as_ref().ok_or(Error::BadDescriptor)?;
        let backlog = i32::try_from(backlog).unwrap_or(i32::MAX);
        Ok(rustix::net::listen(fd, backlog)?)
    }

    fn accept(&self) -> Result<Event<SharedSocket>, Error> {
        if self.reader.borrow().is_some() {
            return Err(UsageError::AlreadyAccepting.into());
        }
        let event = self.env.event();
        *self.reader.borrow_mut() = Some(Reader::Accept(event.clone()));
        self.try_read();
        self.update_interest();
        Ok(event)
    }

    fn connect(&self, address: SocketAddr) -> Result<(), Error> {
        let connected = {
            let fd = self.fd.borrow();
            let fd = fd.as_ref().ok_or(Error::BadDescriptor)?;
            rustix::net::connect(fd, &address)
        };
        match connected {
            Ok(()) | Err(Errno::INPROGRESS) | Err(Errno::ALREADY) | Err(Errno::INTR) => {}
            Err(Errno::ISCONN) => return Ok(()),
            Err(errno) => return Err(errno.into()),
        }
        tracing::debug!(fd = self.descriptor, %address, "Connecting");
        let idle = self
            .tls
            .borrow()
            .as_ref()
            .map_or(false, |tls| matches!(tls.phase, Phase::Idle));
        if idle {
            self.start_handshake(false);
        }
        Ok(())
    }

    fn read(&self, amount: usize) -> Result<Event<Vec<u8>>, Error> {
        if self.reader.borrow().is_some() {
            return Err(UsageError::AlreadyReading.into());
        }
        let event = self.env.event();
        *self.reader.borrow_mut() = Some(Reader::Read {
            amount,
            event: event.clone(),
        });
        self.try_read();
        self.update_interest();
        Ok(event)
    }

    fn write(&self, data: &[u8]) -> Result<Event<usize>, Error> {
        if self.writer.borrow().is_some() {
            return Err(UsageError::AlreadyWriting.into());
        }
        let event = self.env.event();
        *self.writer.borrow_mut() = Some(Writer {
            data: data.to_vec(),
            event: event.clone(),
        });
        self.try_write();
        self.update_interest();
        Ok(event)
    }

    fn close(&self) {
        if self.fd.borrow().is_none() {
            return;
        }
        self.fail_pending(Error::BadDescriptor);
        let done = self
            .tls
            .borrow_mut()
            .as_mut()
            .and_then(|tls| tls.done.take());
        if let Some(done) = done {
            done.settle(Err(Error::BadDescriptor));
        }
        self.env.unregister(self.descriptor);
        self.fd.borrow_mut().take();
        tracing::debug!(fd = self.descriptor, "Closed socket");
    }

    fn address(&self) -> Result<SocketAddr, Error> {
        let fd = self.fd.borrow();
        let fd = fd.as_ref().ok_or(Error::BadDescriptor)?;
        to_socket_addr(rustix::net::getsockname(fd)?)
    }

    fn peer_address(&self) -> Result<SocketAddr, Error> {
        let fd = self.fd.borrow();
        let fd = fd.as_ref().ok_or(Error::BadDescriptor)?;
        match rustix::net::getpeername(fd)? {
            Some(address) => to_socket_addr(address),
            None => Err(ConnectionError::NotConnected.into()),
        }
    }
}

impl Ready for TcpSocket {
    fn ready(&self, readiness: Interest) {
        if self.handshaking() {
            self.drive_handshake();
            return;
        }
        if !(readiness & self.read_wait.get()).is_empty() {
            self.try_read();
        }
        if !(readiness & self.write_wait.get()).is_empty() {
            self.try_write();
        }
        self.update_interest();
    }

    fn close(&self) {
        Socket::close(self);
    }
}

impl std::fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSocket")
            .field("fd", &self.descriptor)
            .field("open", &self.fd.borrow().is_some())
            .field("tls", &self.tls.borrow())
            .finish()
    }
}
