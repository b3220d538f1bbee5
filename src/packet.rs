//! Length-prefixed messages over a byte stream.
//!
//! Every packet goes on the wire as a four byte big-endian length followed
//! by the payload.

use crate::{
    config::PacketConfig,
    core::{Environment, Event},
    error::{Error, OverflowError, ProtocolError, UsageError},
    socket::SharedSocket,
};
use std::{
    cell::{Cell, RefCell},
    net::SocketAddr,
    rc::Rc,
};

const HEADER_SIZE: usize = 4;

struct PendingWrite {
    event: Event<()>,
    buf: Vec<u8>,
}

struct Inner {
    socket: SharedSocket,
    config: PacketConfig,
    read_event: RefCell<Option<Event<Vec<u8>>>>,
    read_buf: RefCell<Vec<u8>>,
    read_size: Cell<Option<usize>>,
    write: RefCell<Option<PendingWrite>>,
}

#[derive(Clone)]
pub struct Packet {
    inner: Rc<Inner>,
}

impl Packet {
    /// Frames `socket` with the limits from the environment's configuration.
    pub fn new(socket: SharedSocket) -> Self {
        let config = socket.env().config().packet;
        Self::with_config(socket, config)
    }

    pub fn with_config(socket: SharedSocket, config: PacketConfig) -> Self {
        Self {
            inner: Rc::new(Inner {
                socket,
                config,
                read_event: RefCell::new(None),
                read_buf: RefCell::new(Vec::new()),
                read_size: Cell::new(None),
                write: RefCell::new(None),
            }),
        }
    }

    pub fn env(&self) -> &Environment {
        self.inner.socket.env()
    }

    pub fn socket(&self) -> &SharedSocket {
        &self.inner.socket
    }

    pub fn bind(&self, address: SocketAddr) -> Result<(), Error> {
        self.inner.socket.bind(address)
    }

    pub fn listen(&self, backlog: usize) -> Result<(), Error> {
        self.inner.socket.listen(backlog)
    }

    pub fn connect(&self, address: SocketAddr) -> Result<(), Error> {
        self.inner.socket.connect(address)
    }

    /// Accepts a connection and frames it with the same limits.
    pub fn accept(&self) -> Result<Event<Packet>, Error> {
        let config = self.inner.config;
        Ok(self
            .inner
            .socket
            .accept()?
            .map(move |socket| Packet::with_config(socket, config)))
    }

    pub fn address(&self) -> Result<SocketAddr, Error> {
        self.inner.socket.address()
    }

    pub fn peer_address(&self) -> Result<SocketAddr, Error> {
        self.inner.socket.peer_address()
    }

    /// Succeeds with the next complete packet.
    pub fn read(&self) -> Result<Event<Vec<u8>>, Error> {
        if self.inner.read_event.borrow().is_some() {
            return Err(UsageError::AlreadyReading.into());
        }
        let event = self.env().event();
        *self.inner.read_event.borrow_mut() = Some(event.clone());
        if self.inner.read_buf.borrow().is_empty() {
            Inner::request_read(&self.inner);
        } else {
            Inner::read_data(&self.inner, Ok(Vec::new()));
        }
        Ok(event)
    }

    /// Sends `packet`. Oversized packets are rejected before anything is
    /// written.
    pub fn write(&self, packet: &[u8]) -> Result<Event<()>, Error> {
        if self.inner.write.borrow().is_some() {
            return Err(UsageError::AlreadyWriting.into());
        }
        let allowed = self.inner.config.max_packet_size;
        if packet.len() > allowed {
            return Err(OverflowError::PacketTooLarge {
                allowed,
                actual: packet.len(),
            }
            .into());
        }
        let length = u32::try_from(packet.len()).map_err(|_| OverflowError::PacketTooLarge {
            allowed,
            actual: packet.len(),
        })?;
        let mut buf = Vec::with_capacity(HEADER_SIZE + packet.len());
        buf.extend_from_slice(&length.to_be_bytes());
        buf.extend_from_slice(packet);

        let event = self.env().event();
        *self.inner.write.borrow_mut() = Some(PendingWrite {
            event: event.clone(),
            buf,
        });
        Inner::request_write(&self.inner);
        Ok(event)
    }

    pub fn close(&self) {
        self.inner.socket.close();
    }
}

impl Inner {
    fn request_read(this: &Rc<Self>) {
        match this.socket.read(this.config.blocksize) {
            Ok(read) => {
                let this = this.clone();
                read.add_callback(move |read| {
                    read.defuse();
                    if let Some(outcome) = read.outcome() {
                        Inner::read_data(&this, outcome);
                    }
                });
            }
            Err(e) => Inner::read_data(this, Err(e)),
        }
    }

    fn read_data(this: &Rc<Self>, outcome: Result<Vec<u8>, Error>) {
        let data = match outcome {
            Ok(data) => data,
            Err(e) => return this.finish_read(Err(e)),
        };

        let packet = {
            let mut buf = this.read_buf.borrow_mut();
            buf.extend_from_slice(&data);

            if this.read_size.get().is_none() && buf.len() >= HEADER_SIZE {
                let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
                if declared > this.config.max_packet_size {
                    buf.clear();
                    drop(buf);
                    return this.finish_read(Err(OverflowError::PacketTooLarge {
                        allowed: this.config.max_packet_size,
                        actual: declared,
                    }
                    .into()));
                }
                this.read_size.set(Some(HEADER_SIZE + declared));
            }

            match this.read_size.get() {
                Some(size) if buf.len() >= size => {
                    let packet = buf[HEADER_SIZE..size].to_vec();
                    buf.drain(..size);
                    this.read_size.set(None);
                    Some(packet)
                }
                _ => None,
            }
        };

        match packet {
            Some(packet) => this.finish_read(Ok(packet)),
            None => Inner::request_read(this),
        }
    }

    fn finish_read(&self, outcome: Result<Vec<u8>, Error>) {
        if let Some(event) = self.read_event.borrow_mut().take() {
            event.settle(outcome);
        }
    }

    fn request_write(this: &Rc<Self>) {
        let written = {
            let write = this.write.borrow();
            let Some(write) = write.as_ref() else { return };
            this.socket.write(&write.buf)
        };
        match written {
            Ok(written) => {
                let this = this.clone();
                written.add_callback(move |written| {
                    written.defuse();
                    if let Some(outcome) = written.outcome() {
                        Inner::write_data(&this, outcome);
                    }
                });
            }
            Err(e) => Inner::write_data(this, Err(e)),
        }
    }

    fn write_data(this: &Rc<Self>, outcome: Result<usize, Error>) {
        let done = {
            let mut write = this.write.borrow_mut();
            let Some(pending) = write.as_mut() else { return };
            match outcome {
                Ok(count) => {
                    pending.buf.drain(..count.min(pending.buf.len()));
                    pending.buf.is_empty().then_some(Ok(()))
                }
                Err(e) => Some(Err(e)),
            }
        };
        match done {
            Some(outcome) => {
                if let Some(pending) = this.write.borrow_mut().take() {
                    pending.event.settle(outcome);
                }
            }
            None => Inner::request_write(this),
        }
    }
}

/// A [`Packet`] carrying UTF-8 text.
#[derive(Clone)]
pub struct Utf8Packet {
    packet: Packet,
}

impl Utf8Packet {
    pub fn new(socket: SharedSocket) -> Self {
        Self {
            packet: Packet::new(socket),
        }
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    pub fn read(&self) -> Result<Event<String>, Error> {
        Ok(self.packet.read()?.map_result(|outcome| {
            String::from_utf8(outcome?).map_err(|_| ProtocolError::InvalidUtf8.into())
        }))
    }

    pub fn write(&self, text: &str) -> Result<Event<()>, Error> {
        self.packet.write(text.as_bytes())
    }

    pub fn close(&self) {
        self.packet.close();
    }
}

impl From<Packet> for Utf8Packet {
    fn from(packet: Packet) -> Self {
        Self { packet }
    }
}
