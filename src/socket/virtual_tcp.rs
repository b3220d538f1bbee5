//! Sockets on the [`VirtualNetwork`].
//!
//! A connected pair is linked directly. Each side runs two processes: one
//! transmits segments of the send buffer to the peer and waits for their
//! acknowledgement, the other moves received frames into the bounded
//! receive buffer. A frame without data closes the connection.

use super::{SharedSocket, Socket};
use crate::{
    backend::virtual_net::{Latency, VirtualNetwork},
    core::{Environment, Event},
    error::{ConnectionError, Error, UsageError},
};
use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    rc::{Rc, Weak},
};

#[derive(Clone)]
struct Frame {
    data: Vec<u8>,
    ack: Event<usize>,
}

struct Reader {
    amount: usize,
    event: Event<Vec<u8>>,
}

struct Writer {
    data: Vec<u8>,
    event: Event<usize>,
}

struct Backlog {
    capacity: usize,
    queue: VecDeque<Rc<VirtualSocket>>,
    accepter: Option<Event<SharedSocket>>,
}

struct State {
    /// `None` once the socket is closed.
    address: Option<SocketAddr>,
    peer: Option<Weak<VirtualSocket>>,
    peer_address: Option<SocketAddr>,
    latency: Latency,
    incoming: Vec<u8>,
    outgoing: Vec<u8>,
    incoming_error: Option<Error>,
    outgoing_error: Option<Error>,
    incoming_avail: Option<Event<()>>,
    outgoing_avail: Option<Event<()>>,
    transmission: Option<Event<Option<Frame>>>,
    reader: Option<Reader>,
    writer: Option<Writer>,
    backlog: Option<Backlog>,
}

pub struct VirtualSocket {
    env: Environment,
    network: Rc<VirtualNetwork>,
    this: Weak<VirtualSocket>,
    state: RefCell<State>,
}

impl VirtualSocket {
    pub fn new(env: &Environment, network: Rc<VirtualNetwork>) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            env: env.clone(),
            network,
            this: this.clone(),
            state: RefCell::new(State {
                address: Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)),
                peer: None,
                peer_address: None,
                latency: Latency::Fixed(Default::default()),
                incoming: Vec::new(),
                outgoing: Vec::new(),
                incoming_error: Some(ConnectionError::NotConnected.into()),
                outgoing_error: Some(ConnectionError::BrokenPipe.into()),
                incoming_avail: None,
                outgoing_avail: None,
                transmission: None,
                reader: None,
                writer: None,
                backlog: None,
            }),
        })
    }

    fn max_buffer_size(&self) -> usize {
        self.network.config().max_buffer_size
    }

    fn segment_size(&self) -> usize {
        self.network.config().segment_size().max(1)
    }

    pub(crate) fn is_listening(&self) -> bool {
        self.state.borrow().backlog.is_some()
    }

    pub(crate) fn has_room(&self) -> bool {
        self.state
            .borrow()
            .backlog
            .as_ref()
            .map_or(false, |backlog| {
                backlog.accepter.is_some() || backlog.queue.len() < backlog.capacity
            })
    }

    pub(crate) fn refuse(&self) {
        let mut state = self.state.borrow_mut();
        state.incoming_error = Some(ConnectionError::Refused.into());
        state.outgoing_error = Some(ConnectionError::Refused.into());
        drop(state);
        self.try_read();
        self.try_write();
    }

    /// Connects this socket to `peer` and starts transmitting.
    pub(crate) fn link(
        &self,
        address: SocketAddr,
        peer: &Rc<VirtualSocket>,
        peer_address: SocketAddr,
        latency: Latency,
    ) {
        {
            let mut state = self.state.borrow_mut();
            state.address = Some(address);
            state.peer = Some(Rc::downgrade(peer));
            state.peer_address = Some(peer_address);
            state.latency = latency;
            state.incoming_error = None;
            state.outgoing_error = None;
            state.transmission = Some(self.env.event());
        }
        let Some(this) = self.this.upgrade() else { return };
        self.env.process(this.clone().receive_frames());
        self.env.process(this.transmit_segments());
    }

    pub(crate) fn enqueue(&self, peer: Rc<VirtualSocket>) {
        let accepter = {
            let mut state = self.state.borrow_mut();
            let Some(backlog) = state.backlog.as_mut() else { return };
            match backlog.accepter.take() {
                Some(accepter) => Some(accepter),
                None => {
                    backlog.queue.push_back(peer.clone());
                    None
                }
            }
        };
        if let Some(accepter) = accepter {
            let peer: SharedSocket = peer;
            accepter.settle(Ok(peer));
        }
    }

    fn latency(&self) -> std::time::Duration {
        let latency = self.state.borrow().latency;
        self.network.sample(latency)
    }

    fn peer(&self) -> Option<Rc<VirtualSocket>> {
        self.state.borrow().peer.as_ref().and_then(Weak::upgrade)
    }

    /// Moves frames from the peer into the receive buffer until the
    /// connection is closed.
    async fn receive_frames(self: Rc<Self>) -> Result<(), Error> {
        let max = self.max_buffer_size();
        loop {
            self.try_read();
            let (full, transmission) = {
                let mut state = self.state.borrow_mut();
                if state.incoming_error.is_some() {
                    break;
                }
                if state.incoming.len() >= max {
                    let avail = self.env.event();
                    state.incoming_avail = Some(avail.clone());
                    (Some(avail), None)
                } else {
                    (None, state.transmission.clone())
                }
            };
            if let Some(avail) = full {
                avail.await?;
                continue;
            }
            let Some(transmission) = transmission else { break };
            let frame = transmission.await?;
            {
                let mut state = self.state.borrow_mut();
                if state.address.is_some() {
                    state.transmission = Some(self.env.event());
                }
            }
            let Some(frame) = frame else { continue };

            if frame.data.is_empty() {
                let address = {
                    let mut state = self.state.borrow_mut();
                    if state.incoming_error.is_none() {
                        state.incoming_error = Some(ConnectionError::Reset.into());
                    }
                    state.address
                };
                if let Some(address) = address {
                    self.network.unregister(address);
                }
                tracing::trace!(?address, "Peer closed the connection");
                frame.ack.settle(Ok(0));
                continue;
            }

            let accepted = {
                let mut state = self.state.borrow_mut();
                let accepted = max.saturating_sub(state.incoming.len()).min(frame.data.len());
                state.incoming.extend_from_slice(&frame.data[..accepted]);
                accepted
            };
            self.try_read();
            self.env.timeout(self.latency()).await?;
            frame.ack.settle(Ok(accepted));
        }
        self.state.borrow_mut().transmission = None;
        Ok(())
    }

    /// Sends the send buffer to the peer segment by segment. Ends after the
    /// closing frame has been delivered.
    async fn transmit_segments(self: Rc<Self>) -> Result<(), Error> {
        let segment = self.segment_size();
        loop {
            let idle = {
                let mut state = self.state.borrow_mut();
                if state.outgoing.is_empty() && state.outgoing_error.is_none() {
                    let avail = self.env.event();
                    state.outgoing_avail = Some(avail.clone());
                    Some(avail)
                } else {
                    None
                }
            };
            if let Some(avail) = idle {
                avail.await?;
            }

            let data = {
                let state = self.state.borrow();
                state.outgoing[..segment.min(state.outgoing.len())].to_vec()
            };
            self.env.timeout(self.latency()).await?;

            let transmission = self
                .peer()
                .and_then(|peer| {
                    let transmission = peer.state.borrow().transmission.clone();
                    transmission
                })
                .filter(|transmission| !transmission.triggered());
            let Some(transmission) = transmission else {
                {
                    let mut state = self.state.borrow_mut();
                    if state.outgoing_error.is_none() {
                        state.outgoing_error = Some(ConnectionError::BrokenPipe.into());
                    }
                    state.outgoing.clear();
                }
                self.try_write();
                break;
            };

            let ack = self.env.event();
            transmission.settle(Ok(Some(Frame {
                data: data.clone(),
                ack: ack.clone(),
            })));
            let sent = ack.await?;
            if data.is_empty() {
                break;
            }
            {
                let mut state = self.state.borrow_mut();
                let sent = sent.min(state.outgoing.len());
                state.outgoing.drain(..sent);
            }
            self.try_write();
        }
        Ok(())
    }

    fn try_read(&self) {
        let mut state = self.state.borrow_mut();
        let Some(reader) = state.reader.take() else { return };
        // Buffered data is still delivered after the peer has gone.
        let closed = matches!(state.incoming_error, Some(Error::BadDescriptor));
        if state.incoming.is_empty() || closed {
            match state.incoming_error.clone() {
                Some(e) => {
                    drop(state);
                    reader.event.settle(Err(e));
                }
                None => state.reader = Some(reader),
            }
            return;
        }
        let count = reader.amount.min(state.incoming.len());
        let data: Vec<u8> = state.incoming.drain(..count).collect();
        let avail = state.incoming_avail.take();
        drop(state);
        reader.event.settle(Ok(data));
        if let Some(avail) = avail {
            avail.settle(Ok(()));
        }
    }

    fn try_write(&self) {
        let max = self.max_buffer_size();
        let mut state = self.state.borrow_mut();
        let Some(writer) = state.writer.take() else { return };
        if let Some(e) = state.outgoing_error.clone() {
            drop(state);
            writer.event.settle(Err(e));
            return;
        }
        let count = max.saturating_sub(state.outgoing.len()).min(writer.data.len());
        if count == 0 && !writer.data.is_empty() {
            state.writer = Some(writer);
            return;
        }
        state.outgoing.extend_from_slice(&writer.data[..count]);
        let avail = state.outgoing_avail.take();
        drop(state);
        writer.event.settle(Ok(count));
        if let Some(avail) = avail {
            avail.settle(Ok(()));
        }
    }

    fn check_open(&self) -> Result<(), Error> {
        match self.state.borrow().address {
            Some(_) => Ok(()),
            None => Err(Error::BadDescriptor),
        }
    }

    fn connected(&self) -> bool {
        self.state.borrow().peer.is_some()
    }
}

impl Socket for VirtualSocket {
    fn env(&self) -> &Environment {
        &self.env
    }

    fn bind(&self, address: SocketAddr) -> Result<(), Error> {
        self.check_open()?;
        if self.connected() {
            return Err(ConnectionError::InvalidArgument.into());
        }
        let address = self.network.allocate(address)?;
        self.state.borrow_mut().address = Some(address);
        Ok(())
    }

    fn listen(&self, backlog: usize) -> Result<(), Error> {
        self.check_open()?;
        if self.connected() {
            return Err(ConnectionError::InvalidArgument.into());
        }
        if self.is_listening() {
            return Ok(());
        }
        let mut address = self.address()?;
        if address.port() == 0 {
            address = self.network.allocate(address)?;
        }
        let this = self.this.upgrade().ok_or(Error::BadDescriptor)?;
        self.network.register(address, &this)?;
        let capacity = if backlog == 0 {
            self.network.config().backlog
        } else {
            backlog
        };
        let mut state = self.state.borrow_mut();
        state.address = Some(address);
        state.backlog = Some(Backlog {
            capacity,
            queue: VecDeque::new(),
            accepter: None,
        });
        tracing::debug!(%address, backlog = capacity, "Listening");
        Ok(())
    }

    fn accept(&self) -> Result<Event<SharedSocket>, Error> {
        self.check_open()?;
        let event = self.env.event();
        let mut state = self.state.borrow_mut();
        let backlog = state
            .backlog
            .as_mut()
            .ok_or(ConnectionError::InvalidArgument)?;
        if backlog.accepter.is_some() {
            return Err(UsageError::AlreadyAccepting.into());
        }
        match backlog.queue.pop_front() {
            Some(peer) => {
                drop(state);
                let peer: SharedSocket = peer;
                event.settle(Ok(peer));
            }
            None => backlog.accepter = Some(event.clone()),
        }
        Ok(event)
    }

    fn connect(&self, address: SocketAddr) -> Result<(), Error> {
        self.check_open()?;
        if self.is_listening() {
            return Err(ConnectionError::AlreadyConnected.into());
        }
        if self.connected() {
            return Ok(());
        }
        let this = self.this.upgrade().ok_or(Error::BadDescriptor)?;
        let source = self.address()?.ip();
        self.network.establish(&self.env, &this, source, address)
    }

    fn read(&self, amount: usize) -> Result<Event<Vec<u8>>, Error> {
        if self.state.borrow().reader.is_some() {
            return Err(UsageError::AlreadyReading.into());
        }
        let event = self.env.event();
        self.state.borrow_mut().reader = Some(Reader {
            amount,
            event: event.clone(),
        });
        self.try_read();
        Ok(event)
    }

    fn write(&self, data: &[u8]) -> Result<Event<usize>, Error> {
        if self.state.borrow().writer.is_some() {
            return Err(UsageError::AlreadyWriting.into());
        }
        let event = self.env.event();
        self.state.borrow_mut().writer = Some(Writer {
            data: data.to_vec(),
            event: event.clone(),
        });
        self.try_write();
        Ok(event)
    }

    fn close(&self) {
        let (address, wakeups, transmission, reader, writer, backlog) = {
            let mut state = self.state.borrow_mut();
            let Some(address) = state.address.take() else { return };
            state.incoming_error = Some(Error::BadDescriptor);
            state.outgoing_error = Some(Error::BadDescriptor);
            state.peer_address = None;
            let wakeups = [state.incoming_avail.take(), state.outgoing_avail.take()];
            (
                address,
                wakeups,
                state.transmission.take(),
                state.reader.take(),
                state.writer.take(),
                state.backlog.take(),
            )
        };
        if let Some(reader) = reader {
            reader.event.settle(Err(Error::BadDescriptor));
        }
        if let Some(writer) = writer {
            writer.event.settle(Err(Error::BadDescriptor));
        }
        for avail in wakeups.into_iter().flatten() {
            avail.settle(Ok(()));
        }
        if let Some(transmission) = transmission.filter(|t| !t.triggered()) {
            transmission.settle(Ok(None));
        }
        if let Some(backlog) = backlog {
            if let Some(accepter) = backlog.accepter {
                accepter.settle(Err(Error::BadDescriptor));
            }
            for pending in backlog.queue {
                pending.close();
            }
        }
        self.network.unregister(address);
        tracing::debug!(%address, "Closed virtual socket");
    }

    fn address(&self) -> Result<SocketAddr, Error> {
        self.state.borrow().address.ok_or(Error::BadDescriptor)
    }

    fn peer_address(&self) -> Result<SocketAddr, Error> {
        let state = self.state.borrow();
        if state.address.is_none() {
            return Err(Error::BadDescriptor);
        }
        state
            .peer_address
            .ok_or_else(|| ConnectionError::NotConnected.into())
    }
}

impl fmt::Debug for VirtualSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("VirtualSocket")
            .field("address", &state.address)
            .field("peer", &state.peer_address)
            .field("incoming", &state.incoming.len())
            .field("outgoing", &state.outgoing.len())
            .finish()
    }
}
