use super::{codec::JsonCodec, Value};
use crate::{
    core::{Environment, Event, Process},
    error::{Error, OverflowError, ProtocolError, UsageError},
    packet::Packet,
};
use rustc_hash::{FxHashMap, FxHashSet};
use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::{Rc, Weak},
};

pub(crate) const REQUEST: i64 = 0;
pub(crate) const SUCCESS: i64 = 1;
pub(crate) const FAILURE: i64 = 2;

struct RequestInner {
    id: u64,
    content: Value,
    reply: Event<Value>,
}

/// A request received from the peer. It is answered exactly once through
/// [`Request::succeed`] or [`Request::fail`].
#[derive(Clone)]
pub struct Request {
    inner: Rc<RequestInner>,
}

impl Request {
    pub(crate) fn new(env: &Environment, id: u64, content: Value) -> Self {
        Self {
            inner: Rc::new(RequestInner {
                id,
                content,
                reply: env.event(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn content(&self) -> &Value {
        &self.inner.content
    }

    /// Triggered with the reply.
    pub fn event(&self) -> &Event<Value> {
        &self.inner.reply
    }

    pub fn succeed(&self, value: Value) -> Result<(), Error> {
        self.inner.reply.succeed(value)
    }

    pub fn fail(&self, error: Error) -> Result<(), Error> {
        self.inner.reply.fail(error)
    }

    pub(crate) fn reply(&self, outcome: Result<Value, Error>) {
        if let Err(e) = self.inner.reply.trigger(outcome) {
            tracing::warn!(id = self.inner.id, "Request answered twice: {}", e);
        }
    }
}

struct Shared {
    env: Environment,
    packet: Packet,
    codec: Rc<JsonCodec>,
    limit: usize,
    next_id: Cell<u64>,
    // The queues and tables are `None` once the channel has failed.
    in_queue: RefCell<Option<VecDeque<Request>>>,
    out_queue: RefCell<Option<VecDeque<Vec<u8>>>>,
    unanswered: RefCell<Option<FxHashSet<u64>>>,
    pending: RefCell<Option<FxHashMap<u64, Event<Value>>>>,
    send_wait: RefCell<Option<Event<()>>>,
    recv_wait: RefCell<Option<Event<Request>>>,
    error: RefCell<Option<Error>>,
    processes: RefCell<Vec<Process<()>>>,
}

/// Requests and replies over a [`Packet`] connection.
///
/// Every request carries an id which its reply repeats, so replies may be
/// sent in any order. Both directions are bounded by a message limit.
#[derive(Clone)]
pub struct Channel {
    shared: Rc<Shared>,
}

impl Channel {
    pub fn new(packet: Packet, codec: Rc<JsonCodec>, limit: usize) -> Self {
        let env = packet.env().clone();
        let shared = Rc::new(Shared {
            env: env.clone(),
            packet,
            codec,
            limit,
            next_id: Cell::new(0),
            in_queue: RefCell::new(Some(VecDeque::new())),
            out_queue: RefCell::new(Some(VecDeque::new())),
            unanswered: RefCell::new(Some(FxHashSet::default())),
            pending: RefCell::new(Some(FxHashMap::default())),
            send_wait: RefCell::new(None),
            recv_wait: RefCell::new(None),
            error: RefCell::new(None),
            processes: RefCell::new(Vec::new()),
        });
        let reader = env.process(shared.clone().read_messages());
        let writer = env.process(shared.clone().write_messages());
        *shared.processes.borrow_mut() = vec![reader, writer];
        Self { shared }
    }

    pub fn env(&self) -> &Environment {
        &self.shared.env
    }

    pub fn packet(&self) -> &Packet {
        &self.shared.packet
    }

    pub fn codec(&self) -> &Rc<JsonCodec> {
        &self.shared.codec
    }

    /// Sends a request. The returned event is triggered with the reply.
    pub fn send(&self, content: Value) -> Result<Event<Value>, Error> {
        let shared = &self.shared;
        let outstanding = match shared.pending.borrow().as_ref() {
            Some(pending) => pending.len(),
            None => return Err(shared.standing_error()),
        };
        if outstanding >= shared.limit {
            tracing::warn!(limit = shared.limit, "Outgoing message limit exceeded");
            return Err(OverflowError::OutgoingLimit(shared.limit).into());
        }

        let id = shared.next_id.get();
        let data = shared.codec.encode_envelope(REQUEST, id, &content)?;
        shared.next_id.set(id + 1);
        let reply = shared.env.event();
        if let Some(pending) = shared.pending.borrow_mut().as_mut() {
            pending.insert(id, reply.clone());
        }
        shared.queue_outgoing(data);
        Ok(reply)
    }

    /// Receives the next request. Only one receive may be pending.
    pub fn recv(&self) -> Result<Event<Request>, Error> {
        let shared = &self.shared;
        let next = match shared.in_queue.borrow_mut().as_mut() {
            Some(queue) => queue.pop_front(),
            None => return Err(shared.standing_error()),
        };
        let event = shared.env.event();
        match next {
            Some(request) => event.settle(Ok(request)),
            None => {
                let mut wait = shared.recv_wait.borrow_mut();
                if wait.is_some() {
                    return Err(UsageError::ConcurrentReceive.into());
                }
                *wait = Some(event.clone());
            }
        }
        Ok(event)
    }

    /// Silences the failures of the reader and writer processes.
    pub fn defuse(&self) {
        for process in self.shared.processes.borrow().iter() {
            process.defuse();
        }
    }

    /// The error the channel failed with.
    pub fn error(&self) -> Option<Error> {
        self.shared.error.borrow().clone()
    }

    pub fn close(&self) {
        self.shared.packet.close();
    }
}

impl Shared {
    fn standing_error(&self) -> Error {
        self.error.borrow().clone().unwrap_or(Error::BadDescriptor)
    }

    fn queue_outgoing(&self, data: Vec<u8>) {
        if let Some(queue) = self.out_queue.borrow_mut().as_mut() {
            queue.push_back(data);
        }
        let wait = self.send_wait.borrow_mut().take();
        if let Some(wait) = wait {
            wait.settle(Ok(()));
        }
    }

    fn origin(&self) -> String {
        self.packet
            .peer_address()
            .map(|address| address.to_string())
            .unwrap_or_else(|_| "unknown peer".into())
    }

    async fn read_messages(self: Rc<Self>) -> Result<(), Error> {
        let result = self.read_loop().await;
        if let Err(e) = &result {
            self.fail(e.clone());
        }
        result
    }

    async fn read_loop(self: &Rc<Self>) -> Result<(), Error> {
        loop {
            let data = self.packet.read()?.await?;
            let (kind, id, content) = self.codec.decode_envelope(&data)?;
            match kind {
                REQUEST => self.receive(id, content)?,
                SUCCESS | FAILURE => {
                    let reply = self
                        .pending
                        .borrow_mut()
                        .as_mut()
                        .and_then(|pending| pending.remove(&id))
                        .ok_or(ProtocolError::UnknownMessageId(id))?;
                    if kind == SUCCESS {
                        reply.settle(Ok(content));
                    } else {
                        let traceback = match content {
                            Value::Str(traceback) => traceback,
                            other => format!("{:?}", other),
                        };
                        reply.settle(Err(Error::Remote {
                            origin: self.origin(),
                            traceback,
                        }));
                    }
                }
                other => return Err(ProtocolError::InvalidMessageType(other).into()),
            }
        }
    }

    fn receive(self: &Rc<Self>, id: u64, content: Value) -> Result<(), Error> {
        {
            let mut unanswered = self.unanswered.borrow_mut();
            let unanswered = unanswered.as_mut().ok_or(Error::BadDescriptor)?;
            if unanswered.len() >= self.limit {
                tracing::warn!(limit = self.limit, "Incoming message limit exceeded");
                self.packet.close();
                return Err(OverflowError::IncomingLimit(self.limit).into());
            }
            unanswered.insert(id);
        }

        let request = Request::new(&self.env, id, content);
        let this = Rc::downgrade(self);
        request.event().add_callback(move |event| answer(&this, id, event));

        let wait = self.recv_wait.borrow_mut().take();
        match wait {
            Some(wait) => wait.settle(Ok(request)),
            None => {
                if let Some(queue) = self.in_queue.borrow_mut().as_mut() {
                    queue.push_back(request);
                }
            }
        }
        Ok(())
    }

    async fn write_messages(self: Rc<Self>) -> Result<(), Error> {
        let result = self.write_loop().await;
        if let Err(e) = &result {
            self.fail(e.clone());
        }
        result
    }

    async fn write_loop(&self) -> Result<(), Error> {
        loop {
            let next = match self.out_queue.borrow_mut().as_mut() {
                Some(queue) => queue.pop_front(),
                None => return Err(self.standing_error()),
            };
            match next {
                Some(data) => {
                    self.packet.write(&data)?.await?;
                }
                None => {
                    let wait = self.env.event();
                    *self.send_wait.borrow_mut() = Some(wait.clone());
                    wait.await?;
                }
            }
        }
    }

    /// Fails everything in flight with `error`, which becomes the standing
    /// error of the channel.
    fn fail(&self, error: Error) {
        if self.error.borrow().is_some() {
            return;
        }
        tracing::debug!("Message channel failed: {}", error);
        *self.error.borrow_mut() = Some(error.clone());
        let uncritical = error.is_uncritical();
        if uncritical {
            for process in self.processes.borrow().iter() {
                process.defuse();
            }
        }

        let send_wait = self.send_wait.borrow_mut().take();
        let recv_wait = self.recv_wait.borrow_mut().take();
        let pending = self.pending.borrow_mut().take().unwrap_or_default();
        self.in_queue.borrow_mut().take();
        self.out_queue.borrow_mut().take();
        self.unanswered.borrow_mut().take();

        if let Some(wait) = send_wait {
            if uncritical {
                wait.defuse();
            }
            wait.settle(Err(error.clone()));
        }
        if let Some(wait) = recv_wait {
            if uncritical {
                wait.defuse();
            }
            wait.settle(Err(error.clone()));
        }
        for reply in pending.into_values() {
            if uncritical {
                reply.defuse();
            }
            reply.settle(Err(error.clone()));
        }
    }
}

/// Sends the reply to request `id` once its event has been processed.
fn answer(this: &Weak<Shared>, id: u64, event: &Event<Value>) {
    let answered = this.upgrade().and_then(|shared| {
        let removed = shared.unanswered.borrow_mut().as_mut()?.remove(&id);
        removed.then_some(shared)
    });
    let Some(shared) = answered else {
        // The channel is gone.
        event.defuse();
        return;
    };

    let outcome = event.outcome().unwrap_or(Err(Error::BadDescriptor));
    let failure = match outcome {
        Ok(value) => match shared.codec.encode_envelope(SUCCESS, id, &value) {
            Ok(data) => {
                shared.queue_outgoing(data);
                return;
            }
            Err(e) => e,
        },
        Err(e) => e,
    };
    // The peer receives the failure.
    event.defuse();
    tracing::debug!(id, "Request failed: {}", failure);
    match shared
        .codec
        .encode_envelope(FAILURE, id, &Value::Str(failure.traceback()))
    {
        Ok(data) => shared.queue_outgoing(data),
        Err(e) => tracing::error!(id, "Failed to encode failure: {}", e),
    }
}
