//! Handles for single messages on an HTTP channel.
//!
//! Every handle can be awaited. Incoming messages resolve once their header
//! has been parsed, outgoing ones once their header has been transmitted.
//! Bodies may be read or written before that.

use super::{
    channel::Channel,
    headers::{Headers, StartLine},
};
use crate::{
    core::{Completion, Environment, Event, Handoff, Rejected},
    error::{Error, UsageError},
};
use std::{cell::RefCell, future::IntoFuture, rc::Rc};

#[derive(Clone)]
pub(crate) struct ReadRequest {
    /// Read the whole remaining body instead of a single chunk.
    pub(crate) all: bool,
    pub(crate) event: Event<Vec<u8>>,
}

#[derive(Clone)]
pub(crate) struct WriteRequest {
    pub(crate) data: Vec<u8>,
    /// Finish the body after this write.
    pub(crate) all: bool,
    pub(crate) event: Event<()>,
}

pub(crate) struct Incoming {
    pub(crate) id: u64,
    pub(crate) head: RefCell<Option<(StartLine, Headers)>>,
    pub(crate) parsed: Event<()>,
    pub(crate) reads: Handoff<ReadRequest>,
}

impl Incoming {
    pub(crate) fn new(env: &Environment, id: u64) -> Self {
        Self {
            id,
            head: RefCell::new(None),
            parsed: env.event(),
            reads: Handoff::new(env),
        }
    }

    pub(crate) fn fail(&self, error: Error) {
        if let Some(read) = self.reads.fail(error.clone()) {
            read.event.settle(Err(error.clone()));
        }
        if !self.parsed.triggered() {
            if error.is_uncritical() {
                self.parsed.defuse();
            }
            self.parsed.settle(Err(error));
        }
    }

    fn read(&self, env: &Environment, all: bool) -> Result<Event<Vec<u8>>, Error> {
        let event = env.event();
        let request = ReadRequest {
            all,
            event: event.clone(),
        };
        match self.reads.submit(request) {
            Ok(()) => Ok(event),
            Err(Rejected::Busy) => Err(UsageError::ConcurrentRead.into()),
            // The body has been consumed.
            Err(Rejected::Closed) => {
                event.settle(Ok(Vec::new()));
                Ok(event)
            }
            Err(Rejected::Failed(e)) => Err(e),
        }
    }

    fn headers(&self) -> Headers {
        self.head
            .borrow()
            .as_ref()
            .map(|(_, headers)| headers.clone())
            .unwrap_or_default()
    }
}

pub(crate) struct Outgoing {
    pub(crate) start_line: String,
    pub(crate) headers: RefCell<Headers>,
    pub(crate) chunked: bool,
    pub(crate) sent: Event<()>,
    pub(crate) writes: Handoff<WriteRequest>,
}

impl Outgoing {
    /// A message with `data` is sent with a content length, one without is
    /// sent chunked.
    pub(crate) fn new(
        env: &Environment,
        start_line: String,
        mut headers: Headers,
        data: Option<&[u8]>,
    ) -> Self {
        let writes = Handoff::new(env);
        let chunked = match data {
            Some(data) => {
                headers.insert("Content-Length", data.len().to_string());
                let event = env.event();
                event.defuse();
                let request = WriteRequest {
                    data: data.to_vec(),
                    all: true,
                    event,
                };
                let submitted = writes.submit(request);
                debug_assert!(submitted.is_ok(), "a fresh slot takes the first request");
                false
            }
            None => {
                headers.insert("Transfer-Encoding", "chunked");
                true
            }
        };
        Self {
            start_line,
            headers: RefCell::new(headers),
            chunked,
            sent: env.event(),
            writes,
        }
    }

    pub(crate) fn fail(&self, error: Error) {
        if let Some(write) = self.writes.fail(error.clone()) {
            write.event.settle(Err(error.clone()));
        }
        if !self.sent.triggered() {
            if error.is_uncritical() {
                self.sent.defuse();
            }
            self.sent.settle(Err(error));
        }
    }

    fn write(&self, env: &Environment, data: &[u8]) -> Result<Event<()>, Error> {
        let event = env.event();
        let request = WriteRequest {
            data: data.to_vec(),
            all: data.is_empty(),
            event: event.clone(),
        };
        match self.writes.submit(request) {
            Ok(()) => Ok(event),
            Err(Rejected::Busy) => Err(UsageError::ConcurrentWrite.into()),
            Err(Rejected::Closed) => Err(UsageError::MessageAlreadySent.into()),
            Err(Rejected::Failed(e)) => Err(e),
        }
    }
}

/// A request received by a [`Service`](super::Service).
#[derive(Clone)]
pub struct InRequest {
    pub(crate) channel: Rc<Channel>,
    pub(crate) message: Rc<Incoming>,
}

impl InRequest {
    fn start(&self) -> (String, String, String) {
        match self.message.head.borrow().as_ref() {
            Some((StartLine::Request { method, uri, version }, _)) => {
                (method.clone(), uri.clone(), version.clone())
            }
            _ => Default::default(),
        }
    }

    /// Empty until the header has been parsed.
    pub fn method(&self) -> String {
        self.start().0
    }

    pub fn uri(&self) -> String {
        self.start().1
    }

    pub fn version(&self) -> String {
        self.start().2
    }

    /// The URI without its query.
    pub fn path(&self) -> String {
        let uri = self.uri();
        match uri.split_once('?') {
            Some((path, _)) => path.into(),
            None => uri,
        }
    }

    pub fn query(&self) -> Option<String> {
        self.uri().split_once('?').map(|(_, query)| query.into())
    }

    pub fn headers(&self) -> Headers {
        self.message.headers()
    }

    /// Position of the request on its connection.
    pub fn id(&self) -> u64 {
        self.message.id
    }

    /// Reads the next chunk of the body. Once the body is exhausted reads
    /// succeed with no data.
    pub fn read(&self) -> Result<Event<Vec<u8>>, Error> {
        self.message.read(self.channel.env(), false)
    }

    pub fn read_all(&self) -> Result<Event<Vec<u8>>, Error> {
        self.message.read(self.channel.env(), true)
    }

    /// Queues the response. Requests have to be answered in the order they
    /// were received.
    pub fn respond(
        &self,
        code: u16,
        phrase: &str,
        headers: Headers,
        data: Option<&[u8]>,
    ) -> Result<OutResponse, Error> {
        let message = self.channel.respond(self.message.id, code, phrase, headers, data)?;
        Ok(OutResponse {
            env: self.channel.env().clone(),
            message,
            code,
        })
    }

    pub fn defuse(&self) {
        self.message.parsed.defuse();
    }
}

impl IntoFuture for InRequest {
    type Output = Result<InRequest, Error>;
    type IntoFuture = Completion<InRequest>;

    fn into_future(self) -> Self::IntoFuture {
        Completion::new(self.message.parsed.clone(), self)
    }
}

/// A response received by a [`Client`](super::Client).
#[derive(Clone)]
pub struct InResponse {
    pub(crate) channel: Rc<Channel>,
    pub(crate) message: Rc<Incoming>,
}

impl InResponse {
    fn start(&self) -> (String, u16, String) {
        match self.message.head.borrow().as_ref() {
            Some((StartLine::Response { version, code, phrase }, _)) => {
                (version.clone(), *code, phrase.clone())
            }
            _ => Default::default(),
        }
    }

    /// Zero until the header has been parsed.
    pub fn code(&self) -> u16 {
        self.start().1
    }

    pub fn phrase(&self) -> String {
        self.start().2
    }

    pub fn version(&self) -> String {
        self.start().0
    }

    pub fn headers(&self) -> Headers {
        self.message.headers()
    }

    pub fn read(&self) -> Result<Event<Vec<u8>>, Error> {
        self.message.read(self.channel.env(), false)
    }

    pub fn read_all(&self) -> Result<Event<Vec<u8>>, Error> {
        self.message.read(self.channel.env(), true)
    }

    pub fn defuse(&self) {
        self.message.parsed.defuse();
    }
}

impl IntoFuture for InResponse {
    type Output = Result<InResponse, Error>;
    type IntoFuture = Completion<InResponse>;

    fn into_future(self) -> Self::IntoFuture {
        Completion::new(self.message.parsed.clone(), self)
    }
}

/// A request sent by a [`Client`](super::Client).
#[derive(Clone)]
pub struct OutRequest {
    pub(crate) channel: Rc<Channel>,
    pub(crate) message: Rc<Outgoing>,
    pub(crate) method: String,
    pub(crate) uri: String,
}

impl OutRequest {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Writes one chunk of the body. Writing no data finishes the body.
    pub fn write(&self, data: &[u8]) -> Result<Event<()>, Error> {
        self.message.write(self.channel.env(), data)
    }

    pub fn finish(&self) -> Result<Event<()>, Error> {
        self.write(&[])
    }

    /// The response to this request. Responses are paired with requests in
    /// the order the requests were sent.
    pub fn response(&self) -> Result<InResponse, Error> {
        let message = self.channel.queue_incoming()?;
        Ok(InResponse {
            channel: self.channel.clone(),
            message,
        })
    }

    pub fn defuse(&self) {
        self.message.sent.defuse();
    }
}

impl IntoFuture for OutRequest {
    type Output = Result<OutRequest, Error>;
    type IntoFuture = Completion<OutRequest>;

    fn into_future(self) -> Self::IntoFuture {
        Completion::new(self.message.sent.clone(), self)
    }
}

/// A response sent by a [`Service`](super::Service).
#[derive(Clone)]
pub struct OutResponse {
    env: Environment,
    message: Rc<Outgoing>,
    code: u16,
}

impl OutResponse {
    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn write(&self, data: &[u8]) -> Result<Event<()>, Error> {
        self.message.write(&self.env, data)
    }

    pub fn finish(&self) -> Result<Event<()>, Error> {
        self.write(&[])
    }

    pub fn defuse(&self) {
        self.message.sent.defuse();
    }
}

impl IntoFuture for OutResponse {
    type Output = Result<OutResponse, Error>;
    type IntoFuture = Completion<OutResponse>;

    fn into_future(self) -> Self::IntoFuture {
        Completion::new(self.message.sent.clone(), self)
    }
}
