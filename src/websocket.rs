//! WebSocket connections.
//!
//! [`WebSocket`] speaks RFC 6455, [`WebSocketHixie`] the older draft-76
//! protocol. Both start out on a plain socket, run their opening handshake
//! as a process and then exchange whole messages. Only one read and one
//! write may be outstanding at a time.

pub mod frame;
pub mod handshake;
mod hixie;

use crate::{
    config::WebSocketConfig,
    core::{Environment, Event, Handoff, Process, Rejected},
    error::{ConnectionError, Error, ProtocolError, UsageError},
    http::headers::{encode_latin1, find, parse_head, Headers, StartLine},
    socket::SharedSocket,
};
use std::{future::Future, rc::Rc};

pub use hixie::WebSocketHixie;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(data) => data,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(text) => Some(text),
            Message::Binary(_) => None,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(data) => data,
        }
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.into())
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl From<&[u8]> for Message {
    fn from(data: &[u8]) -> Self {
        Message::Binary(data.to_vec())
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Message::Binary(data)
    }
}

#[derive(Clone)]
struct WriteRequest {
    message: Message,
    event: Event<()>,
}

/// The parts both protocol versions share: the read and write slots, the
/// handshake plumbing and the frame reader and writer processes.
pub(crate) struct Endpoint<R: Clone + 'static> {
    env: Environment,
    socket: SharedSocket,
    config: WebSocketConfig,
    max_header_size: usize,
    reads: Handoff<Event<R>>,
    writes: Handoff<WriteRequest>,
}

impl<R: Clone + 'static> Endpoint<R> {
    pub(crate) fn new(socket: SharedSocket) -> Rc<Self> {
        let env = socket.env().clone();
        let config = env.config().websocket;
        let max_header_size = env.config().http.max_header_size;
        Rc::new(Self {
            config,
            max_header_size,
            reads: Handoff::new(&env),
            writes: Handoff::new(&env),
            socket,
            env,
        })
    }

    pub(crate) fn socket(&self) -> &SharedSocket {
        &self.socket
    }

    pub(crate) fn config(&self) -> &WebSocketConfig {
        &self.config
    }

    pub(crate) fn read(&self) -> Result<Event<R>, Error> {
        let event = self.env.event();
        match self.reads.submit(event.clone()) {
            Ok(()) => Ok(event),
            Err(Rejected::Busy) => Err(UsageError::ConcurrentRead.into()),
            Err(Rejected::Closed) => Err(Error::BadDescriptor),
            Err(Rejected::Failed(e)) => Err(e),
        }
    }

    pub(crate) fn write(&self, message: Message) -> Result<Event<()>, Error> {
        let event = self.env.event();
        let request = WriteRequest {
            message,
            event: event.clone(),
        };
        match self.writes.submit(request) {
            Ok(()) => Ok(event),
            Err(Rejected::Busy) => Err(UsageError::ConcurrentWrite.into()),
            Err(Rejected::Closed) => Err(Error::BadDescriptor),
            Err(Rejected::Failed(e)) => Err(e),
        }
    }

    /// Fails outstanding and future reads and writes with `error`.
    pub(crate) fn fail(&self, error: Error) {
        if let Some(read) = self.reads.fail(error.clone()) {
            read.settle(Err(error.clone()));
        }
        if let Some(write) = self.writes.fail(error.clone()) {
            write.event.settle(Err(error));
        }
    }

    pub(crate) fn close(&self) {
        self.fail(Error::BadDescriptor);
        self.socket.close();
    }

    /// Reads a header section. Returns the header and leaves whatever
    /// followed it in `data`.
    pub(crate) async fn read_head(&self, data: &mut Vec<u8>) -> Result<Vec<u8>, Error> {
        let mut from = 0;
        loop {
            if let Some(end) = find(data, b"\r\n\r\n", from) {
                return Ok(data.drain(..end + 4).take(end).collect());
            }
            if data.len() >= self.max_header_size {
                return Err(ProtocolError::HeaderTooLarge.into());
            }
            from = data.len().saturating_sub(3);
            let chunk = self.socket.read(self.config.blocksize)?.await?;
            data.extend_from_slice(&chunk);
        }
    }

    pub(crate) async fn fill(&self, data: &mut Vec<u8>, length: usize) -> Result<(), Error> {
        while data.len() < length {
            let chunk = self.socket.read(self.config.blocksize)?.await?;
            data.extend_from_slice(&chunk);
        }
        Ok(())
    }

    pub(crate) async fn write_all(&self, mut data: &[u8]) -> Result<(), Error> {
        while !data.is_empty() {
            let sent = self.socket.write(data)?.await?;
            data = &data[sent.min(data.len())..];
        }
        Ok(())
    }

    /// Runs `handshake` as a process. A failed handshake fails every read
    /// and write.
    pub(crate) fn handshake<F>(self: &Rc<Self>, handshake: F) -> Process<()>
    where
        F: Future<Output = Result<(), Error>> + 'static,
    {
        let endpoint = self.clone();
        self.env.process(async move {
            let result = handshake.await;
            if let Err(e) = &result {
                tracing::debug!("WebSocket handshake failed: {}", e);
                endpoint.fail(e.clone());
            }
            result
        })
    }

    /// Starts the frame reader on `data` and the socket, and the frame writer.
    pub(crate) fn start<D, E>(self: &Rc<Self>, data: Vec<u8>, decode: D, encode: E)
    where
        D: FnMut(&mut Vec<u8>) -> Result<Option<R>, Error> + 'static,
        E: Fn(&Message) -> Vec<u8> + 'static,
    {
        self.env
            .process(self.clone().read_frames(data, decode))
            .defuse();
        self.env.process(self.clone().write_frames(encode)).defuse();
    }

    async fn read_frames<D>(self: Rc<Self>, mut data: Vec<u8>, mut decode: D) -> Result<(), Error>
    where
        D: FnMut(&mut Vec<u8>) -> Result<Option<R>, Error>,
    {
        let mut current = None;
        let result = self.read_loop(&mut data, &mut decode, &mut current).await;
        if let Err(e) = &result {
            tracing::debug!("WebSocket reader stopped: {}", e);
            if let Some(read) = self.reads.fail(e.clone()) {
                read.settle(Err(e.clone()));
            }
            if let Some(read) = current.filter(|read: &Event<R>| !read.triggered()) {
                read.settle(Err(e.clone()));
            }
        }
        result
    }

    async fn read_loop<D>(
        &self,
        data: &mut Vec<u8>,
        decode: &mut D,
        current: &mut Option<Event<R>>,
    ) -> Result<(), Error>
    where
        D: FnMut(&mut Vec<u8>) -> Result<Option<R>, Error>,
    {
        loop {
            let read = self.reads.pending()?.await?;
            self.reads.reopen();
            // Failed while it was waiting to be taken.
            if read.triggered() {
                continue;
            }
            *current = Some(read.clone());
            let message = loop {
                if let Some(message) = decode(data)? {
                    break message;
                }
                let chunk = self.socket.read(self.config.blocksize)?.await?;
                data.extend_from_slice(&chunk);
            };
            *current = None;
            read.settle(Ok(message));
        }
    }

    async fn write_frames<E>(self: Rc<Self>, encode: E) -> Result<(), Error>
    where
        E: Fn(&Message) -> Vec<u8>,
    {
        let mut current = None;
        let result = self.write_loop(&encode, &mut current).await;
        if let Err(e) = &result {
            tracing::debug!("WebSocket writer stopped: {}", e);
            if let Some(write) = self.writes.fail(e.clone()) {
                write.event.settle(Err(e.clone()));
            }
            if let Some(write) = current.filter(|write: &WriteRequest| !write.event.triggered()) {
                write.event.settle(Err(e.clone()));
            }
        }
        result
    }

    async fn write_loop<E>(&self, encode: &E, current: &mut Option<WriteRequest>) -> Result<(), Error>
    where
        E: Fn(&Message) -> Vec<u8>,
    {
        loop {
            let write = self.writes.pending()?.await?;
            self.writes.reopen();
            if write.event.triggered() {
                continue;
            }
            *current = Some(write.clone());
            self.write_all(&encode(&write.message)).await?;
            *current = None;
            write.event.settle(Ok(()));
        }
    }
}

/// Reads and parses the header of an upgrade request or response.
pub(crate) async fn read_headers<R: Clone + 'static>(
    endpoint: &Endpoint<R>,
    data: &mut Vec<u8>,
    request: bool,
) -> Result<(StartLine, Headers), Error> {
    let head = endpoint.read_head(data).await?;
    parse_head(&head, request)
}

/// An RFC 6455 WebSocket.
///
/// ```no_run
/// # use simio::{websocket::{Message, WebSocket}, Environment, Socket};
/// # fn main() -> Result<(), simio::Error> {
/// let env = Environment::virtual_net();
/// let server = env.serve("127.0.0.1:9000".parse().unwrap(), 5)?;
/// let client = WebSocket::new(env.connect("127.0.0.1:9000".parse().unwrap())?);
/// env.block_on(async move {
///     client.handshake_client("/chat");
///     let service = WebSocket::new(server.accept()?.await?);
///     service.handshake_server(None).await?;
///     client.write("hello")?.await?;
///     assert_eq!(service.read()?.await?, Message::Text("hello".into()));
///     Ok(())
/// })
/// # }
/// ```
#[derive(Clone)]
pub struct WebSocket {
    endpoint: Rc<Endpoint<Message>>,
}

impl WebSocket {
    pub fn new(socket: SharedSocket) -> Self {
        Self {
            endpoint: Endpoint::new(socket),
        }
    }

    pub fn socket(&self) -> &SharedSocket {
        self.endpoint.socket()
    }

    /// Answers an upgrade request. `headers` are the already parsed headers
    /// of the request, without them the request is read from the socket.
    pub fn handshake_server(&self, headers: Option<Headers>) -> Process<()> {
        let endpoint = self.endpoint.clone();
        self.endpoint.handshake(async move {
            let mut data = Vec::new();
            let headers = match headers {
                Some(headers) => headers,
                None => read_headers(&endpoint, &mut data, true).await?.1,
            };
            if let Some(version) = headers.get("Sec-WebSocket-Version") {
                if version.trim() != "13" {
                    return Err(ProtocolError::UnsupportedVersion(version.into()).into());
                }
            }
            let key = headers
                .get("Sec-WebSocket-Key")
                .ok_or(ProtocolError::MissingHeader("Sec-WebSocket-Key"))?;
            let response = format!(
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Accept: {}\r\n\r\n",
                handshake::accept_key(key.trim())
            );
            endpoint.write_all(response.as_bytes()).await?;
            start(&endpoint, data, true);
            Ok(())
        })
    }

    /// Sends an upgrade request for `uri` and verifies the answer.
    pub fn handshake_client(&self, uri: &str) -> Process<()> {
        let endpoint = self.endpoint.clone();
        let uri = uri.to_string();
        self.endpoint.handshake(async move {
            let key = handshake::client_key();
            let host = endpoint.socket().peer_address()?;
            let request: Headers = [
                ("Host", host.to_string()),
                ("Upgrade", "websocket".into()),
                ("Connection", "Upgrade".into()),
                ("Sec-WebSocket-Key", key.clone()),
                ("Sec-WebSocket-Version", "13".into()),
            ]
            .into_iter()
            .collect();
            let head = format!("GET {} HTTP/1.1\r\n{}\r\n", uri, request);
            endpoint.write_all(&encode_latin1(&head)).await?;

            let mut data = Vec::new();
            let (start_line, headers) = read_headers(&endpoint, &mut data, false).await?;
            if let StartLine::Response { code, .. } = start_line {
                if code != 101 {
                    return Err(ProtocolError::UnexpectedStatus(code).into());
                }
            }
            let accept = headers
                .get("Sec-WebSocket-Accept")
                .ok_or(ProtocolError::MissingHeader("Sec-WebSocket-Accept"))?;
            if accept.trim() != handshake::accept_key(&key) {
                return Err(ProtocolError::AcceptKeyMismatch.into());
            }
            start(&endpoint, data, false);
            Ok(())
        })
    }

    /// Receives the next message.
    pub fn read(&self) -> Result<Event<Message>, Error> {
        self.endpoint.read()
    }

    pub fn write(&self, message: impl Into<Message>) -> Result<Event<()>, Error> {
        self.endpoint.write(message.into())
    }

    pub fn close(&self) {
        self.endpoint.close();
    }
}

/// Servers expect masked frames and send unmasked ones, clients the reverse.
fn start(endpoint: &Rc<Endpoint<Message>>, data: Vec<u8>, serving: bool) {
    let socket = endpoint.socket().clone();
    let max_frame_size = endpoint.config().max_frame_size;
    let decode = move |data: &mut Vec<u8>| -> Result<Option<Message>, Error> {
        let decoded = frame::decode_frame_within(data, serving, max_frame_size)?;
        let Some((decoded, used)) = decoded else {
            return Ok(None);
        };
        data.drain(..used);
        match decoded.opcode {
            frame::TEXT => String::from_utf8(decoded.payload)
                .map(|text| Some(Message::Text(text)))
                .map_err(|_| ProtocolError::InvalidUtf8.into()),
            frame::BINARY => Ok(Some(Message::Binary(decoded.payload))),
            frame::CLOSE => {
                socket.close();
                Err(ConnectionError::Reset.into())
            }
            opcode => Err(ProtocolError::UnsupportedOpcode(opcode).into()),
        }
    };
    let encode = move |message: &Message| {
        let opcode = match message {
            Message::Text(_) => frame::TEXT,
            Message::Binary(_) => frame::BINARY,
        };
        let mask = (!serving).then(rand::random::<[u8; 4]>);
        frame::encode_frame(opcode, message.as_bytes(), mask)
    };
    endpoint.start(data, decode, encode);
}
