//! HTTP/1.1 with pipelining.
//!
//! A [`Service`] receives requests and answers them, a [`Client`] sends
//! requests and receives responses. Both sides may queue many messages
//! without waiting for earlier ones. Responses are always transmitted in the
//! order their requests arrived.
//!
//! ```no_run
//! # use simio::{http::{Client, Headers, Service}, Environment, Socket};
//! # fn main() -> Result<(), simio::Error> {
//! let env = Environment::virtual_net();
//! let server = env.serve("127.0.0.1:8080".parse().unwrap(), 5)?;
//! let client = Client::new(env.connect("127.0.0.1:8080".parse().unwrap())?);
//! env.block_on(async move {
//!     let service = Service::new(server.accept()?.await?);
//!     let request = client.get("/")?.await?;
//!     let incoming = service.recv()?.await?;
//!     incoming.read_all()?.await?;
//!     incoming.respond(200, "OK", Headers::new(), Some(&b"hello"[..]))?.await?;
//!     let response = request.response()?.await?;
//!     assert_eq!(response.read_all()?.await?, b"hello");
//!     Ok(())
//! })
//! # }
//! ```

mod channel;
pub mod headers;
mod message;

use crate::{
    error::{Error, UsageError},
    socket::SharedSocket,
};
use channel::Channel;
use std::rc::Rc;

pub use headers::Headers;
pub use message::{InRequest, InResponse, OutRequest, OutResponse};

/// The server side of an HTTP connection.
#[derive(Clone)]
pub struct Service {
    channel: Rc<Channel>,
}

impl Service {
    pub fn new(socket: SharedSocket) -> Self {
        Self::with_excess(socket, Vec::new())
    }

    /// A service on a socket from which `excess` has already been read.
    pub fn with_excess(socket: SharedSocket, excess: Vec<u8>) -> Self {
        let config = socket.env().config().http;
        Self {
            channel: Channel::start(socket, config, true, excess),
        }
    }

    /// Receives the next request. Only one request may be waiting to be
    /// received at a time.
    pub fn recv(&self) -> Result<InRequest, Error> {
        if self.channel.receiving() {
            return Err(UsageError::AlreadyReceiving.into());
        }
        let message = self.channel.queue_incoming()?;
        Ok(InRequest {
            channel: self.channel.clone(),
            message,
        })
    }

    pub fn socket(&self) -> &SharedSocket {
        self.channel.socket()
    }

    pub fn max_header_size(&self) -> usize {
        self.channel.config().max_header_size
    }

    pub fn close(&self) {
        self.channel.close();
    }
}

/// The client side of an HTTP connection.
#[derive(Clone)]
pub struct Client {
    channel: Rc<Channel>,
}

impl Client {
    pub fn new(socket: SharedSocket) -> Self {
        let config = socket.env().config().http;
        Self {
            channel: Channel::start(socket, config, false, Vec::new()),
        }
    }

    /// Queues a request. Without `data` the body is sent chunked and has to
    /// be finished with an empty write.
    pub fn send(
        &self,
        method: &str,
        uri: &str,
        headers: Headers,
        data: Option<&[u8]>,
    ) -> Result<OutRequest, Error> {
        if self.channel.sending() {
            return Err(UsageError::AlreadySending.into());
        }
        let message =
            self.channel
                .queue_outgoing(format!("{} {} HTTP/1.1", method, uri), headers, data)?;
        Ok(OutRequest {
            channel: self.channel.clone(),
            message,
            method: method.into(),
            uri: uri.into(),
        })
    }

    /// A request without a body.
    pub fn get(&self, uri: &str) -> Result<OutRequest, Error> {
        self.send("GET", uri, Headers::new(), Some(&[][..]))
    }

    pub fn put(&self, uri: &str, data: Option<&[u8]>) -> Result<OutRequest, Error> {
        self.send("PUT", uri, Headers::new(), data)
    }

    pub fn socket(&self) -> &SharedSocket {
        self.channel.socket()
    }

    pub fn close(&self) {
        self.channel.close();
    }
}
