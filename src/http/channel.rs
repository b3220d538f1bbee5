use super::{
    headers::{encode_latin1, find, parse_chunk_size, parse_head, Headers},
    message::{Incoming, Outgoing, ReadRequest, WriteRequest},
};
use crate::{
    config::HttpConfig,
    core::{Environment, Event},
    error::{Error, ProtocolError, UsageError},
    socket::SharedSocket,
};
use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
};

/// How the length of a body is determined.
enum Body {
    Chunked,
    Length(usize),
    Empty,
}

impl Body {
    fn of(headers: &Headers) -> Result<Self, Error> {
        if headers.contains("Transfer-Encoding") {
            return Ok(Body::Chunked);
        }
        match headers.get("Content-Length") {
            Some(length) => length
                .trim()
                .parse()
                .map(Body::Length)
                .map_err(|_| ProtocolError::MalformedContentLength(length.into()).into()),
            None => Ok(Body::Empty),
        }
    }
}

#[derive(Default)]
struct ReaderState {
    data: Vec<u8>,
    message: Option<Rc<Incoming>>,
    read: Option<ReadRequest>,
}

#[derive(Default)]
struct WriterState {
    message: Option<Rc<Outgoing>>,
    write: Option<WriteRequest>,
}

/// One HTTP connection. A reader process parses incoming messages in the
/// order they were queued and a writer process transmits outgoing ones.
pub(crate) struct Channel {
    env: Environment,
    socket: SharedSocket,
    config: HttpConfig,
    /// Whether incoming messages are requests.
    serving: bool,
    recv_queue: RefCell<Option<VecDeque<Rc<Incoming>>>>,
    send_queue: RefCell<Option<VecDeque<Rc<Outgoing>>>>,
    in_wait: RefCell<Option<Event<()>>>,
    out_wait: RefCell<Option<Event<()>>>,
    reader_error: RefCell<Option<Error>>,
    writer_error: RefCell<Option<Error>>,
    next_in_id: Cell<u64>,
    next_response_id: Cell<u64>,
}

impl Channel {
    pub(crate) fn start(
        socket: SharedSocket,
        config: HttpConfig,
        serving: bool,
        excess: Vec<u8>,
    ) -> Rc<Self> {
        let env = socket.env().clone();
        let channel = Rc::new(Self {
            env: env.clone(),
            socket,
            config,
            serving,
            recv_queue: RefCell::new(Some(VecDeque::new())),
            send_queue: RefCell::new(Some(VecDeque::new())),
            in_wait: RefCell::new(None),
            out_wait: RefCell::new(None),
            reader_error: RefCell::new(None),
            writer_error: RefCell::new(None),
            next_in_id: Cell::new(0),
            next_response_id: Cell::new(0),
        });
        // Failures are handed to the messages and become the standing error.
        env.process(channel.clone().read_messages(excess)).defuse();
        env.process(channel.clone().write_messages()).defuse();
        channel
    }

    pub(crate) fn env(&self) -> &Environment {
        &self.env
    }

    pub(crate) fn socket(&self) -> &SharedSocket {
        &self.socket
    }

    pub(crate) fn config(&self) -> &HttpConfig {
        &self.config
    }

    pub(crate) fn receiving(&self) -> bool {
        self.recv_queue
            .borrow()
            .as_ref()
            .map_or(false, |queue| !queue.is_empty())
    }

    pub(crate) fn sending(&self) -> bool {
        self.send_queue
            .borrow()
            .as_ref()
            .map_or(false, |queue| !queue.is_empty())
    }

    fn reader_error(&self) -> Error {
        self.reader_error
            .borrow()
            .clone()
            .unwrap_or(Error::BadDescriptor)
    }

    fn writer_error(&self) -> Error {
        self.writer_error
            .borrow()
            .clone()
            .unwrap_or(Error::BadDescriptor)
    }

    pub(crate) fn queue_incoming(&self) -> Result<Rc<Incoming>, Error> {
        let message = {
            let mut queue = self.recv_queue.borrow_mut();
            let queue = match queue.as_mut() {
                Some(queue) => queue,
                None => return Err(self.reader_error()),
            };
            let id = self.next_in_id.get();
            self.next_in_id.set(id + 1);
            let message = Rc::new(Incoming::new(&self.env, id));
            queue.push_back(message.clone());
            message
        };
        if let Some(wait) = self.in_wait.borrow_mut().take() {
            wait.settle(Ok(()));
        }
        Ok(message)
    }

    pub(crate) fn queue_outgoing(
        &self,
        start_line: String,
        headers: Headers,
        data: Option<&[u8]>,
    ) -> Result<Rc<Outgoing>, Error> {
        let message = {
            let mut queue = self.send_queue.borrow_mut();
            let queue = match queue.as_mut() {
                Some(queue) => queue,
                None => return Err(self.writer_error()),
            };
            let message = Rc::new(Outgoing::new(&self.env, start_line, headers, data));
            queue.push_back(message.clone());
            message
        };
        if let Some(wait) = self.out_wait.borrow_mut().take() {
            wait.settle(Ok(()));
        }
        Ok(message)
    }

    pub(crate) fn respond(
        &self,
        request_id: u64,
        code: u16,
        phrase: &str,
        headers: Headers,
        data: Option<&[u8]>,
    ) -> Result<Rc<Outgoing>, Error> {
        if request_id != self.next_response_id.get() {
            return Err(UsageError::OutOfOrderResponse.into());
        }
        let message = self.queue_outgoing(format!("HTTP/1.1 {} {}", code, phrase), headers, data)?;
        self.next_response_id.set(request_id + 1);
        Ok(message)
    }

    /// Stops the idle reader and writer and closes the socket.
    pub(crate) fn close(&self) {
        let waits = [self.in_wait.borrow_mut().take(), self.out_wait.borrow_mut().take()];
        for wait in waits.into_iter().flatten() {
            wait.settle(Err(Error::BadDescriptor));
        }
        self.socket.close();
    }

    async fn read_messages(self: Rc<Self>, excess: Vec<u8>) -> Result<(), Error> {
        let mut state = ReaderState {
            data: excess,
            ..Default::default()
        };
        let result = self.read_loop(&mut state).await;
        if let Err(e) = &result {
            tracing::debug!(serving = self.serving, "HTTP reader stopped: {}", e);
            self.fail_reader(e.clone(), state);
        }
        result
    }

    async fn next_incoming(&self) -> Result<Rc<Incoming>, Error> {
        loop {
            let wait = {
                let mut queue = self.recv_queue.borrow_mut();
                let queue = queue.as_mut().ok_or(Error::BadDescriptor)?;
                if let Some(message) = queue.pop_front() {
                    return Ok(message);
                }
                let wait = self.env.event();
                *self.in_wait.borrow_mut() = Some(wait.clone());
                wait
            };
            wait.await?;
        }
    }

    /// Reads until `marker` shows up and returns its offset. The marker has to
    /// start within `max_header_size` bytes and nothing past that point is
    /// read while looking for it.
    async fn fill_until(
        &self,
        data: &mut Vec<u8>,
        marker: &[u8],
        limit: ProtocolError,
    ) -> Result<usize, Error> {
        let max = self.config.max_header_size;
        let mut from = 0;
        loop {
            if let Some(index) = find(data, marker, from) {
                if index > max {
                    return Err(limit.into());
                }
                return Ok(index);
            }
            let wanted = (max + marker.len()).saturating_sub(data.len());
            if wanted == 0 {
                return Err(limit.into());
            }
            from = data.len().saturating_sub(marker.len() - 1);
            let chunk = self.socket.read(wanted.min(self.config.blocksize))?.await?;
            data.extend_from_slice(&chunk);
        }
    }

    async fn fill(&self, data: &mut Vec<u8>, length: usize) -> Result<(), Error> {
        while data.len() < length {
            let chunk = self.socket.read(self.config.blocksize)?.await?;
            data.extend_from_slice(&chunk);
        }
        Ok(())
    }

    async fn next_read(&self, message: &Incoming, state: &mut ReaderState) -> Result<ReadRequest, Error> {
        let read = message.reads.pending()?.await?;
        message.reads.reopen();
        state.read = Some(read.clone());
        Ok(read)
    }

    async fn read_loop(&self, state: &mut ReaderState) -> Result<(), Error> {
        loop {
            state.message = None;
            let message = self.next_incoming().await?;
            state.message = Some(message.clone());

            let end = self
                .fill_until(&mut state.data, b"\r\n\r\n", ProtocolError::HeaderTooLarge)
                .await?;
            let head: Vec<u8> = state.data.drain(..end + 4).take(end).collect();
            let (start, headers) = parse_head(&head, self.serving)?;
            let body = Body::of(&headers);
            *message.head.borrow_mut() = Some((start, headers));
            message.parsed.settle(Ok(()));

            match body? {
                Body::Chunked => self.read_chunked(&message, state).await?,
                Body::Length(length) => {
                    let read = self.next_read(&message, state).await?;
                    self.fill(&mut state.data, length).await?;
                    let body = state.data.drain(..length).collect();
                    state.read = None;
                    read.event.settle(Ok(body));
                }
                Body::Empty => {
                    let read = self.next_read(&message, state).await?;
                    state.read = None;
                    read.event.settle(Ok(Vec::new()));
                }
            }

            if let Some(read) = message.reads.close() {
                read.event.settle(Ok(Vec::new()));
            }
        }
    }

    async fn read_chunked(&self, message: &Incoming, state: &mut ReaderState) -> Result<(), Error> {
        loop {
            let read = self.next_read(message, state).await?;
            let mut body = Vec::new();
            let mut finished = false;
            loop {
                let end = self
                    .fill_until(&mut state.data, b"\r\n", ProtocolError::ChunkHeaderTooLarge)
                    .await?;
                let size = parse_chunk_size(&state.data[..end])?;
                state.data.drain(..end + 2);
                if size == 0 {
                    finished = true;
                    break;
                }
                self.fill(&mut state.data, size + 2).await?;
                body.extend(state.data.drain(..size + 2).take(size));
                if !read.all {
                    break;
                }
            }
            state.read = None;
            read.event.settle(Ok(body));
            if finished {
                break;
            }
        }

        // The trailer ends with an empty line and is discarded.
        loop {
            let end = self
                .fill_until(&mut state.data, b"\r\n", ProtocolError::ChunkTrailerTooLarge)
                .await?;
            state.data.drain(..end + 2);
            if end == 0 {
                return Ok(());
            }
        }
    }

    fn fail_reader(&self, error: Error, state: ReaderState) {
        *self.reader_error.borrow_mut() = Some(error.clone());
        let out_wait = self.out_wait.borrow_mut().take();
        if let Some(wait) = out_wait {
            wait.settle(Err(error.clone()));
        }
        if let Some(read) = state.read.filter(|read| !read.event.triggered()) {
            read.event.settle(Err(error.clone()));
        }
        let queued = self.recv_queue.borrow_mut().take().unwrap_or_default();
        for message in state.message.into_iter().chain(queued) {
            message.fail(error.clone());
        }
    }

    async fn write_messages(self: Rc<Self>) -> Result<(), Error> {
        let mut state = WriterState::default();
        let result = self.write_loop(&mut state).await;
        if let Err(e) = &result {
            tracing::debug!(serving = self.serving, "HTTP writer stopped: {}", e);
            self.fail_writer(e.clone(), state);
        }
        result
    }

    async fn next_outgoing(&self) -> Result<Rc<Outgoing>, Error> {
        loop {
            let wait = {
                let mut queue = self.send_queue.borrow_mut();
                let queue = queue.as_mut().ok_or(Error::BadDescriptor)?;
                if let Some(message) = queue.pop_front() {
                    return Ok(message);
                }
                let wait = self.env.event();
                *self.out_wait.borrow_mut() = Some(wait.clone());
                wait
            };
            wait.await?;
        }
    }

    async fn write_all(&self, mut data: &[u8]) -> Result<(), Error> {
        while !data.is_empty() {
            let sent = self.socket.write(data)?.await?;
            data = &data[sent.min(data.len())..];
        }
        Ok(())
    }

    async fn next_write(&self, message: &Outgoing, state: &mut WriterState) -> Result<WriteRequest, Error> {
        let write = message.writes.pending()?.await?;
        message.writes.reopen();
        state.write = Some(write.clone());
        Ok(write)
    }

    async fn write_loop(&self, state: &mut WriterState) -> Result<(), Error> {
        loop {
            state.message = None;
            let message = self.next_outgoing().await?;
            state.message = Some(message.clone());

            let head = {
                let mut headers = message.headers.borrow_mut();
                headers.insert("Connection", "Keep-Alive");
                format!("{}\r\n{}\r\n", message.start_line, headers)
            };
            self.write_all(&encode_latin1(&head)).await?;
            message.sent.settle(Ok(()));

            if message.chunked {
                loop {
                    let write = self.next_write(&message, state).await?;
                    let mut chunk = Vec::new();
                    if !write.data.is_empty() {
                        chunk.extend_from_slice(format!("{:x}\r\n", write.data.len()).as_bytes());
                        chunk.extend_from_slice(&write.data);
                        chunk.extend_from_slice(b"\r\n");
                    }
                    if write.all {
                        chunk.extend_from_slice(b"0\r\n\r\n");
                    }
                    self.write_all(&chunk).await?;
                    state.write = None;
                    write.event.settle(Ok(()));
                    if write.all {
                        break;
                    }
                }
            } else {
                let write = self.next_write(&message, state).await?;
                self.write_all(&write.data).await?;
                state.write = None;
                write.event.settle(Ok(()));
            }

            if let Some(write) = message.writes.close() {
                write.event.settle(Err(UsageError::MessageAlreadySent.into()));
            }
        }
    }

    fn fail_writer(&self, error: Error, state: WriterState) {
        *self.writer_error.borrow_mut() = Some(error.clone());
        let in_wait = self.in_wait.borrow_mut().take();
        if let Some(wait) = in_wait {
            wait.settle(Err(error.clone()));
        }
        if let Some(write) = state.write.filter(|write| !write.event.triggered()) {
            write.event.settle(Err(error.clone()));
        }
        let queued = self.send_queue.borrow_mut().take().unwrap_or_default();
        for message in state.message.into_iter().chain(queued) {
            message.fail(error.clone());
        }
    }
}
