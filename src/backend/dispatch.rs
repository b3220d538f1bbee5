//! A callback dispatcher driven by tokio's reactor.
//!
//! Every descriptor gets an [`AsyncFd`] on a current-thread runtime. A wait
//! blocks on the first registration that reaches the wanted readiness and
//! dispatches that one descriptor, which mirrors how a classic asynchronous
//! dispatcher hands out one callback at a time.

use super::{Backend, Clock, Dispatch, Interest};
use crate::{
    error::Error,
    socket::{tcp::OsNetwork, Network},
};
use futures::future::select_all;
use rustc_hash::FxHashMap;
use std::{
    os::fd::{AsRawFd, RawFd},
    rc::Rc,
    time::Duration,
};
use tokio::{
    io::{unix::AsyncFd, Interest as TokioInterest},
    runtime::{Builder, Runtime},
};

/// The raw descriptor as registered with the reactor. Ownership stays with
/// the socket.
struct Descriptor(RawFd);

impl AsRawFd for Descriptor {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

struct Source {
    io: AsyncFd<Descriptor>,
    interest: Interest,
}

pub struct DispatchBackend {
    clock: Clock,
    runtime: Runtime,
    sources: FxHashMap<RawFd, Source>,
    network: Rc<OsNetwork>,
}

impl DispatchBackend {
    pub fn new() -> Result<Self, Error> {
        let runtime = Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()?;
        Ok(Self {
            clock: Clock::new(),
            runtime,
            sources: FxHashMap::default(),
            network: Rc::new(OsNetwork),
        })
    }
}

fn to_tokio(interest: Interest) -> TokioInterest {
    match (interest.read, interest.write) {
        (true, false) => TokioInterest::READABLE,
        (false, true) => TokioInterest::WRITABLE,
        _ => TokioInterest::READABLE.add(TokioInterest::WRITABLE),
    }
}

impl Backend for DispatchBackend {
    fn now(&self) -> Duration {
        self.clock.now()
    }

    fn network(&self) -> Rc<dyn Network> {
        self.network.clone()
    }

    fn want(&mut self, fd: RawFd, interest: Interest) -> Result<(), Error> {
        if let Some(source) = self.sources.get_mut(&fd) {
            source.interest = interest;
            return Ok(());
        }
        if interest.is_empty() {
            return Ok(());
        }
        let _context = self.runtime.enter();
        // Registered for both directions; `interest` filters what is awaited.
        let io = AsyncFd::new(Descriptor(fd))?;
        self.sources.insert(fd, Source { io, interest });
        Ok(())
    }

    fn unregister(&mut self, fd: RawFd) {
        if let Some(source) = self.sources.remove(&fd) {
            let _context = self.runtime.enter();
            drop(source.io.into_inner());
        }
    }

    fn iowait(
        &mut self,
        deadline: Option<Duration>,
        dispatch: &mut Dispatch<'_>,
    ) -> Result<(), Error> {
        let timeout = self.clock.timeout(deadline);
        let waiting: Vec<(RawFd, &Source)> = self
            .sources
            .iter()
            .filter(|(_, source)| !source.interest.is_empty())
            .map(|(&fd, source)| (fd, source))
            .collect();

        if waiting.is_empty() {
            return match timeout {
                Some(timeout) => {
                    self.runtime.block_on(tokio::time::sleep(timeout));
                    Ok(())
                }
                None => Err(Error::EmptySchedule),
            };
        }

        let ready = self.runtime.block_on(async {
            let readiness = waiting.iter().map(|&(fd, source)| {
                Box::pin(async move {
                    let mut guard = source.io.ready(to_tokio(source.interest)).await?;
                    let ready = guard.ready();
                    let closed = ready.is_read_closed() || ready.is_write_closed();
                    let readiness = Interest {
                        read: ready.is_readable() || closed,
                        write: ready.is_writable() || closed,
                    } & source.interest;
                    // Sockets retry their operation before waiting again, so
                    // readiness can always be consumed here.
                    guard.clear_ready();
                    Ok::<_, std::io::Error>((fd, readiness))
                })
            });
            let first = select_all(readiness);
            match timeout {
                Some(timeout) => match tokio::time::timeout(timeout, first).await {
                    Ok((result, _, _)) => result.map(Some),
                    Err(_) => Ok(None),
                },
                None => first.await.0.map(Some),
            }
        })?;

        if let Some((fd, readiness)) = ready {
            if !readiness.is_empty() {
                dispatch(fd, readiness);
            }
        }
        Ok(())
    }
}
