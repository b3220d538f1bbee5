//! Backends on top of `poll(2)` and epoll.
//!
//! epoll is driven through `mio`, which registers descriptors edge-triggered.
//! That is fine here because sockets always attempt an operation before they
//! ask to wait for readiness.

use super::{Backend, Clock, Dispatch, Interest};
use crate::{
    error::Error,
    socket::{tcp::OsNetwork, Network},
};
use mio::{unix::SourceFd, Events, Token};
use rustc_hash::{FxHashMap, FxHashSet};
use rustix::{
    event::{PollFd, PollFlags},
    fd::BorrowedFd,
    io::Errno,
};
use std::{io, os::fd::RawFd, rc::Rc, time::Duration};

const EVENTS_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollKind {
    Poll,
    Epoll,
}

enum Flavour {
    Poll,
    Epoll {
        poll: mio::Poll,
        events: Events,
        registered: FxHashSet<RawFd>,
    },
}

pub struct PollBackend {
    clock: Clock,
    interests: FxHashMap<RawFd, Interest>,
    flavour: Flavour,
    network: Rc<OsNetwork>,
}

impl PollBackend {
    pub fn new(kind: PollKind) -> Result<Self, Error> {
        let flavour = match kind {
            PollKind::Poll => Flavour::Poll,
            PollKind::Epoll => Flavour::Epoll {
                poll: mio::Poll::new()?,
                events: Events::with_capacity(EVENTS_CAPACITY),
                registered: FxHashSet::default(),
            },
        };
        Ok(Self {
            clock: Clock::new(),
            interests: FxHashMap::default(),
            flavour,
            network: Rc::new(OsNetwork),
        })
    }

    pub fn kind(&self) -> PollKind {
        match self.flavour {
            Flavour::Poll => PollKind::Poll,
            Flavour::Epoll { .. } => PollKind::Epoll,
        }
    }

    fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<(RawFd, Interest)>, Error> {
        // SAFETY: registered descriptors stay open until they are
        // unregistered, which removes them from `interests`.
        let mut fds: Vec<PollFd<'_>> = self
            .interests
            .iter()
            .map(|(&fd, interest)| {
                let mut flags = PollFlags::empty();
                if interest.read {
                    flags |= PollFlags::IN;
                }
                if interest.write {
                    flags |= PollFlags::OUT;
                }
                PollFd::from_borrowed_fd(unsafe { BorrowedFd::borrow_raw(fd) }, flags)
            })
            .collect();
        let timeout = timeout.map_or(-1, |timeout| {
            // Round up so that a deadline is never missed by a millisecond.
            ((timeout.as_micros() + 999) / 1000).min(i32::MAX as u128) as i32
        });

        match rustix::event::poll(&mut fds, timeout) {
            Ok(_) => {}
            Err(Errno::INTR) => return Ok(Vec::new()),
            Err(errno) => return Err(errno.into()),
        }

        let readiness: Vec<PollFlags> = fds.iter().map(|fd| fd.revents()).collect();
        drop(fds);
        let failed = PollFlags::ERR | PollFlags::HUP;
        Ok(self
            .interests
            .iter()
            .zip(readiness)
            .filter_map(|((&fd, &interest), revents)| {
                let readiness = Interest {
                    read: revents.intersects(PollFlags::IN | failed),
                    write: revents.intersects(PollFlags::OUT | failed),
                } & interest;
                (!readiness.is_empty()).then_some((fd, readiness))
            })
            .collect())
    }
}

fn to_mio(interest: Interest) -> Option<mio::Interest> {
    match (interest.read, interest.write) {
        (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
        (true, false) => Some(mio::Interest::READABLE),
        (false, true) => Some(mio::Interest::WRITABLE),
        (false, false) => None,
    }
}

impl Backend for PollBackend {
    fn now(&self) -> Duration {
        self.clock.now()
    }

    fn network(&self) -> Rc<dyn Network> {
        self.network.clone()
    }

    fn want(&mut self, fd: RawFd, interest: Interest) -> Result<(), Error> {
        if let Flavour::Epoll {
            poll, registered, ..
        } = &mut self.flavour
        {
            let registry = poll.registry();
            let token = Token(fd as usize);
            match (to_mio(interest), registered.contains(&fd)) {
                (Some(wanted), true) => registry.reregister(&mut SourceFd(&fd), token, wanted)?,
                (Some(wanted), false) => {
                    registry.register(&mut SourceFd(&fd), token, wanted)?;
                    registered.insert(fd);
                }
                (None, true) => {
                    registry.deregister(&mut SourceFd(&fd))?;
                    registered.remove(&fd);
                }
                (None, false) => {}
            }
        }
        if interest.is_empty() {
            self.interests.remove(&fd);
        } else {
            self.interests.insert(fd, interest);
        }
        Ok(())
    }

    fn unregister(&mut self, fd: RawFd) {
        self.interests.remove(&fd);
        if let Flavour::Epoll {
            poll, registered, ..
        } = &mut self.flavour
        {
            if registered.remove(&fd) {
                if let Err(e) = poll.registry().deregister(&mut SourceFd(&fd)) {
                    tracing::debug!("Failed to deregister {}: {}", fd, e);
                }
            }
        }
    }

    fn iowait(
        &mut self,
        deadline: Option<Duration>,
        dispatch: &mut Dispatch<'_>,
    ) -> Result<(), Error> {
        let timeout = self.clock.timeout(deadline);
        if self.interests.is_empty() && timeout.is_none() {
            return Err(Error::EmptySchedule);
        }

        let ready = match &mut self.flavour {
            Flavour::Poll => self.poll(timeout)?,
            Flavour::Epoll { poll, events, .. } => {
                if let Err(e) = poll.poll(events, timeout) {
                    if e.kind() == io::ErrorKind::Interrupted {
                        return Ok(());
                    }
                    return Err(e.into());
                }
                events
                    .iter()
                    .filter_map(|event| {
                        let fd = event.token().0 as RawFd;
                        let interest = self.interests.get(&fd).copied()?;
                        let failed = event.is_error();
                        let readiness = Interest {
                            read: event.is_readable() || event.is_read_closed() || failed,
                            write: event.is_writable() || event.is_write_closed() || failed,
                        } & interest;
                        (!readiness.is_empty()).then_some((fd, readiness))
                    })
                    .collect()
            }
        };

        for (fd, readiness) in ready {
            dispatch(fd, readiness);
        }
        Ok(())
    }
}
