//! Readiness backends.
//!
//! A backend owns the clock and knows how to wait for descriptors to become
//! readable or writable. The scheduler hands it a deadline and a dispatch
//! function and the backend calls that function for every descriptor it
//! found ready. All backends share this interface and differ only in how
//! they wait.

pub mod dispatch;
pub mod poll;
pub mod select;
pub mod virtual_net;

use crate::{error::Error, socket::Network};
use std::{
    ops::{BitAnd, BitOr},
    os::fd::RawFd,
    rc::Rc,
    time::{Duration, Instant},
};

/// Readiness a descriptor is waiting for, or has reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const NONE: Interest = Interest {
        read: false,
        write: false,
    };
    pub const READ: Interest = Interest {
        read: true,
        write: false,
    };
    pub const WRITE: Interest = Interest {
        read: false,
        write: true,
    };
    pub const BOTH: Interest = Interest {
        read: true,
        write: true,
    };

    pub fn is_empty(&self) -> bool {
        !self.read && !self.write
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest {
            read: self.read || rhs.read,
            write: self.write || rhs.write,
        }
    }
}

impl BitAnd for Interest {
    type Output = Interest;

    fn bitand(self, rhs: Interest) -> Interest {
        Interest {
            read: self.read && rhs.read,
            write: self.write && rhs.write,
        }
    }
}

pub type Dispatch<'a> = dyn FnMut(RawFd, Interest) + 'a;

pub trait Backend {
    /// Time elapsed since the backend was created.
    fn now(&self) -> Duration;

    /// The factory for sockets living on this backend.
    fn network(&self) -> Rc<dyn Network>;

    /// Replaces the readiness `fd` waits for. Descriptors are registered on
    /// their first call and an empty interest parks them.
    fn want(&mut self, _fd: RawFd, _interest: Interest) -> Result<(), Error> {
        Ok(())
    }

    /// Forgets `fd`. Must be called before the descriptor is closed.
    fn unregister(&mut self, _fd: RawFd) {}

    /// Waits until `deadline` or until descriptors become ready and passes
    /// each ready descriptor to `dispatch`. Fails with
    /// [`Error::EmptySchedule`] when there is neither a deadline nor anything
    /// to wait for.
    fn iowait(&mut self, deadline: Option<Duration>, dispatch: &mut Dispatch<'_>)
        -> Result<(), Error>;
}

/// Wall clock shared by the OS backends.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Clock {
    start: Instant,
}

impl Clock {
    pub(crate) fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub(crate) fn now(&self) -> Duration {
        self.start.elapsed()
    }

    /// Time left until `deadline`, or `None` to wait indefinitely.
    pub(crate) fn timeout(&self, deadline: Option<Duration>) -> Option<Duration> {
        deadline.map(|deadline| deadline.saturating_sub(self.now()))
    }
}
