//! A backend on top of `select(2)`.

use super::{Backend, Clock, Dispatch, Interest};
use crate::{
    error::{ConnectionError, Error},
    socket::{tcp::OsNetwork, Network},
};
use rustc_hash::FxHashMap;
use std::{io, os::fd::RawFd, ptr, rc::Rc, time::Duration};

pub struct SelectBackend {
    clock: Clock,
    interests: FxHashMap<RawFd, Interest>,
    network: Rc<OsNetwork>,
}

impl SelectBackend {
    pub fn new() -> Self {
        Self {
            clock: Clock::new(),
            interests: FxHashMap::default(),
            network: Rc::new(OsNetwork),
        }
    }
}

impl Default for SelectBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for SelectBackend {
    fn now(&self) -> Duration {
        self.clock.now()
    }

    fn network(&self) -> Rc<dyn Network> {
        self.network.clone()
    }

    fn want(&mut self, fd: RawFd, interest: Interest) -> Result<(), Error> {
        if fd < 0 || fd as usize >= libc::FD_SETSIZE {
            return Err(ConnectionError::InvalidArgument.into());
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
    }

    fn iowait(
        &mut self,
        deadline: Option<Duration>,
        dispatch: &mut Dispatch<'_>,
    ) -> Result<(), Error> {
        let timeout = self.clock.timeout(deadline);
        if self.interests.is_empty() {
            return match timeout {
                Some(timeout) => {
                    std::thread::sleep(timeout);
                    Ok(())
                }
                None => Err(Error::EmptySchedule),
            };
        }

        let mut ready = Vec::new();
        // SAFETY: the fd sets live on this stack frame and every descriptor was
        // checked against FD_SETSIZE when it was registered.
        unsafe {
            let mut readable: libc::fd_set = std::mem::zeroed();
            let mut writable: libc::fd_set = std::mem::zeroed();
            libc::FD_ZERO(&mut readable);
            libc::FD_ZERO(&mut writable);
            let mut highest = 0;
            for (&fd, interest) in &self.interests {
                if interest.read {
                    libc::FD_SET(fd, &mut readable);
                }
                if interest.write {
                    libc::FD_SET(fd, &mut writable);
                }
                highest = highest.max(fd);
            }

            let mut timeval = timeout.map(|timeout| libc::timeval {
                tv_sec: timeout.as_secs() as libc::time_t,
                tv_usec: timeout.subsec_micros() as libc::suseconds_t,
            });
            let timeval = timeval
                .as_mut()
                .map_or(ptr::null_mut(), |timeval| timeval as *mut libc::timeval);

            let count = libc::select(
                highest + 1,
                &mut readable,
                &mut writable,
                ptr::null_mut(),
                timeval,
            );
            if count < 0 {
                let error = io::Error::last_os_error();
                if error.kind() == io::ErrorKind::Interrupted {
                    return Ok(());
                }
                return Err(error.into());
            }

            for (&fd, &interest) in &self.interests {
                let readiness = Interest {
                    read: libc::FD_ISSET(fd, &readable),
                    write: libc::FD_ISSET(fd, &writable),
                } & interest;
                if !readiness.is_empty() {
                    ready.push((fd, readiness));
                }
            }
        }

        for (fd, readiness) in ready {
            dispatch(fd, readiness);
        }
        Ok(())
    }
}
