use super::{Environment, Event};
use crate::error::Error;
use std::cell::RefCell;

enum State<R: 'static> {
    Open(Event<R>),
    Closed,
    Failed(Error),
}

/// Why a request could not be handed over.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Rejected {
    /// A request is waiting for the worker to pick it up.
    Busy,
    Closed,
    Failed(Error),
}

/// A slot through which callers pass one request at a time to a worker
/// process. The worker awaits [`Handoff::pending`] and calls
/// [`Handoff::reopen`] once it has taken the request.
pub(crate) struct Handoff<R: 'static> {
    env: Environment,
    state: RefCell<State<R>>,
}

impl<R: Clone + 'static> Handoff<R> {
    pub(crate) fn new(env: &Environment) -> Self {
        Self {
            env: env.clone(),
            state: RefCell::new(State::Open(env.event())),
        }
    }

    pub(crate) fn submit(&self, request: R) -> Result<(), Rejected> {
        let state = self.state.borrow();
        match &*state {
            State::Open(event) if event.triggered() => Err(Rejected::Busy),
            State::Open(event) => {
                let event = event.clone();
                drop(state);
                event.settle(Ok(request));
                Ok(())
            }
            State::Closed => Err(Rejected::Closed),
            State::Failed(e) => Err(Rejected::Failed(e.clone())),
        }
    }

    /// The event the next request arrives on.
    pub(crate) fn pending(&self) -> Result<Event<R>, Error> {
        match &*self.state.borrow() {
            State::Open(event) => Ok(event.clone()),
            State::Closed => Err(Error::BadDescriptor),
            State::Failed(e) => Err(e.clone()),
        }
    }

    pub(crate) fn reopen(&self) {
        let mut state = self.state.borrow_mut();
        if matches!(*state, State::Open(_)) {
            *state = State::Open(self.env.event());
        }
    }

    /// Closes the slot. Returns the request that was handed over but not yet
    /// taken.
    pub(crate) fn close(&self) -> Option<R> {
        self.replace(State::Closed)
    }

    /// Fails the slot for good. Returns the request that was handed over but
    /// not yet taken.
    pub(crate) fn fail(&self, error: Error) -> Option<R> {
        self.replace(State::Failed(error))
    }

    fn replace(&self, next: State<R>) -> Option<R> {
        let previous = std::mem::replace(&mut *self.state.borrow_mut(), next);
        match previous {
            State::Open(event) => event.outcome().and_then(Result::ok),
            _ => None,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(*self.state.borrow(), State::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_request_at_a_time() {
        let env = Environment::virtual_net();
        let slot = Handoff::new(&env);
        let pending = slot.pending().unwrap();
        assert_eq!(slot.submit(1), Ok(()));
        assert_eq!(slot.submit(2), Err(Rejected::Busy));
        assert_eq!(env.run_until(&pending), Ok(1));
        slot.reopen();
        assert_eq!(slot.submit(3), Ok(()));
        assert_eq!(slot.close(), Some(3));
        assert_eq!(slot.submit(4), Err(Rejected::Closed));
    }

    #[test]
    fn failure_returns_untaken_request() {
        let env = Environment::virtual_net();
        let slot = Handoff::new(&env);
        slot.submit(7).unwrap();
        assert_eq!(slot.fail(Error::BadDescriptor), Some(7));
        assert_eq!(
            slot.submit(8),
            Err(Rejected::Failed(Error::BadDescriptor))
        );
        assert_eq!(slot.pending().err(), Some(Error::BadDescriptor));
    }
}
