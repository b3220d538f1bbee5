use super::environment::{Environment, Priority};
use crate::error::{Error, UsageError};
use std::{
    cell::{Cell, RefCell},
    fmt,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
    time::Duration,
};

type Callback<T> = Box<dyn FnOnce(&Event<T>)>;

enum State<T> {
    Pending,
    Triggered(Result<T, Error>),
    Processed(Result<T, Error>),
}

struct Inner<T> {
    state: RefCell<State<T>>,
    callbacks: RefCell<Vec<Callback<T>>>,
    waiters: RefCell<Vec<Waker>>,
    defused: Cell<bool>,
}

/// A one-shot result that becomes available at some point in simulated time.
///
/// An event is triggered exactly once with a value or an error and is later
/// processed by the scheduler, which runs its callbacks in registration
/// order and wakes every process awaiting it. A failed event that nobody
/// awaited and nobody [defused](Event::defuse) aborts the scheduler.
pub struct Event<T> {
    env: Environment,
    inner: Rc<Inner<T>>,
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            env: self.env.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.state.borrow() {
            State::Pending => "pending",
            State::Triggered(_) => "triggered",
            State::Processed(_) => "processed",
        };
        f.debug_struct("Event").field("state", &state).finish()
    }
}

impl<T: Clone + 'static> Event<T> {
    pub(crate) fn new(env: Environment) -> Self {
        Self {
            env,
            inner: Rc::new(Inner {
                state: RefCell::new(State::Pending),
                callbacks: RefCell::new(Vec::new()),
                waiters: RefCell::new(Vec::new()),
                defused: Cell::new(false),
            }),
        }
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn succeed(&self, value: T) -> Result<(), Error> {
        self.trigger(Ok(value))
    }

    pub fn fail(&self, error: Error) -> Result<(), Error> {
        self.trigger(Err(error))
    }

    /// Triggers the event and schedules it for processing at the current
    /// time.
    pub fn trigger(&self, outcome: Result<T, Error>) -> Result<(), Error> {
        self.trigger_after(outcome, Duration::ZERO)
    }

    pub(crate) fn trigger_after(
        &self,
        outcome: Result<T, Error>,
        delay: Duration,
    ) -> Result<(), Error> {
        {
            let mut state = self.inner.state.borrow_mut();
            if !matches!(*state, State::Pending) {
                return Err(UsageError::AlreadyTriggered.into());
            }
            *state = State::Triggered(outcome);
        }
        self.env
            .schedule(Rc::new(self.clone()), Priority::Normal, delay);
        Ok(())
    }

    /// Triggers an event the caller owns exclusively, where a second trigger
    /// would be a bug in this crate rather than in the application.
    pub(crate) fn settle(&self, outcome: Result<T, Error>) {
        if let Err(e) = self.trigger(outcome) {
            tracing::error!("Failed to settle event: {}", e);
        }
    }

    /// Marks a failure as handled so that it does not abort the scheduler.
    pub fn defuse(&self) {
        self.inner.defused.set(true);
    }

    pub fn defused(&self) -> bool {
        self.inner.defused.get()
    }

    pub fn triggered(&self) -> bool {
        !matches!(*self.inner.state.borrow(), State::Pending)
    }

    pub fn processed(&self) -> bool {
        matches!(*self.inner.state.borrow(), State::Processed(_))
    }

    /// The outcome once the event has been triggered.
    pub fn outcome(&self) -> Option<Result<T, Error>> {
        match &*self.inner.state.borrow() {
            State::Pending => None,
            State::Triggered(outcome) | State::Processed(outcome) => Some(outcome.clone()),
        }
    }

    pub fn ok(&self) -> bool {
        matches!(self.outcome(), Some(Ok(_)))
    }

    /// Registers a callback for when the event is processed. Callbacks added
    /// to an already processed event run immediately.
    pub fn add_callback(&self, callback: impl FnOnce(&Event<T>) + 'static) {
        if self.processed() {
            callback(self);
        } else {
            self.inner.callbacks.borrow_mut().push(Box::new(callback));
        }
    }

    pub fn map<U: Clone + 'static>(&self, f: impl FnOnce(T) -> U + 'static) -> Event<U> {
        self.map_result(|outcome| outcome.map(f))
    }

    /// Derives an event that is triggered with `f` applied to this event's
    /// outcome. Failures are handed over to the derived event.
    pub fn map_result<U: Clone + 'static>(
        &self,
        f: impl FnOnce(Result<T, Error>) -> Result<U, Error> + 'static,
    ) -> Event<U> {
        let derived = Event::new(self.env.clone());
        let target = derived.clone();
        self.add_callback(move |event| {
            event.defuse();
            if let Some(outcome) = event.outcome() {
                target.settle(f(outcome));
            }
        });
        derived
    }
}

/// Something the scheduler can pop off its queue.
pub(crate) trait Schedulable {
    fn process(&self) -> Result<(), Error>;
}

impl<T: Clone + 'static> Schedulable for Event<T> {
    fn process(&self) -> Result<(), Error> {
        let outcome = {
            let mut state = self.inner.state.borrow_mut();
            match std::mem::replace(&mut *state, State::Pending) {
                State::Triggered(outcome) => {
                    *state = State::Processed(outcome.clone());
                    outcome
                }
                other => {
                    *state = other;
                    return Ok(());
                }
            }
        };

        let callbacks = std::mem::take(&mut *self.inner.callbacks.borrow_mut());
        for callback in callbacks {
            callback(self);
        }

        let waiters = std::mem::take(&mut *self.inner.waiters.borrow_mut());
        if !waiters.is_empty() {
            // A waiting process receives the failure as the result of its await.
            self.defuse();
        }
        for waker in waiters {
            waker.wake();
        }

        match outcome {
            Err(e) if !self.defused() => Err(e),
            _ => Ok(()),
        }
    }
}

impl<T: Clone + 'static> Future for Event<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let State::Processed(outcome) = &*self.inner.state.borrow() {
            return Poll::Ready(outcome.clone());
        }
        let mut waiters = self.inner.waiters.borrow_mut();
        if !waiters.iter().any(|waker| waker.will_wake(cx.waker())) {
            waiters.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

/// Resolves to `value` once `event` has been processed successfully. Used to
/// make protocol handles awaitable.
pub struct Completion<T> {
    event: Event<()>,
    value: Option<T>,
}

impl<T> Completion<T> {
    pub(crate) fn new(event: Event<()>, value: T) -> Self {
        Self {
            event,
            value: Some(value),
        }
    }
}

impl<T: Unpin> Future for Completion<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.event).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => match self.value.take() {
                Some(value) => Poll::Ready(Ok(value)),
                None => Poll::Ready(Err(Error::BadDescriptor)),
            },
        }
    }
}
