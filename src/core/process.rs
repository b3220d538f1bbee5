use super::Event;
use crate::error::Error;
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// Handle to a spawned future. The process is itself an event that is
/// triggered with the future's output.
pub struct Process<T> {
    event: Event<T>,
}

impl<T> Clone for Process<T> {
    fn clone(&self) -> Self {
        Self {
            event: self.event.clone(),
        }
    }
}

impl<T: Clone + 'static> Process<T> {
    pub(crate) fn new(event: Event<T>) -> Self {
        Self { event }
    }

    pub fn event(&self) -> &Event<T> {
        &self.event
    }

    pub fn is_alive(&self) -> bool {
        !self.event.triggered()
    }

    /// A defused process may fail without aborting the scheduler.
    pub fn defuse(&self) {
        self.event.defuse();
    }
}

impl<T: Clone + 'static> Future for Process<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.event).poll(cx)
    }
}
