//! The cooperative scheduler.
//!
//! Everything runs on one thread. Processes are plain futures spawned on a
//! local executor and are only polled from [`Environment::step`], so a
//! process runs until it awaits an [`Event`] and resumes once the scheduler
//! has processed that event.

mod environment;
mod event;
mod handoff;
mod process;

pub use environment::{Environment, Priority};
pub(crate) use environment::Ready;
pub use event::{Completion, Event};
pub(crate) use handoff::{Handoff, Rejected};
pub use process::Process;
