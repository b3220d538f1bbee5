use super::{event::Schedulable, Event, Process};
use crate::{
    backend::{
        dispatch::DispatchBackend,
        poll::{PollBackend, PollKind},
        select::SelectBackend,
        virtual_net::VirtualBackend,
        Backend, Interest,
    },
    config::Config,
    error::Error,
    socket::{Network, SharedSocket},
};
use futures::{
    executor::{LocalPool, LocalSpawner},
    task::LocalSpawnExt,
};
use rustc_hash::FxHashMap;
use std::{
    cell::{Cell, RefCell},
    cmp::Ordering,
    collections::BinaryHeap,
    fmt,
    future::Future,
    net::SocketAddr,
    os::fd::RawFd,
    rc::Rc,
    time::Duration,
};

/// Ties between events due at the same time are broken by priority first and
/// insertion order second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Urgent = 0,
    Normal = 1,
}

struct Scheduled {
    time: Duration,
    priority: Priority,
    sequence: u64,
    event: Rc<dyn Schedulable>,
}

impl Scheduled {
    fn key(&self) -> (Duration, Priority, u64) {
        (self.time, self.priority, self.sequence)
    }
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed so that the std max-heap pops the earliest entry.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

/// Queued for a freshly spawned process so that the next step returns
/// without waiting for I/O and the executor gets to poll it.
struct Initialize;

impl Schedulable for Initialize {
    fn process(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// An OS socket as seen by the scheduler: something to notify about
/// readiness and to close on shutdown.
pub(crate) trait Ready {
    fn ready(&self, readiness: Interest);
    fn close(&self);
}

enum Deferred {
    Want(RawFd, Interest),
    Unregister(RawFd),
}

struct Shared {
    backend: RefCell<Box<dyn Backend>>,
    network: Rc<dyn Network>,
    config: Config,
    clock: Cell<Duration>,
    queue: RefCell<BinaryHeap<Scheduled>>,
    sequence: Cell<u64>,
    pool: RefCell<LocalPool>,
    spawner: RefCell<LocalSpawner>,
    sockets: RefCell<FxHashMap<RawFd, Rc<dyn Ready>>>,
    deferred: RefCell<Vec<Deferred>>,
    closing: Cell<bool>,
}

/// The scheduler. Owns the clock, the event queue, the executor running all
/// processes and the backend that waits for I/O.
///
/// Environments are cheap handles; clones refer to the same scheduler.
#[derive(Clone)]
pub struct Environment {
    shared: Rc<Shared>,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("now", &self.now())
            .field("queued", &self.shared.queue.borrow().len())
            .finish()
    }
}

impl Environment {
    pub fn new(backend: impl Backend + 'static) -> Self {
        Self::with_config(backend, Config::default())
    }

    pub fn with_config(backend: impl Backend + 'static, config: Config) -> Self {
        let network = backend.network();
        let pool = LocalPool::new();
        let spawner = pool.spawner();
        let clock = backend.now();
        Self {
            shared: Rc::new(Shared {
                backend: RefCell::new(Box::new(backend)),
                network,
                config,
                clock: Cell::new(clock),
                queue: RefCell::new(BinaryHeap::new()),
                sequence: Cell::new(0),
                pool: RefCell::new(pool),
                spawner: RefCell::new(spawner),
                sockets: RefCell::new(FxHashMap::default()),
                deferred: RefCell::new(Vec::new()),
                closing: Cell::new(false),
            }),
        }
    }

    /// A deterministic environment on a simulated network.
    pub fn virtual_net() -> Self {
        Self::virtual_with_config(Config::default())
    }

    pub fn virtual_with_config(config: Config) -> Self {
        let backend = VirtualBackend::new(config.virtual_net);
        Self::with_config(backend, config)
    }

    pub fn select() -> Self {
        Self::new(SelectBackend::new())
    }

    pub fn poll() -> Result<Self, Error> {
        Ok(Self::new(PollBackend::new(PollKind::Poll)?))
    }

    pub fn epoll() -> Result<Self, Error> {
        Ok(Self::new(PollBackend::new(PollKind::Epoll)?))
    }

    pub fn dispatch() -> Result<Self, Error> {
        Ok(Self::new(DispatchBackend::new()?))
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn now(&self) -> Duration {
        match self.shared.backend.try_borrow() {
            Ok(backend) => backend.now(),
            Err(_) => self.shared.clock.get(),
        }
    }

    pub fn event<T: Clone + 'static>(&self) -> Event<T> {
        Event::new(self.clone())
    }

    /// An event that succeeds `delay` from now.
    pub fn timeout(&self, delay: Duration) -> Event<()> {
        let event = self.event();
        event.trigger_after(Ok(()), delay).ok();
        event
    }

    /// Starts `future` as a process. It first runs during the next step.
    pub fn process<T, F>(&self, future: F) -> Process<T>
    where
        T: Clone + 'static,
        F: Future<Output = Result<T, Error>> + 'static,
    {
        let event = self.event::<T>();
        let target = event.clone();
        let spawned = self.shared.spawner.borrow().spawn_local(async move {
            let outcome = future.await;
            target.settle(outcome);
        });
        match spawned {
            Ok(()) => self.schedule(Rc::new(Initialize), Priority::Urgent, Duration::ZERO),
            Err(e) => {
                tracing::error!("Failed to spawn process: {}", e);
                event.settle(Err(Error::BadDescriptor));
            }
        }
        Process::new(event)
    }

    pub(crate) fn schedule(&self, event: Rc<dyn Schedulable>, priority: Priority, delay: Duration) {
        let sequence = self.shared.sequence.get();
        self.shared.sequence.set(sequence + 1);
        self.shared.queue.borrow_mut().push(Scheduled {
            time: self.now() + delay,
            priority,
            sequence,
            event,
        });
    }

    /// Waits for I/O until the earliest event is due, processes that event
    /// and runs every process that became runnable.
    ///
    /// Returns the error of a failed event that nobody handled. Such an error
    /// is fatal and the environment should not be stepped any further.
    pub fn step(&self) -> Result<(), Error> {
        let deadline = self.shared.queue.borrow().peek().map(|next| next.time);
        if deadline.map_or(true, |deadline| deadline > self.now()) {
            self.iowait(deadline)?;
        }

        let now = self.now();
        let due = {
            let mut queue = self.shared.queue.borrow_mut();
            match queue.peek() {
                Some(next) if next.time <= now => queue.pop(),
                _ => None,
            }
        };
        let result = match due {
            Some(next) => next.event.process(),
            None => Ok(()),
        };

        self.shared.pool.borrow_mut().run_until_stalled();
        if self.shared.closing.get() {
            self.reset_pool();
        }

        if let Err(e) = &result {
            tracing::error!("Unhandled failure at {:?}: {}", now, e);
        }
        result
    }

    /// Steps until nothing is left to do.
    pub fn run(&self) -> Result<(), Error> {
        loop {
            match self.step() {
                Ok(()) => {}
                Err(Error::EmptySchedule) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Steps until `event` has been processed and returns its outcome.
    pub fn run_until<T: Clone + 'static>(&self, event: &Event<T>) -> Result<T, Error> {
        event.add_callback(|event| event.defuse());
        while !event.processed() {
            self.step()?;
        }
        event.outcome().unwrap_or(Err(Error::EmptySchedule))
    }

    /// Steps until the clock has advanced by `duration`.
    pub fn run_for(&self, duration: Duration) -> Result<(), Error> {
        let deadline = self.timeout(duration);
        self.run_until(&deadline)
    }

    /// Runs `future` as a process until it completes.
    pub fn block_on<T, F>(&self, future: F) -> Result<T, Error>
    where
        T: Clone + 'static,
        F: Future<Output = Result<T, Error>> + 'static,
    {
        let process = self.process(future);
        self.run_until(process.event())
    }

    pub fn socket(&self) -> Result<SharedSocket, Error> {
        self.shared.network.socket(self)
    }

    /// A listening socket bound to `address`.
    pub fn serve(&self, address: SocketAddr, backlog: usize) -> Result<SharedSocket, Error> {
        let socket = self.socket()?;
        socket.bind(address)?;
        socket.listen(backlog)?;
        Ok(socket)
    }

    pub fn connect(&self, address: SocketAddr) -> Result<SharedSocket, Error> {
        let socket = self.socket()?;
        socket.connect(address)?;
        Ok(socket)
    }

    /// Closes every OS socket and drops all queued events and suspended
    /// processes.
    pub fn close(&self) {
        let sockets: Vec<_> = self.shared.sockets.borrow().values().cloned().collect();
        for socket in sockets {
            socket.close();
        }
        self.shared.sockets.borrow_mut().clear();
        self.shared.queue.borrow_mut().clear();
        if self.shared.pool.try_borrow_mut().is_ok() {
            self.reset_pool();
        } else {
            self.shared.closing.set(true);
        }
    }

    fn reset_pool(&self) {
        let pool = LocalPool::new();
        *self.shared.spawner.borrow_mut() = pool.spawner();
        let old = std::mem::replace(&mut *self.shared.pool.borrow_mut(), pool);
        self.shared.closing.set(false);
        drop(old);
    }

    fn iowait(&self, deadline: Option<Duration>) -> Result<(), Error> {
        let result = {
            let mut backend = self.shared.backend.borrow_mut();
            self.shared.clock.set(backend.now());
            let sockets = &self.shared.sockets;
            backend.iowait(deadline, &mut |fd, readiness| {
                let socket = sockets.borrow().get(&fd).cloned();
                if let Some(socket) = socket {
                    socket.ready(readiness);
                }
            })
        };
        self.apply_deferred();
        result
    }

    fn apply_deferred(&self) {
        let deferred = std::mem::take(&mut *self.shared.deferred.borrow_mut());
        for change in deferred {
            match change {
                Deferred::Want(fd, interest) => {
                    if let Err(e) = self.want(fd, interest) {
                        tracing::warn!("Failed to update interest of {}: {}", fd, e);
                    }
                }
                Deferred::Unregister(fd) => self.shared.backend.borrow_mut().unregister(fd),
            }
        }
    }

    pub(crate) fn register(&self, fd: RawFd, socket: Rc<dyn Ready>) {
        self.shared.sockets.borrow_mut().insert(fd, socket);
    }

    /// Sets the readiness `fd` waits for. Changes requested while the
    /// backend is waiting are applied once the wait returns.
    pub(crate) fn want(&self, fd: RawFd, interest: Interest) -> Result<(), Error> {
        match self.shared.backend.try_borrow_mut() {
            Ok(mut backend) => backend.want(fd, interest),
            Err(_) => {
                self.shared
                    .deferred
                    .borrow_mut()
                    .push(Deferred::Want(fd, interest));
                Ok(())
            }
        }
    }

    pub(crate) fn unregister(&self, fd: RawFd) {
        self.shared.sockets.borrow_mut().remove(&fd);
        match self.shared.backend.try_borrow_mut() {
            Ok(mut backend) => backend.unregister(fd),
            Err(_) => self
                .shared
                .deferred
                .borrow_mut()
                .push(Deferred::Unregister(fd)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_advance_virtual_time() {
        let env = Environment::virtual_net();
        let timeout = env.timeout(Duration::from_secs(3));
        env.run_until(&timeout).unwrap();
        assert_eq!(env.now(), Duration::from_secs(3));
    }

    #[test]
    fn events_at_equal_times_keep_insertion_order() {
        let env = Environment::virtual_net();
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            env.timeout(Duration::from_secs(1))
                .add_callback(move |_| order.borrow_mut().push(i));
        }
        env.run().unwrap();
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn processes_resume_on_timeouts() {
        let env = Environment::virtual_net();
        let inner = env.clone();
        let result = env.block_on(async move {
            inner.timeout(Duration::from_secs(1)).await?;
            inner.timeout(Duration::from_secs(2)).await?;
            Ok(inner.now())
        });
        assert_eq!(result, Ok(Duration::from_secs(3)));
    }

    #[test]
    fn awaited_failures_are_delivered() {
        let env = Environment::virtual_net();
        let inner = env.clone();
        let result = env.block_on(async move {
            let event = inner.event::<()>();
            event.fail(Error::BadDescriptor)?;
            Ok(event.await)
        });
        assert_eq!(result, Ok(Err(Error::BadDescriptor)));
    }

    #[test]
    fn failed_processes_are_fatal_unless_defused() {
        let env = Environment::virtual_net();
        env.process(async { Err::<(), _>(Error::handler("boom")) });
        assert_eq!(env.run(), Err(Error::handler("boom")));

        let env = Environment::virtual_net();
        let process = env.process(async { Err::<(), _>(Error::handler("boom")) });
        process.defuse();
        assert_eq!(env.run(), Ok(()));
        assert!(!process.is_alive());
    }

    #[test]
    fn empty_schedule() {
        let env = Environment::virtual_net();
        assert_eq!(env.step(), Err(Error::EmptySchedule));
    }
}
