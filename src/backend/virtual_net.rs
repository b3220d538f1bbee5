//! A simulated network in virtual time.
//!
//! Hosts are plain IP addresses connected by links with a latency. Every
//! data segment and every acknowledgement travels for one latency, and the
//! receiver buffer is bounded, so slow readers slow down writers just like
//! a real TCP window does. The clock jumps straight to the next deadline,
//! which makes runs deterministic and fast.

use super::{Backend, Dispatch};
use crate::{
    config::VirtualConfig,
    core::Environment,
    error::{ConnectionError, Error},
    socket::{virtual_tcp::VirtualSocket, Network, SharedSocket},
};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use rustc_hash::FxHashMap;
use std::{
    cell::{Cell, RefCell},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    rc::{Rc, Weak},
    time::Duration,
};

pub const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

const HIGHEST_PORT: u16 = 65534;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Latency {
    Fixed(Duration),
    /// Drawn uniformly from the range for every transmission.
    Uniform { low: Duration, high: Duration },
}

struct Host {
    address: IpAddr,
    routes: FxHashMap<IpAddr, Latency>,
}

pub struct VirtualNetwork {
    this: Weak<VirtualNetwork>,
    config: VirtualConfig,
    hosts: RefCell<Vec<Host>>,
    ports: RefCell<FxHashMap<(IpAddr, u16), Weak<VirtualSocket>>>,
    port_ofs: Cell<u16>,
    rng: RefCell<SmallRng>,
}

impl VirtualNetwork {
    /// A network with a single loopback host.
    pub fn new(config: VirtualConfig) -> Rc<Self> {
        let loopback = Latency::Fixed(Duration::from_secs_f64(config.latency_ms / 1000.0));
        let network = Rc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            hosts: RefCell::new(Vec::new()),
            ports: RefCell::new(FxHashMap::default()),
            port_ofs: Cell::new(0),
            rng: RefCell::new(SmallRng::seed_from_u64(config.seed)),
        });
        network.add_host(LOOPBACK);
        network.link(LOOPBACK, LOOPBACK, loopback);
        network
    }

    pub fn config(&self) -> &VirtualConfig {
        &self.config
    }

    pub fn add_host(&self, address: IpAddr) {
        let mut hosts = self.hosts.borrow_mut();
        if !hosts.iter().any(|host| host.address == address) {
            hosts.push(Host {
                address,
                routes: FxHashMap::default(),
            });
        }
    }

    /// Connects two hosts in both directions, adding them if needed.
    pub fn link(&self, a: IpAddr, b: IpAddr, latency: Latency) {
        self.add_host(a);
        self.add_host(b);
        for host in self.hosts.borrow_mut().iter_mut() {
            if host.address == a {
                host.routes.insert(b, latency);
            }
            if host.address == b {
                host.routes.insert(a, latency);
            }
        }
    }

    pub(crate) fn sample(&self, latency: Latency) -> Duration {
        match latency {
            Latency::Fixed(latency) => latency,
            Latency::Uniform { low, high } if low < high => {
                let secs = self
                    .rng
                    .borrow_mut()
                    .gen_range(low.as_secs_f64()..=high.as_secs_f64());
                Duration::from_secs_f64(secs)
            }
            Latency::Uniform { low, .. } => low,
        }
    }

    fn port_taken(&self, ip: IpAddr, port: u16) -> bool {
        let ports = self.ports.borrow();
        let live = |key: &(IpAddr, u16)| {
            ports
                .get(key)
                .map_or(false, |socket| socket.strong_count() > 0)
        };
        if ip.is_unspecified() {
            ports.keys().any(|key| key.1 == port && live(key))
        } else {
            live(&(ip, port)) || live(&(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
        }
    }

    /// Validates a local address and picks a free port for port zero.
    pub(crate) fn allocate(&self, address: SocketAddr) -> Result<SocketAddr, Error> {
        let ip = address.ip();
        if !ip.is_unspecified() && !self.hosts.borrow().iter().any(|host| host.address == ip) {
            return Err(ConnectionError::HostUnreachable.into());
        }
        if address.port() != 0 {
            if self.port_taken(ip, address.port()) {
                return Err(ConnectionError::AddressInUse.into());
            }
            return Ok(address);
        }
        for offset in 0..HIGHEST_PORT {
            let port = 1 + (self.port_ofs.get().wrapping_add(offset)) % HIGHEST_PORT;
            if !self.port_taken(ip, port) {
                self.port_ofs.set(port);
                return Ok(SocketAddr::new(ip, port));
            }
        }
        Err(ConnectionError::AddressInUse.into())
    }

    pub(crate) fn register(&self, address: SocketAddr, socket: &Rc<VirtualSocket>) -> Result<(), Error> {
        if self.port_taken(address.ip(), address.port()) {
            return Err(ConnectionError::AddressInUse.into());
        }
        self.ports
            .borrow_mut()
            .insert((address.ip(), address.port()), Rc::downgrade(socket));
        Ok(())
    }

    pub(crate) fn unregister(&self, address: SocketAddr) {
        self.ports
            .borrow_mut()
            .remove(&(address.ip(), address.port()));
    }

    fn listener(&self, address: SocketAddr) -> Option<Rc<VirtualSocket>> {
        let ports = self.ports.borrow();
        ports
            .get(&(address.ip(), address.port()))
            .or_else(|| ports.get(&(IpAddr::V4(Ipv4Addr::UNSPECIFIED), address.port())))
            .and_then(Weak::upgrade)
            .filter(|socket| socket.is_listening())
    }

    /// The local interface used to reach `target`, with the latency in both
    /// directions.
    fn route(&self, source: IpAddr, target: IpAddr) -> Result<(IpAddr, Latency, Latency), Error> {
        let hosts = self.hosts.borrow();
        let local = hosts
            .iter()
            .filter(|host| source.is_unspecified() || host.address == source)
            .find(|host| host.routes.contains_key(&target))
            .ok_or(ConnectionError::HostUnreachable)?;
        let latency = local.routes[&target];
        let back = hosts
            .iter()
            .find(|host| host.address == target)
            .and_then(|host| host.routes.get(&local.address).copied())
            .unwrap_or(latency);
        Ok((local.address, latency, back))
    }

    /// Connects `socket` to the listener at `target`. Without a listener, or
    /// with its backlog full, the connection is refused and the socket's
    /// reads and writes fail accordingly.
    pub(crate) fn establish(
        &self,
        env: &Environment,
        socket: &Rc<VirtualSocket>,
        source: IpAddr,
        target: SocketAddr,
    ) -> Result<(), Error> {
        let (local_ip, latency, back) = self.route(source, target.ip())?;

        let Some(listener) = self.listener(target).filter(|listener| listener.has_room()) else {
            tracing::debug!(%target, "Connection refused");
            socket.refuse();
            return Ok(());
        };

        let network = self.this.upgrade().ok_or(Error::BadDescriptor)?;
        let peer = VirtualSocket::new(env, network);
        let local = self.allocate(SocketAddr::new(local_ip, 0))?;
        self.register(local, socket)?;
        let remote = self.allocate(SocketAddr::new(target.ip(), 0))?;
        self.register(remote, &peer)?;

        socket.link(local, &peer, target, latency);
        peer.link(remote, socket, local, back);
        tracing::debug!(%local, %target, "Connection established");
        listener.enqueue(peer);
        Ok(())
    }
}

impl Network for VirtualNetwork {
    fn socket(&self, env: &Environment) -> Result<SharedSocket, Error> {
        let network = self.this.upgrade().ok_or(Error::BadDescriptor)?;
        let socket: SharedSocket = VirtualSocket::new(env, network);
        Ok(socket)
    }
}

pub struct VirtualBackend {
    now: Duration,
    network: Rc<VirtualNetwork>,
}

impl VirtualBackend {
    pub fn new(config: VirtualConfig) -> Self {
        Self::with_network(VirtualNetwork::new(config))
    }

    /// A backend on a network that was set up by the caller, for example
    /// with additional hosts and links.
    pub fn with_network(network: Rc<VirtualNetwork>) -> Self {
        Self {
            now: Duration::ZERO,
            network,
        }
    }
}

impl Backend for VirtualBackend {
    fn now(&self) -> Duration {
        self.now
    }

    fn network(&self) -> Rc<dyn Network> {
        self.network.clone()
    }

    fn iowait(
        &mut self,
        deadline: Option<Duration>,
        _dispatch: &mut Dispatch<'_>,
    ) -> Result<(), Error> {
        match deadline {
            Some(deadline) => {
                self.now = self.now.max(deadline);
                Ok(())
            }
            None => Err(Error::EmptySchedule),
        }
    }
}
