use super::{
    channel::Channel,
    codec::JsonCodec,
    hierarchy::Router,
    value::Args,
    Value,
};
use crate::{
    config::RpcConfig,
    core::{Environment, Event, Process},
    error::{Error, OverflowError, ProtocolError},
    packet::Packet,
};
use rustc_hash::FxHashMap;
use std::{
    cell::RefCell,
    collections::BTreeMap,
    fmt,
    rc::{Rc, Weak},
};

pub(crate) struct Broker {
    env: Environment,
    channel: Channel,
    router: Router,
    limit: usize,
    proxies: RefCell<FxHashMap<String, Weak<ProxyInner>>>,
}

impl Broker {
    pub(crate) fn router(&self) -> &Router {
        &self.router
    }

    /// The proxy for `path`. Live proxies are shared. A failed channel hands
    /// out no new proxies.
    pub(crate) fn proxy(self: &Rc<Self>, path: &str) -> Result<Proxy, Error> {
        if let Some(e) = self.channel.error() {
            return Err(e);
        }
        let mut proxies = self.proxies.borrow_mut();
        if let Some(inner) = proxies.get(path).and_then(Weak::upgrade) {
            return Ok(Proxy { inner });
        }
        proxies.retain(|_, proxy| proxy.strong_count() > 0);
        if proxies.len() >= self.limit {
            tracing::warn!(limit = self.limit, "Proxy limit exceeded");
            return Err(OverflowError::ProxyLimit(self.limit).into());
        }
        let inner = Rc::new(ProxyInner {
            broker: self.clone(),
            path: path.into(),
        });
        proxies.insert(path.into(), Rc::downgrade(&inner));
        Ok(Proxy { inner })
    }

    async fn handle_requests(self: Rc<Self>) -> Result<(), Error> {
        loop {
            let request = match self.channel.recv() {
                Ok(recv) => recv.await,
                Err(e) => Err(e),
            };
            let request = match request {
                Ok(request) => request,
                Err(e) => {
                    tracing::debug!("Request handler stopped: {}", e);
                    self.proxies.borrow_mut().clear();
                    return Ok(());
                }
            };
            let (path, args) = match call_parts(request.content()) {
                Ok(parts) => parts,
                Err(e) => {
                    request.reply(Err(e));
                    continue;
                }
            };
            match self.router.dispatch(&path) {
                Ok(method) => method.invoke(&self.env, request, args),
                Err(e) => request.reply(Err(e)),
            }
        }
    }
}

/// Splits the content of a call into its path and arguments.
fn call_parts(content: &Value) -> Result<(String, Args), Error> {
    match content.as_list() {
        Some([Value::Str(path), Value::List(positional), Value::Map(keywords)]) => Ok((
            path.clone(),
            Args {
                positional: positional.clone(),
                keywords: keywords.clone(),
            },
        )),
        _ => Err(ProtocolError::MalformedEnvelope.into()),
    }
}

fn call_content(path: &str, args: Args) -> Value {
    Value::List(vec![
        Value::Str(path.into()),
        Value::List(args.positional),
        Value::Map(args.keywords),
    ])
}

/// Exposes the objects of a [`Router`] to the peer of a packet connection
/// and calls the peer's objects through [`Proxy`] handles.
#[derive(Clone)]
pub struct Rpc {
    broker: Rc<Broker>,
    remote: Proxy,
    handler: Process<()>,
}

impl Rpc {
    pub fn new(packet: Packet, router: Router, config: RpcConfig) -> Result<Self, Error> {
        Self::with_codec(packet, router, config, JsonCodec::new())
    }

    /// A broker whose codec knows custom types.
    pub fn with_codec(
        packet: Packet,
        router: Router,
        config: RpcConfig,
        codec: JsonCodec,
    ) -> Result<Self, Error> {
        let env = packet.env().clone();
        let codec = Rc::new(codec);
        let broker = Rc::new(Broker {
            channel: Channel::new(packet, codec.clone(), config.message_limit),
            env: env.clone(),
            router,
            limit: config.message_limit,
            proxies: RefCell::new(FxHashMap::default()),
        });
        codec.attach(Rc::downgrade(&broker));
        let remote = broker.proxy("")?;
        let handler = env.process(broker.clone().handle_requests());
        Ok(Self {
            broker,
            remote,
            handler,
        })
    }

    /// The root object of the peer.
    pub fn remote(&self) -> &Proxy {
        &self.remote
    }

    pub fn channel(&self) -> &Channel {
        &self.broker.channel
    }

    pub fn router(&self) -> &Router {
        &self.broker.router
    }

    /// The proxy for the peer's object at `path`.
    pub fn proxy(&self, path: &str) -> Result<Proxy, Error> {
        self.broker.proxy(path)
    }

    /// The process answering requests. It stops once the channel fails.
    pub fn handler(&self) -> &Process<()> {
        &self.handler
    }

    /// Silences failures of the underlying channel.
    pub fn defuse(&self) {
        self.broker.channel.defuse();
    }

    pub fn close(&self) {
        self.broker.channel.close();
        self.broker.proxies.borrow_mut().clear();
    }
}

struct ProxyInner {
    broker: Rc<Broker>,
    path: String,
}

/// A handle on an object of the peer.
#[derive(Clone)]
pub struct Proxy {
    inner: Rc<ProxyInner>,
}

impl Proxy {
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub(crate) fn belongs_to(&self, broker: &Rc<Broker>) -> bool {
        Rc::ptr_eq(&self.inner.broker, broker)
    }

    /// The proxy for the child `name` of this object.
    pub fn child(&self, name: &str) -> Result<Proxy, Error> {
        let path = if self.inner.path.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.inner.path, name)
        };
        self.inner.broker.proxy(&path)
    }

    /// Calls the method at this proxy's path. The root path calls the
    /// object itself.
    pub fn call(&self, positional: Vec<Value>) -> Result<Event<Value>, Error> {
        self.call_with(positional, BTreeMap::new())
    }

    pub fn call_with(
        &self,
        positional: Vec<Value>,
        keywords: BTreeMap<String, Value>,
    ) -> Result<Event<Value>, Error> {
        let content = call_content(
            &self.inner.path,
            Args {
                positional,
                keywords,
            },
        );
        self.inner.broker.channel.send(content)
    }

    /// Calls method `name` of this object.
    pub fn invoke(&self, name: &str, positional: Vec<Value>) -> Result<Event<Value>, Error> {
        self.child(name)?.call(positional)
    }
}

impl PartialEq for Proxy {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner.broker, &other.inner.broker) && self.inner.path == other.inner.path
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Proxy({:?})", self.inner.path)
    }
}
