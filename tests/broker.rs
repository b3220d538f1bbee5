use futures::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};
use simio::{
    config::RpcConfig,
    error::{CodecError, OverflowError},
    http::{Client, Headers, Service},
    rpc::{Args, HttpRpc, JsonCodec, Methods, Node, ObjectRef, Proxy, Request, Router, Rpc, Value},
    Environment, Error, Packet,
};
use std::{
    cell::RefCell,
    net::SocketAddr,
    rc::{Rc, Weak},
    time::Duration,
};

fn address() -> SocketAddr {
    "127.0.0.1:5555".parse().unwrap()
}

/// The accepted and the connecting end of a packet connection.
fn packets(env: &Environment) -> (Packet, Packet) {
    let server = env.serve(address(), 1).unwrap();
    let client = Packet::new(env.connect(address()).unwrap());
    let accepted = Packet::new(env.run_until(&server.accept().unwrap()).unwrap());
    (accepted, client)
}

/// A broker exposing `root` and a broker calling it.
fn connect(env: &Environment, root: Router) -> (Rpc, Rpc) {
    let (a, b) = packets(env);
    let config = env.config().rpc;
    let server = Rpc::new(a, root, config).unwrap();
    let client = Rpc::new(b, Router::empty(), config).unwrap();
    (server, client)
}

fn remote_traceback(result: Result<Value, Error>) -> String {
    match result {
        Err(Error::Remote { traceback, .. }) => traceback,
        other => panic!("Expected a remote failure, got {:?}", other),
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Point {
    x: i64,
    y: i64,
}

struct Greeter;

impl Greeter {
    fn greet(&self, args: &Args) -> Result<Value, Error> {
        Ok(format!("Hi {}, I am a call", args.str(0)?).into())
    }

    fn forward(&self, args: &Args, request: Request) {
        let outcome = args
            .str(0)
            .map(|name| format!("Hi {}, I am a passthru call", name).into());
        match outcome {
            Ok(value) => request.succeed(value).unwrap(),
            Err(e) => request.fail(e).unwrap(),
        }
    }

    fn functor(&self, args: &Args) -> Result<Value, Error> {
        Ok(format!("Hi {}, I am a functor call", args.str(0)?).into())
    }

    fn process(
        _: Rc<Self>,
        env: Environment,
        args: Args,
    ) -> LocalBoxFuture<'static, Result<Value, Error>> {
        Box::pin(async move {
            let event = env.event::<String>();
            event.succeed(args.str(0)?.to_string())?;
            let name = event.await?;
            Ok(format!("Hi {}, I am a process call", name).into())
        })
    }

    fn delayed_greet(
        _: Rc<Self>,
        env: Environment,
        _: Args,
    ) -> LocalBoxFuture<'static, Result<Value, Error>> {
        Box::pin(async move {
            env.timeout(Duration::from_millis(100)).await?;
            Ok("hi there".into())
        })
    }

    fn slow(_: Rc<Self>, env: Environment, _: Args) -> LocalBoxFuture<'static, Result<Value, Error>> {
        Box::pin(async move {
            env.timeout(Duration::from_secs(1)).await?;
            Ok(Value::Null)
        })
    }

    fn fail(&self, _: &Args) -> Result<Value, Error> {
        Err(Error::handler("I failed"))
    }

    fn not_a_number(&self, _: &Args) -> Result<Value, Error> {
        Ok(Value::Float(f64::NAN))
    }

    fn stranger(&self, _: &Args) -> Result<Value, Error> {
        Ok(ObjectRef::from(Rc::new(Greeter)).into())
    }

    fn point(&self, _: &Args) -> Result<Value, Error> {
        Value::custom(&Point { x: 1, y: 2 })
    }
}

impl Node for Greeter {
    fn name(&self) -> String {
        String::new()
    }

    fn parent(&self) -> Option<ObjectRef> {
        None
    }

    fn methods(&self) -> Methods<Self> {
        Methods::new()
            .call("greet", Greeter::greet)
            .passthru("forward", Greeter::forward)
            .call("__call__", Greeter::functor)
            .process("process", Greeter::process)
            .process("delayed_greet", Greeter::delayed_greet)
            .process("slow", Greeter::slow)
            .call("fail", Greeter::fail)
            .call("not_a_number", Greeter::not_a_number)
            .call("stranger", Greeter::stranger)
            .call("point", Greeter::point)
    }
}

#[test]
fn broker() {
    let env = Environment::virtual_net();
    let (_server, client) = connect(&env, Router::new(Rc::new(Greeter)));
    let result = env.block_on(async move {
        let remote = client.remote();
        Ok(vec![
            remote.invoke("greet", vec!["Graham".into()])?.await?,
            remote.invoke("forward", vec!["John".into()])?.await?,
            remote.call(vec!["Terry".into()])?.await?,
            remote.invoke("process", vec!["Eric".into()])?.await?,
        ])
    });
    assert_eq!(
        result,
        Ok(vec![
            Value::from("Hi Graham, I am a call"),
            Value::from("Hi John, I am a passthru call"),
            Value::from("Hi Terry, I am a functor call"),
            Value::from("Hi Eric, I am a process call"),
        ])
    );
}

#[test]
fn delayed_process() {
    let env = Environment::virtual_net();
    let (_server, client) = connect(&env, Router::new(Rc::new(Greeter)));
    let start = env.now();
    let result = env.block_on(async move { client.remote().invoke("delayed_greet", vec![])?.await });
    assert_eq!(result, Ok(Value::from("hi there")));
    assert!(env.now() - start >= Duration::from_millis(100));
}

#[test]
fn unknown_methods() {
    let env = Environment::virtual_net();
    let (_server, client) = connect(&env, Router::new(Rc::new(Greeter)));
    let result = env.block_on(async move { Ok(client.remote().invoke("spam", vec![])?.await) });
    let traceback = remote_traceback(result.unwrap());
    assert!(traceback.ends_with("Failed to resolve path spam\n"), "{}", traceback);
}

#[test]
fn nothing_exposed() {
    let env = Environment::virtual_net();
    let (_server, client) = connect(&env, Router::empty());
    let result = env.block_on(async move { Ok(client.remote().invoke("greet", vec![])?.await) });
    assert!(remote_traceback(result.unwrap()).ends_with("Failed to resolve path greet\n"));
}

#[test]
fn remote_exception() {
    let env = Environment::virtual_net();
    let (_server, client) = connect(&env, Router::new(Rc::new(Greeter)));
    let result = env.block_on(async move { Ok(client.remote().invoke("fail", vec![])?.await) });
    assert_eq!(
        remote_traceback(result.unwrap()),
        "HandlerError: I failed\n"
    );
}

#[test]
fn missing_arguments_fail_remotely() {
    let env = Environment::virtual_net();
    let (_server, client) = connect(&env, Router::new(Rc::new(Greeter)));
    let result = env.block_on(async move { Ok(client.remote().invoke("greet", vec![])?.await) });
    assert!(remote_traceback(result.unwrap()).ends_with("Missing argument 0\n"));
}

#[test]
fn result_encoding_failure() {
    let env = Environment::virtual_net();
    let (_server, client) = connect(&env, Router::new(Rc::new(Greeter)));
    let result =
        env.block_on(async move { Ok(client.remote().invoke("not_a_number", vec![])?.await) });
    assert!(remote_traceback(result.unwrap()).contains("Failed to encode"));
}

#[test]
fn invalid_hierarchy() {
    let env = Environment::virtual_net();
    let (_server, client) = connect(&env, Router::new(Rc::new(Greeter)));
    let result = env.block_on(async move { Ok(client.remote().invoke("stranger", vec![])?.await) });
    assert!(remote_traceback(result.unwrap()).contains("Failed to encode"));
}

#[test]
fn result_decoding_failure() {
    let env = Environment::virtual_net();
    let (a, b) = packets(&env);
    let config = env.config().rpc;
    let _server = Rpc::with_codec(
        a,
        Router::new(Rc::new(Greeter)),
        config,
        JsonCodec::new().with_type::<Point>(),
    )
    .unwrap();
    let client = Rpc::new(b, Router::empty(), config).unwrap();
    // The failed decode takes down the channel.
    client.defuse();
    let result = env.block_on(async move { Ok(client.remote().invoke("point", vec![])?.await) });
    match result {
        Ok(Err(Error::Codec(CodecError::Decode { .. }))) => {}
        other => panic!("Expected a decode failure, got {:?}", other),
    }
}

#[test]
fn custom_types() {
    let env = Environment::virtual_net();
    let (a, b) = packets(&env);
    let config = env.config().rpc;
    let codec = || JsonCodec::new().with_type::<Point>();
    let _server = Rpc::with_codec(a, Router::new(Rc::new(Greeter)), config, codec()).unwrap();
    let client = Rpc::with_codec(b, Router::empty(), config, codec()).unwrap();
    let result = env.block_on(async move { client.remote().invoke("point", vec![])?.await });
    assert_eq!(
        result.unwrap().to_custom::<Point>().unwrap(),
        Point { x: 1, y: 2 }
    );
}

struct Publisher {
    callback: RefCell<Option<Proxy>>,
}

impl Publisher {
    fn set_callback(&self, args: &Args) -> Result<Value, Error> {
        let callback = args
            .get(0)?
            .as_proxy()
            .cloned()
            .ok_or_else(|| Error::handler("Expected a proxy"))?;
        *self.callback.borrow_mut() = Some(callback);
        Ok(Value::Null)
    }
}

impl Node for Publisher {
    fn name(&self) -> String {
        String::new()
    }

    fn parent(&self) -> Option<ObjectRef> {
        None
    }

    fn methods(&self) -> Methods<Self> {
        Methods::new().call("set_callback", Publisher::set_callback)
    }
}

struct Subscriber {
    value: RefCell<Value>,
}

impl Subscriber {
    fn callback(&self, args: &Args) -> Result<Value, Error> {
        *self.value.borrow_mut() = args.get(0)?.clone();
        Ok(Value::Null)
    }
}

impl Node for Subscriber {
    fn name(&self) -> String {
        String::new()
    }

    fn parent(&self) -> Option<ObjectRef> {
        None
    }

    fn methods(&self) -> Methods<Self> {
        Methods::new().call("callback", Subscriber::callback)
    }
}

#[test]
fn callback() {
    let env = Environment::virtual_net();
    let (a, b) = packets(&env);
    let config = env.config().rpc;
    let publisher = Rc::new(Publisher {
        callback: RefCell::new(None),
    });
    let subscriber = Rc::new(Subscriber {
        value: RefCell::new(Value::Null),
    });
    let _peer_publisher = Rpc::new(a, Router::new(publisher.clone()), config).unwrap();
    let peer_subscriber = Rpc::new(b, Router::new(subscriber.clone()), config).unwrap();

    let exposed = ObjectRef::from(subscriber.clone());
    let inner = publisher.clone();
    let result = env.block_on(async move {
        peer_subscriber
            .remote()
            .invoke("set_callback", vec![exposed.into()])?
            .await?;
        let callback = inner
            .callback
            .borrow()
            .clone()
            .ok_or_else(|| Error::handler("No callback"))?;
        assert_eq!(callback.path(), "");
        callback.invoke("callback", vec!["test".into()])?.await
    });
    assert_eq!(result, Ok(Value::Null));
    assert_eq!(*subscriber.value.borrow(), Value::from("test"));
}

struct Tree {
    name: String,
    parent: RefCell<Weak<Tree>>,
    children: RefCell<Vec<Rc<Tree>>>,
}

impl Tree {
    fn new(name: &str, children: Vec<Rc<Tree>>) -> Rc<Self> {
        let tree = Rc::new(Self {
            name: name.into(),
            parent: RefCell::new(Weak::new()),
            children: RefCell::new(Vec::new()),
        });
        for child in children {
            *child.parent.borrow_mut() = Rc::downgrade(&tree);
            tree.children.borrow_mut().push(child);
        }
        tree
    }

    fn get_name(&self, _: &Args) -> Result<Value, Error> {
        Ok(self.name.clone().into())
    }
}

impl Node for Tree {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn parent(&self) -> Option<ObjectRef> {
        self.parent.borrow().upgrade().map(ObjectRef::from)
    }

    fn child(&self, name: &str) -> Option<ObjectRef> {
        self.children
            .borrow()
            .iter()
            .find(|child| child.name == name)
            .cloned()
            .map(ObjectRef::from)
    }

    fn methods(&self) -> Methods<Self> {
        Methods::new().call("get_name", Tree::get_name)
    }
}

#[test]
fn hierarchy() {
    let env = Environment::virtual_net();
    let root = Tree::new(
        "a0",
        vec![
            Tree::new("a1", vec![]),
            Tree::new("b1", vec![Tree::new("a2", vec![])]),
        ],
    );
    let (_server, client) = connect(&env, Router::new(root));
    let result = env.block_on(async move {
        let remote = client.remote();
        let b1 = remote.child("b1")?;
        assert_eq!(b1, client.proxy("b1")?);
        Ok(vec![
            remote.invoke("get_name", vec![])?.await?,
            remote.child("a1")?.invoke("get_name", vec![])?.await?,
            b1.invoke("get_name", vec![])?.await?,
            b1.child("a2")?.invoke("get_name", vec![])?.await?,
        ])
    });
    assert_eq!(
        result,
        Ok(vec!["a0".into(), "a1".into(), "b1".into(), "a2".into()])
    );
}

#[test]
fn outgoing_limit() {
    let env = Environment::virtual_net();
    let (a, b) = packets(&env);
    let _server = Rpc::new(a, Router::new(Rc::new(Greeter)), RpcConfig::default()).unwrap();
    let client = Rpc::new(b, Router::empty(), RpcConfig { message_limit: 2 }).unwrap();
    let first = client.remote().invoke("slow", vec![]).unwrap();
    let second = client.remote().invoke("slow", vec![]).unwrap();
    assert_eq!(
        client.remote().invoke("slow", vec![]).err(),
        Some(OverflowError::OutgoingLimit(2).into())
    );
    assert_eq!(env.run_until(&first), Ok(Value::Null));
    assert_eq!(env.run_until(&second), Ok(Value::Null));
    assert!(client.remote().invoke("slow", vec![]).is_ok());
}

#[test]
fn incoming_limit_closes_the_channel() {
    let env = Environment::virtual_net();
    let (a, b) = packets(&env);
    let server = Rpc::new(a, Router::new(Rc::new(Greeter)), RpcConfig { message_limit: 1 }).unwrap();
    server.defuse();
    let client = Rpc::new(b, Router::empty(), RpcConfig::default()).unwrap();
    let first = client.remote().invoke("slow", vec![]).unwrap();
    let second = client.remote().invoke("slow", vec![]).unwrap();
    assert!(env.run_until(&second).is_err());
    assert!(env.run_until(&first).is_err());
    assert_eq!(
        server.channel().error(),
        Some(OverflowError::IncomingLimit(1).into())
    );
}

#[test]
fn proxies_are_shared() {
    let env = Environment::virtual_net();
    let (_server, client) = connect(&env, Router::new(Rc::new(Greeter)));
    let spam = client.proxy("spam").unwrap();
    assert_eq!(spam, client.remote().child("spam").unwrap());
    assert_ne!(spam, client.proxy("eggs").unwrap());
    assert_eq!(client.proxy("").unwrap(), *client.remote());
}

struct Site;

impl Site {
    fn index(&self, _: &Args) -> Result<Value, Error> {
        Ok("<h1>hello</h1>".into())
    }

    fn numbers(&self, _: &Args) -> Result<Value, Error> {
        Ok(vec![1, 2, 3].into())
    }

    fn broken(&self, _: &Args) -> Result<Value, Error> {
        Err(Error::handler("broken"))
    }
}

impl Node for Site {
    fn name(&self) -> String {
        String::new()
    }

    fn parent(&self) -> Option<ObjectRef> {
        None
    }

    fn methods(&self) -> Methods<Self> {
        Methods::new()
            .call("index", Site::index)
            .headers([("Content-Type", "text/html")].into_iter().collect::<Headers>())
            .call("numbers", Site::numbers)
            .call("broken", Site::broken)
    }
}

#[test]
fn http_gateway() {
    let env = Environment::virtual_net();
    let server = env.serve(address(), 1).unwrap();
    let client = Client::new(env.connect(address()).unwrap());
    let socket = env.run_until(&server.accept().unwrap()).unwrap();
    let _gateway = HttpRpc::new(Service::new(socket), Router::new(Rc::new(Site)));

    let result = env.block_on(async move {
        let mut responses = Vec::new();
        for path in ["/index", "/numbers", "/missing", "/broken"] {
            let request = client.get(path)?.await?;
            let response = request.response()?.await?;
            let body = response.read_all()?.await?;
            responses.push((
                response.code(),
                response.headers().get("Content-Type").map(String::from),
                String::from_utf8_lossy(&body).into_owned(),
            ));
        }
        Ok(responses)
    });
    assert_eq!(
        result,
        Ok(vec![
            (200, Some("text/html".into()), "<h1>hello</h1>".into()),
            (200, None, "[1,2,3]".into()),
            (404, None, String::new()),
            (404, None, String::new()),
        ])
    );
}
