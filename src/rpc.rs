//! Remote procedure calls over packet connections.
//!
//! Both ends of an [`Rpc`] connection expose a tree of local objects through
//! a [`Router`] and call the objects of the peer through [`Proxy`] handles.
//! Calls travel as JSON envelopes, and objects and proxies passed as
//! arguments arrive on the other side as proxies and objects again.
//!
//! ```no_run
//! # use simio::{rpc::{Args, Methods, Node, ObjectRef, Router, Rpc, Value}, Environment, Error, Packet};
//! # use std::rc::Rc;
//! struct Greeter;
//!
//! impl Node for Greeter {
//!     fn name(&self) -> String {
//!         String::new()
//!     }
//!
//!     fn parent(&self) -> Option<ObjectRef> {
//!         None
//!     }
//!
//!     fn methods(&self) -> Methods<Self> {
//!         Methods::new().call("greet", |_, args: &Args| Ok(format!("Hi {}", args.str(0)?).into()))
//!     }
//! }
//!
//! # fn main() -> Result<(), Error> {
//! let env = Environment::virtual_net();
//! let config = env.config().rpc;
//! let server = env.serve("127.0.0.1:8080".parse().unwrap(), 5)?;
//! let client = Rpc::new(
//!     Packet::new(env.connect("127.0.0.1:8080".parse().unwrap())?),
//!     Router::empty(),
//!     config,
//! )?;
//! let greeting = env.block_on(async move {
//!     let _server = Rpc::new(
//!         Packet::new(server.accept()?.await?),
//!         Router::new(Rc::new(Greeter)),
//!         config,
//!     )?;
//!     client.remote().invoke("greet", vec!["Graham".into()])?.await
//! })?;
//! assert_eq!(greeting, Value::from("Hi Graham"));
//! # Ok(())
//! # }
//! ```

mod broker;
mod channel;
mod codec;
mod hierarchy;
mod http;
mod value;

pub use broker::{Proxy, Rpc};
pub use channel::{Channel, Request};
pub use codec::JsonCodec;
pub use hierarchy::{Bound, Handler, Methods, Node, ObjectRef, Router};
pub use http::HttpRpc;
pub use value::{Args, Value};
