//! Addressing of local objects.
//!
//! Objects form a tree. Every object knows its name, its parent and how to
//! find its children, and the path of an object is the list of names from
//! just below the root down to the object, joined with `/`.

use super::{channel::Request, value::Args, Value};
use crate::{
    core::Environment,
    error::{Error, UsageError},
    http::Headers,
};
use futures::future::LocalBoxFuture;
use std::{fmt, rc::Rc};

/// An object that can be addressed and called remotely.
pub trait Node: 'static {
    fn name(&self) -> String;

    /// `None` for the root.
    fn parent(&self) -> Option<ObjectRef>;

    fn child(&self, _name: &str) -> Option<ObjectRef> {
        None
    }

    /// The methods exposed by this type.
    fn methods(&self) -> Methods<Self>
    where
        Self: Sized,
    {
        Methods::new()
    }
}

/// How an exposed method answers a request.
pub enum Handler<T> {
    /// Returns the reply right away.
    Call(fn(&T, &Args) -> Result<Value, Error>),
    /// Runs as a process whose outcome is the reply.
    Process(fn(Rc<T>, Environment, Args) -> LocalBoxFuture<'static, Result<Value, Error>>),
    /// Receives the request and has to answer it by itself.
    Passthru(fn(&T, &Args, Request)),
}

impl<T> Clone for Handler<T> {
    fn clone(&self) -> Self {
        match self {
            Handler::Call(f) => Handler::Call(*f),
            Handler::Process(f) => Handler::Process(*f),
            Handler::Passthru(f) => Handler::Passthru(*f),
        }
    }
}

struct Entry<T> {
    name: &'static str,
    handler: Handler<T>,
    headers: Headers,
}

/// The table of methods a [`Node`] type exposes.
///
/// ```
/// # use simio::rpc::{Args, Methods, Node, ObjectRef, Value};
/// # use simio::Error;
/// struct Greeter;
///
/// impl Greeter {
///     fn greet(&self, args: &Args) -> Result<Value, Error> {
///         Ok(format!("Hi {}", args.str(0)?).into())
///     }
/// }
///
/// impl Node for Greeter {
///     fn name(&self) -> String {
///         String::new()
///     }
///
///     fn parent(&self) -> Option<ObjectRef> {
///         None
///     }
///
///     fn methods(&self) -> Methods<Self> {
///         Methods::new().call("greet", Greeter::greet)
///     }
/// }
/// ```
pub struct Methods<T> {
    entries: Vec<Entry<T>>,
}

impl<T> Default for Methods<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Methods<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn expose(mut self, name: &'static str, handler: Handler<T>) -> Self {
        self.entries.push(Entry {
            name,
            handler,
            headers: Headers::new(),
        });
        self
    }

    pub fn call(self, name: &'static str, f: fn(&T, &Args) -> Result<Value, Error>) -> Self {
        self.expose(name, Handler::Call(f))
    }

    pub fn process(
        self,
        name: &'static str,
        f: fn(Rc<T>, Environment, Args) -> LocalBoxFuture<'static, Result<Value, Error>>,
    ) -> Self {
        self.expose(name, Handler::Process(f))
    }

    pub fn passthru(self, name: &'static str, f: fn(&T, &Args, Request)) -> Self {
        self.expose(name, Handler::Passthru(f))
    }

    /// Response headers for the method added last. Only the HTTP gateway
    /// sends them.
    pub fn headers(mut self, headers: Headers) -> Self {
        if let Some(entry) = self.entries.last_mut() {
            entry.headers = headers;
        }
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|entry| entry.name)
    }

    fn take(self, name: &str) -> Option<Entry<T>> {
        self.entries.into_iter().find(|entry| entry.name == name)
    }
}

/// A method bound to its object, ready to answer one request.
pub struct Bound {
    invoke: Box<dyn FnOnce(&Environment, Request, Args)>,
    headers: Headers,
}

impl Bound {
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Hands `request` to the method. The reply arrives through the request.
    pub fn invoke(self, env: &Environment, request: Request, args: Args) {
        (self.invoke)(env, request, args)
    }
}

pub(crate) trait Object {
    fn object_name(&self) -> String;
    fn object_parent(&self) -> Option<ObjectRef>;
    fn object_child(&self, name: &str) -> Option<ObjectRef>;
    fn bind(self: Rc<Self>, method: &str) -> Option<Bound>;
}

impl<T: Node> Object for T {
    fn object_name(&self) -> String {
        self.name()
    }

    fn object_parent(&self) -> Option<ObjectRef> {
        self.parent()
    }

    fn object_child(&self, name: &str) -> Option<ObjectRef> {
        self.child(name)
    }

    fn bind(self: Rc<Self>, method: &str) -> Option<Bound> {
        let entry = self.methods().take(method)?;
        let node = self;
        let invoke: Box<dyn FnOnce(&Environment, Request, Args)> = match entry.handler {
            Handler::Call(f) => Box::new(move |_, request, args| {
                let outcome = f(&node, &args);
                request.reply(outcome);
            }),
            Handler::Process(f) => Box::new(move |env, request, args| {
                let process = env.process(f(node, env.clone(), args));
                // The outcome is the reply, failures included.
                process.defuse();
                process.event().add_callback(move |event| {
                    if let Some(outcome) = event.outcome() {
                        request.reply(outcome);
                    }
                });
            }),
            Handler::Passthru(f) => Box::new(move |_, request, args| f(&node, &args, request)),
        };
        Some(Bound {
            invoke,
            headers: entry.headers,
        })
    }
}

/// A shared handle on a local object.
#[derive(Clone)]
pub struct ObjectRef(Rc<dyn Object>);

impl ObjectRef {
    pub fn new<T: Node>(node: Rc<T>) -> Self {
        ObjectRef(node)
    }

    pub fn name(&self) -> String {
        self.0.object_name()
    }

    pub fn parent(&self) -> Option<ObjectRef> {
        self.0.object_parent()
    }

    pub fn child(&self, name: &str) -> Option<ObjectRef> {
        self.0.object_child(name)
    }

    pub fn bind(&self, method: &str) -> Option<Bound> {
        self.0.clone().bind(method)
    }

    /// Walks up to the root.
    pub fn root(&self) -> ObjectRef {
        let mut object = self.clone();
        while let Some(parent) = object.parent() {
            object = parent;
        }
        object
    }

    /// The names from below the root down to this object.
    pub fn path(&self) -> Vec<String> {
        let mut path = Vec::new();
        let mut object = self.clone();
        while let Some(parent) = object.parent() {
            path.push(object.name());
            object = parent;
        }
        path.reverse();
        path
    }
}

impl<T: Node> From<Rc<T>> for ObjectRef {
    fn from(node: Rc<T>) -> Self {
        ObjectRef::new(node)
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(
            Rc::as_ptr(&self.0) as *const (),
            Rc::as_ptr(&other.0) as *const (),
        )
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:?})", self.path().join("/"))
    }
}

/// Maps paths to the objects of one tree.
#[derive(Clone, Debug, Default)]
pub struct Router {
    root: Option<ObjectRef>,
}

impl Router {
    pub fn new(root: impl Into<ObjectRef>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    /// A router that exposes nothing.
    pub fn empty() -> Self {
        Self { root: None }
    }

    pub fn root(&self) -> Option<&ObjectRef> {
        self.root.as_ref()
    }

    /// The path of `object`, which has to belong to this router's tree.
    pub fn resolve(&self, object: &ObjectRef) -> Result<String, Error> {
        let root = object.root();
        if self.root.as_ref() != Some(&root) {
            return Err(UsageError::HierarchyMismatch(format!("{:?}", object)).into());
        }
        Ok(object.path().join("/"))
    }

    /// The object at `path`. The empty path is the root.
    pub fn lookup(&self, path: &str) -> Result<ObjectRef, Error> {
        let unknown = || Error::from(UsageError::UnknownPath(path.into()));
        let mut object = self.root.clone().ok_or_else(unknown)?;
        if path.is_empty() {
            return Ok(object);
        }
        for name in path.split('/') {
            object = object.child(name).ok_or_else(unknown)?;
        }
        Ok(object)
    }

    /// The method at `path`. Its last segment names the method, an empty
    /// one selects `__call__`.
    pub fn dispatch(&self, path: &str) -> Result<Bound, Error> {
        let (object, method) = match path.rsplit_once('/') {
            Some((object, method)) => (object, method),
            None => ("", path),
        };
        let method = if method.is_empty() { "__call__" } else { method };
        self.lookup(object)
            .ok()
            .and_then(|object| object.bind(method))
            .ok_or_else(|| UsageError::UnresolvedPath(path.into()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;
    use std::cell::RefCell;

    struct Dir {
        name: String,
        parent: RefCell<Option<std::rc::Weak<Dir>>>,
        children: RefCell<FxHashMap<String, Rc<Dir>>>,
    }

    impl Dir {
        fn new(name: &str) -> Rc<Self> {
            Rc::new(Self {
                name: name.into(),
                parent: RefCell::new(None),
                children: RefCell::new(FxHashMap::default()),
            })
        }

        fn add(self: &Rc<Self>, child: Rc<Dir>) -> Rc<Dir> {
            *child.parent.borrow_mut() = Some(Rc::downgrade(self));
            self.children
                .borrow_mut()
                .insert(child.name.clone(), child.clone());
            child
        }

        fn get_name(&self, _: &Args) -> Result<Value, Error> {
            Ok(self.name.clone().into())
        }
    }

    impl Node for Dir {
        fn name(&self) -> String {
            self.name.clone()
        }

        fn parent(&self) -> Option<ObjectRef> {
            let parent = self.parent.borrow().as_ref()?.upgrade()?;
            Some(parent.into())
        }

        fn child(&self, name: &str) -> Option<ObjectRef> {
            let child = self.children.borrow().get(name).cloned()?;
            Some(child.into())
        }

        fn methods(&self) -> Methods<Self> {
            Methods::new().call("get_name", Dir::get_name)
        }
    }

    #[test]
    fn paths() {
        let root = Dir::new("a0");
        let b1 = root.add(Dir::new("b1"));
        let a2 = b1.add(Dir::new("a2"));
        let router = Router::new(root.clone());

        assert_eq!(router.resolve(&a2.clone().into()), Ok("b1/a2".into()));
        assert_eq!(router.resolve(&root.clone().into()), Ok(String::new()));
        assert_eq!(router.lookup("b1/a2"), Ok(ObjectRef::from(a2)));
        assert_eq!(router.lookup(""), Ok(ObjectRef::from(root)));
        assert_eq!(
            router.lookup("b1/zz"),
            Err(UsageError::UnknownPath("b1/zz".into()).into())
        );
    }

    #[test]
    fn foreign_objects() {
        let router = Router::new(Dir::new("a0"));
        let other = Dir::new("other");
        assert!(matches!(
            router.resolve(&other.into()),
            Err(Error::Usage(UsageError::HierarchyMismatch(_)))
        ));
    }

    #[test]
    fn dispatch() {
        let root = Dir::new("a0");
        root.add(Dir::new("b1"));
        let router = Router::new(root);
        assert!(router.dispatch("get_name").is_ok());
        assert!(router.dispatch("b1/get_name").is_ok());
        assert_eq!(
            router.dispatch("greet").err(),
            Some(UsageError::UnresolvedPath("greet".into()).into())
        );
        // No __call__ is exposed.
        assert!(router.dispatch("").is_err());
        assert!(Router::empty().dispatch("get_name").is_err());
    }
}
