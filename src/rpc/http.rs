use super::{channel::Request, codec::JsonCodec, hierarchy::Router, value::Args, Value};
use crate::{
    core::{Environment, Process},
    error::Error,
    http::{Headers, InRequest, Service},
};

/// Answers `GET` requests of an HTTP [`Service`] with the methods of a
/// [`Router`].
///
/// The path of the request names the method, which is called without
/// arguments. Strings are sent as they are, other results as JSON. Anything
/// that fails is answered with `404`.
pub struct HttpRpc {
    service: Service,
    router: Router,
    handler: Process<()>,
}

impl HttpRpc {
    pub fn new(service: Service, router: Router) -> Self {
        let env = service.socket().env().clone();
        let handler = env.process(serve(service.clone(), router.clone()));
        Self {
            service,
            router,
            handler,
        }
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// The process answering requests. It stops when the connection closes.
    pub fn handler(&self) -> &Process<()> {
        &self.handler
    }

    pub fn close(&self) {
        self.service.close();
    }
}

async fn serve(service: Service, router: Router) -> Result<(), Error> {
    loop {
        match answer(&service, &router).await {
            Ok(()) => {}
            Err(e) if e.is_uncritical() => {
                tracing::debug!("HTTP gateway stopped: {}", e);
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
}

/// Receives one request and queues its response.
async fn answer(service: &Service, router: &Router) -> Result<(), Error> {
    let incoming = service.recv()?.await?;
    incoming.read_all()?.await?;
    let path = incoming.path();
    let path = path.strip_prefix('/').unwrap_or(&path);
    let env = service.socket().env().clone();
    let response = match call(&env, &incoming, router, path).await {
        Ok((headers, body)) => incoming.respond(200, "OK", headers, Some(body.as_slice()))?,
        Err(e) => {
            tracing::debug!(path, "HTTP call failed: {}", e);
            incoming.respond(404, "Not Found", Headers::new(), Some(&[][..]))?
        }
    };
    response.defuse();
    Ok(())
}

async fn call(
    env: &Environment,
    incoming: &InRequest,
    router: &Router,
    path: &str,
) -> Result<(Headers, Vec<u8>), Error> {
    let method = router.dispatch(path)?;
    let headers = method.headers().clone();
    let request = Request::new(env, incoming.id(), Value::Null);
    method.invoke(env, request.clone(), Args::default());
    let body = match request.event().clone().await? {
        Value::Str(text) => text.into_bytes(),
        value => JsonCodec::new().encode(&value)?,
    };
    Ok((headers, body))
}

