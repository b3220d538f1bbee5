use proptest::prelude::*;
use simio::{
    config::{Config, HttpConfig, VirtualConfig},
    error::{ConnectionError, ProtocolError, UsageError},
    http::{Client, Headers, Service},
    Environment, Error,
};
use std::net::SocketAddr;

fn address() -> SocketAddr {
    "127.0.0.1:8080".parse().unwrap()
}

/// A client and the socket its service will be accepted from.
fn connect(env: &Environment) -> (Client, simio::SharedSocket) {
    let server = env.serve(address(), 5).unwrap();
    let client = Client::new(env.connect(address()).unwrap());
    (client, server)
}

#[test]
fn chunked_request_and_reply() {
    let env = Environment::virtual_net();
    let (client, server) = connect(&env);
    let result = env.block_on(async move {
        let service = Service::new(server.accept()?.await?);
        let request = client.send("GET", "/", Headers::new(), None)?.await?;
        request.write(b"dude")?.await?;
        request.finish()?.await?;

        let incoming = service.recv()?.await?;
        assert_eq!(incoming.method(), "GET");
        assert_eq!(incoming.headers().get("transfer-encoding"), Some("chunked"));
        let mut reply = b"hello ".to_vec();
        reply.extend(incoming.read_all()?.await?);
        incoming.respond(200, "OK", Headers::new(), Some(reply.as_slice()))?.await?;

        let response = request.response()?.await?;
        assert_eq!(response.code(), 200);
        assert_eq!(response.phrase(), "OK");
        response.read_all()?.await
    });
    assert_eq!(result, Ok(b"hello dude".to_vec()));
}

#[test]
fn pipelined_responses_keep_request_order() {
    let env = Environment::virtual_net();
    let (client, server) = connect(&env);
    let result = env.block_on(async move {
        let service = Service::new(server.accept()?.await?);
        let mut requests = Vec::new();
        for path in ["/0", "/1", "/2"] {
            requests.push(client.get(path)?.await?);
        }

        let mut incoming = Vec::new();
        for _ in 0..3 {
            let request = service.recv()?.await?;
            request.read_all()?.await?;
            incoming.push(request);
        }
        // The last request is answered first internally but may not be sent
        // before the others.
        let last = &incoming[2];
        assert_eq!(
            last.respond(200, "OK", Headers::new(), Some(&b"/2"[..])).err(),
            Some(UsageError::OutOfOrderResponse.into())
        );
        for request in &incoming {
            let body = request.path();
            request
                .respond(200, "OK", Headers::new(), Some(body.as_bytes()))?
                .await?;
        }

        let mut bodies = Vec::new();
        for request in &requests {
            let response = request.response()?.await?;
            bodies.push(String::from_utf8_lossy(&response.read_all()?.await?).into_owned());
        }
        Ok(bodies)
    });
    assert_eq!(result, Ok(vec!["/0".into(), "/1".into(), "/2".into()]));
}

#[test]
fn chunked_bodies_read_chunk_by_chunk() {
    let env = Environment::virtual_net();
    let (client, server) = connect(&env);
    let result = env.block_on(async move {
        let service = Service::new(server.accept()?.await?);
        let request = client.put("/upload?name=spam", Some(&b"eggs"[..]))?.await?;

        let incoming = service.recv()?.await?;
        assert_eq!(incoming.method(), "PUT");
        assert_eq!(incoming.path(), "/upload");
        assert_eq!(incoming.query(), Some("name=spam".into()));
        assert_eq!(incoming.read_all()?.await?, b"eggs");
        assert_eq!(incoming.read()?.await?, b"");

        let response = incoming.respond(200, "OK", Headers::new(), None)?;
        response.write(b"a")?.await?;
        response.write(b"bc")?.await?;
        response.finish()?.await?;
        assert_eq!(
            response.write(b"late").err(),
            Some(UsageError::MessageAlreadySent.into())
        );

        let reply = request.response()?.await?;
        let mut chunks = Vec::new();
        loop {
            let chunk = reply.read()?.await?;
            if chunk.is_empty() {
                break;
            }
            chunks.push(chunk);
        }
        Ok(chunks)
    });
    assert_eq!(result, Ok(vec![b"a".to_vec(), b"bc".to_vec()]));
}

#[test]
fn oversized_headers_are_rejected() {
    let config = Config {
        http: HttpConfig {
            max_header_size: 256,
            ..HttpConfig::default()
        },
        ..Config::default()
    };
    let env = Environment::virtual_with_config(config);
    let (client, server) = connect(&env);
    let result = env.block_on(async move {
        let service = Service::new(server.accept()?.await?);
        let headers: Headers = [("X-Padding", "x".repeat(1000))].into_iter().collect();
        client.send("GET", "/", headers, Some(&b""[..]))?.defuse();
        service.recv()?.await.map(|_| ())
    });
    assert_eq!(result, Err(ProtocolError::HeaderTooLarge.into()));
}

#[test]
fn heads_arriving_in_one_read_are_still_limited() {
    let config = Config {
        http: HttpConfig {
            blocksize: 4096,
            max_header_size: 64,
        },
        ..Config::default()
    };
    let env = Environment::virtual_with_config(config);
    let server = env.serve(address(), 5).unwrap();
    let raw = env.connect(address()).unwrap();
    let result = env.block_on(async move {
        let service = Service::new(server.accept()?.await?);
        let head = format!("GET / HTTP/1.1\r\nX-Padding: {}\r\n\r\n", "x".repeat(100));
        raw.write(head.as_bytes())?.await?;
        service.recv()?.await.map(|_| ())
    });
    assert_eq!(result, Err(ProtocolError::HeaderTooLarge.into()));
}

#[test]
fn oversized_chunk_headers_are_rejected() {
    let config = Config {
        http: HttpConfig {
            blocksize: 4096,
            max_header_size: 64,
        },
        ..Config::default()
    };
    let env = Environment::virtual_with_config(config);
    let server = env.serve(address(), 5).unwrap();
    let raw = env.connect(address()).unwrap();
    let result = env.block_on(async move {
        let service = Service::new(server.accept()?.await?);
        let request = format!(
            "POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n1;{}\r\na\r\n0\r\n\r\n",
            "x".repeat(100)
        );
        raw.write(request.as_bytes())?.await?;
        let incoming = service.recv()?.await?;
        incoming.read_all()?.await
    });
    assert_eq!(result, Err(ProtocolError::ChunkHeaderTooLarge.into()));
}

#[test]
fn closed_connections_fail_pending_requests() {
    let env = Environment::virtual_net();
    let (client, server) = connect(&env);
    let result = env.block_on(async move {
        let service = Service::new(server.accept()?.await?);
        let incoming = service.recv()?;
        client.close();
        incoming.await.map(|_| ())
    });
    assert_eq!(result, Err(Error::Connection(ConnectionError::Reset)));
}

#[test]
fn one_receive_at_a_time() {
    let env = Environment::virtual_net();
    let (_client, server) = connect(&env);
    let socket = env.run_until(&server.accept().unwrap()).unwrap();
    let service = Service::new(socket);
    let pending = service.recv().unwrap();
    pending.defuse();
    assert_eq!(
        service.recv().err(),
        Some(UsageError::AlreadyReceiving.into())
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn chunked_bodies_survive_fragmentation(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..200), 0..8),
        segment in 1usize..64,
        blocksize in 1usize..64,
    ) {
        let config = Config {
            http: HttpConfig {
                blocksize,
                ..HttpConfig::default()
            },
            virtual_net: VirtualConfig {
                max_segment_size: Some(segment),
                ..VirtualConfig::default()
            },
            ..Config::default()
        };
        let env = Environment::virtual_with_config(config);
        let (client, server) = connect(&env);
        let expected: Vec<u8> = chunks.concat();
        let received = env.block_on(async move {
            let service = Service::new(server.accept()?.await?);
            let request = client.send("POST", "/", Headers::new(), None)?.await?;
            for chunk in &chunks {
                request.write(chunk)?.await?;
            }
            request.finish()?.await?;
            let incoming = service.recv()?.await?;
            incoming.read_all()?.await
        });
        prop_assert_eq!(received, Ok(expected));
    }
}
