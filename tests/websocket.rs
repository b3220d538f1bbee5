use simio::{
    config::{Config, WebSocketConfig},
    error::{ConnectionError, ProtocolError},
    websocket::{
        frame::{decode_frame, encode_frame, BINARY, TEXT},
        handshake::accept_key,
    },
    Environment, Error, Message, SharedSocket, WebSocket, WebSocketHixie,
};
use std::net::SocketAddr;

fn address() -> SocketAddr {
    "127.0.0.1:9000".parse().unwrap()
}

fn pair(env: &Environment) -> (SharedSocket, SharedSocket) {
    let server = env.serve(address(), 1).unwrap();
    let client = env.connect(address()).unwrap();
    let accepted = env.run_until(&server.accept().unwrap()).unwrap();
    (client, accepted)
}

#[test]
fn echo() {
    let env = Environment::virtual_net();
    let (client, server) = pair(&env);
    let client = WebSocket::new(client);
    let server = WebSocket::new(server);
    let spawner = env.clone();
    let result = env.block_on(async move {
        let env = spawner;
        let accepting = server.handshake_server(None);
        client.handshake_client("/chat").await?;
        accepting.await?;

        let mut echoed = Vec::new();
        for message in [
            Message::from("hello"),
            Message::from(vec![0u8, 1, 2]),
            Message::from(vec![42u8; 70_000]),
        ] {
            let sending = client.write(message)?;
            let sending = env.process(async move { sending.await });
            let received = server.read()?.await?;
            sending.await?;
            let replying = server.write(received)?;
            let replying = env.process(async move { replying.await });
            echoed.push(client.read()?.await?);
            replying.await?;
        }
        Ok(echoed)
    });
    assert_eq!(
        result,
        Ok(vec![
            Message::Text("hello".into()),
            Message::Binary(vec![0, 1, 2]),
            Message::Binary(vec![42; 70_000]),
        ])
    );
}

#[test]
fn messages_queued_before_the_handshake() {
    let env = Environment::virtual_net();
    let (client, server) = pair(&env);
    let client = WebSocket::new(client);
    let server = WebSocket::new(server);
    let read = server.read().unwrap();
    client.write("early").unwrap().defuse();
    server.handshake_server(None);
    client.handshake_client("/");
    assert_eq!(env.run_until(&read), Ok(Message::Text("early".into())));
}

#[test]
fn closing_resets_the_peer() {
    let env = Environment::virtual_net();
    let (client, server) = pair(&env);
    let client = WebSocket::new(client);
    let server = WebSocket::new(server);
    let result = env.block_on(async move {
        let accepting = server.handshake_server(None);
        client.handshake_client("/").await?;
        accepting.await?;
        let read = client.read()?;
        server.close();
        read.await
    });
    assert_eq!(result, Err(Error::Connection(ConnectionError::Reset)));
}

#[test]
fn unsupported_versions_are_rejected() {
    let env = Environment::virtual_net();
    let (client, server) = pair(&env);
    let server = WebSocket::new(server);
    let handshake = server.handshake_server(None);
    client
        .write(b"GET / HTTP/1.1\r\nSec-WebSocket-Version: 8\r\nSec-WebSocket-Key: x\r\n\r\n")
        .unwrap();
    assert_eq!(
        env.run_until(handshake.event()),
        Err(ProtocolError::UnsupportedVersion("8".into()).into())
    );
    // The failed handshake fails later operations too.
    assert_eq!(
        server.read().err(),
        Some(ProtocolError::UnsupportedVersion("8".into()).into())
    );
}

#[test]
fn clients_reject_masked_frames() {
    let env = Environment::virtual_net();
    let (client, server) = pair(&env);
    let client = WebSocket::new(client);
    let result = env.block_on(async move {
        let handshake = client.handshake_client("/");
        let mut request = Vec::new();
        while !request.ends_with(b"\r\n\r\n") {
            request.extend(server.read(4096)?.await?);
        }
        let request = String::from_utf8_lossy(&request).into_owned();
        let key = request
            .lines()
            .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
            .unwrap_or_default()
            .trim()
            .to_string();
        let mut response = format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\
             Connection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
            accept_key(&key)
        )
        .into_bytes();
        response.extend(encode_frame(TEXT, b"masked", Some([1, 2, 3, 4])));
        server.write(&response)?.await?;
        handshake.await?;
        client.read()?.await
    });
    assert_eq!(result, Err(ProtocolError::UnexpectedMask.into()));
}

#[test]
fn oversized_frames_are_rejected() {
    let config = Config {
        websocket: WebSocketConfig {
            max_frame_size: 100,
            ..WebSocketConfig::default()
        },
        ..Config::default()
    };
    let env = Environment::virtual_with_config(config);
    let (client, server) = pair(&env);
    let client = WebSocket::new(client);
    let server = WebSocket::new(server);
    let result = env.block_on(async move {
        let accepting = server.handshake_server(None);
        client.handshake_client("/").await?;
        accepting.await?;
        client.write(vec![0u8; 200])?.await?;
        server.read()?.await
    });
    assert_eq!(
        result,
        Err(ProtocolError::FrameTooLarge {
            allowed: 100,
            actual: 200
        }
        .into())
    );
}

#[test]
fn hixie_echo() {
    let env = Environment::virtual_net();
    let (client, server) = pair(&env);
    let client = WebSocketHixie::new(client, "http://example.com", "ws://example.com/");
    let server = WebSocketHixie::new(server, "http://example.com", "ws://example.com/");
    let result = env.block_on(async move {
        let accepting = server.handshake_server(None);
        client.handshake_client("/").await?;
        accepting.await?;

        client.write("hi")?.await?;
        client.write("")?.await?;
        let first = server.read()?.await?;
        let second = server.read()?.await?;
        server.write(first.clone())?.await?;
        Ok((first, second, client.read()?.await?))
    });
    assert_eq!(result, Ok((b"hi".to_vec(), Vec::new(), b"hi".to_vec())));
}

#[test]
fn frame_lengths() {
    for length in [0, 125, 126, 65535, 65536] {
        let payload = vec![b'x'; length];
        for (mask, expect_mask) in [(None, false), (Some([1, 2, 3, 4]), true)] {
            for opcode in [TEXT, BINARY] {
                let data = encode_frame(opcode, &payload, mask);
                let (frame, used) = decode_frame(&data, expect_mask).unwrap().unwrap();
                assert_eq!(used, data.len());
                assert_eq!(frame.opcode, opcode);
                assert_eq!(frame.payload, payload);
            }
        }
    }
}
