//! The socket lifecycle on every backend.
use ntest::timeout;
use simio::{
    error::{ConnectionError, UsageError},
    Environment, Error, SharedSocket,
};
use std::net::SocketAddr;

fn listen(env: &Environment) -> (SharedSocket, SocketAddr) {
    let server = env.serve("127.0.0.1:0".parse().unwrap(), 5).unwrap();
    let address = server.address().unwrap();
    (server, address)
}

macro_rules! socket_suite {
    ($name:ident, $env:expr) => {
        mod $name {
            use super::*;

            fn env() -> Environment {
                $env
            }

            #[test]
            #[timeout(10000)]
            fn echo() {
                let env = env();
                let (server, address) = listen(&env);
                let client = env.connect(address).unwrap();
                let result = env.block_on(async move {
                    let peer = server.accept()?.await?;
                    assert_eq!(peer.peer_address()?, client.address()?);
                    let written = client.write(b"hello")?.await?;
                    assert_eq!(written, 5);
                    let data = peer.read(16)?.await?;
                    peer.write(&data)?.await?;
                    client.read(16)?.await
                });
                assert_eq!(result, Ok(b"hello".to_vec()));
                env.close();
            }

            #[test]
            #[timeout(10000)]
            fn peer_close_resets_reads() {
                let env = env();
                let (server, address) = listen(&env);
                let client = env.connect(address).unwrap();
                let result = env.block_on(async move {
                    let peer = server.accept()?.await?;
                    client.write(b"bye")?.await?;
                    client.close();
                    let data = peer.read(16)?.await?;
                    assert_eq!(data, b"bye");
                    peer.read(16)?.await
                });
                assert_eq!(result, Err(Error::Connection(ConnectionError::Reset)));
                env.close();
            }

            #[test]
            #[timeout(10000)]
            fn one_read_at_a_time() {
                let env = env();
                let (server, address) = listen(&env);
                let client = env.connect(address).unwrap();
                let read = client.read(16).unwrap();
                assert_eq!(
                    client.read(16).err(),
                    Some(UsageError::AlreadyReading.into())
                );
                client.close();
                assert_eq!(env.run_until(&read), Err(Error::BadDescriptor));
                server.close();
                env.close();
            }

            #[test]
            #[timeout(10000)]
            fn close_fails_pending_accept() {
                let env = env();
                let (server, _) = listen(&env);
                let accept = server.accept().unwrap();
                server.close();
                server.close();
                assert_eq!(env.run_until(&accept).err(), Some(Error::BadDescriptor));
                assert_eq!(server.address(), Err(Error::BadDescriptor));
                env.close();
            }

            #[test]
            #[timeout(10000)]
            fn large_transfer() {
                let env = env();
                let (server, address) = listen(&env);
                let client = env.connect(address).unwrap();
                let payload: Vec<u8> = (0..100_000u32).map(|i| i as u8).collect();
                let expected = payload.len();
                let received = env.block_on(async move {
                    let peer = server.accept()?.await?;
                    let mut sent = 0;
                    let mut received = Vec::new();
                    while received.len() < expected {
                        if sent < payload.len() {
                            sent += client.write(&payload[sent..])?.await?;
                        }
                        received.extend(peer.read(65536)?.await?);
                    }
                    Ok(received)
                });
                let received = received.unwrap();
                assert_eq!(received.len(), expected);
                assert!(received.iter().enumerate().all(|(i, b)| *b == i as u8));
                env.close();
            }
        }
    };
}

socket_suite!(virtual_net, Environment::virtual_net());
socket_suite!(select, Environment::select());
socket_suite!(poll, Environment::poll().unwrap());
socket_suite!(epoll, Environment::epoll().unwrap());
socket_suite!(dispatch, Environment::dispatch().unwrap());

#[test]
fn virtual_refused_without_listener() {
    let env = Environment::virtual_net();
    let (server, address) = listen(&env);
    server.close();
    let client = env.connect(address).unwrap();
    let read = client.read(1).unwrap();
    assert_eq!(
        env.run_until(&read),
        Err(Error::Connection(ConnectionError::Refused))
    );
}
