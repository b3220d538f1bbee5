//! The TLS seam, driven by a toy session that scrambles bytes after a
//! fixed greeting exchange.
use ntest::timeout;
use simio::{
    socket::{TcpSocket, TlsProvider, TlsSession, TlsStatus, Transport},
    Environment, Error, Socket,
};
use std::{io, rc::Rc};

const HELLO: &[u8] = b"HELLO";
const OLLEH: &[u8] = b"OLLEH";
const KEY: u8 = 0x5a;

/// Greeting bytes still to send or receive.
#[derive(Clone, Copy)]
enum Step {
    Send(&'static [u8]),
    Receive(&'static [u8]),
}

struct Scrambler {
    steps: Vec<Step>,
    received: Vec<u8>,
}

impl Scrambler {
    fn new(server: bool) -> Self {
        let steps = if server {
            vec![Step::Receive(HELLO), Step::Send(OLLEH)]
        } else {
            vec![Step::Send(HELLO), Step::Receive(OLLEH)]
        };
        Self {
            steps,
            received: Vec::new(),
        }
    }
}

fn io_status<T>(error: io::Error, blocked: TlsStatus<T>) -> Result<TlsStatus<T>, Error> {
    if error.kind() == io::ErrorKind::WouldBlock {
        Ok(blocked)
    } else {
        Err(Error::from(error))
    }
}

impl TlsSession for Scrambler {
    fn handshake(&mut self, transport: &mut dyn Transport) -> Result<TlsStatus<()>, Error> {
        while let Some(&step) = self.steps.first() {
            match step {
                Step::Send(data) => match transport.write(data) {
                    Ok(count) if count == data.len() => {
                        self.steps.remove(0);
                    }
                    Ok(count) => self.steps[0] = Step::Send(&data[count..]),
                    Err(e) => return io_status(e, TlsStatus::WantWrite),
                },
                Step::Receive(expected) => {
                    let mut buf = vec![0; expected.len() - self.received.len()];
                    match transport.read(&mut buf) {
                        Ok(0) => return Err(Error::handler("Peer left during the handshake")),
                        Ok(count) => self.received.extend_from_slice(&buf[..count]),
                        Err(e) => return io_status(e, TlsStatus::WantRead),
                    }
                    if self.received.len() == expected.len() {
                        if self.received != expected {
                            return Err(Error::handler("Unexpected greeting"));
                        }
                        self.received.clear();
                        self.steps.remove(0);
                    }
                }
            }
        }
        Ok(TlsStatus::Ready(()))
    }

    fn read(
        &mut self,
        transport: &mut dyn Transport,
        buf: &mut [u8],
    ) -> Result<TlsStatus<usize>, Error> {
        match transport.read(buf) {
            Ok(count) => {
                buf[..count].iter_mut().for_each(|byte| *byte ^= KEY);
                Ok(TlsStatus::Ready(count))
            }
            Err(e) => io_status(e, TlsStatus::WantRead),
        }
    }

    fn write(
        &mut self,
        transport: &mut dyn Transport,
        data: &[u8],
    ) -> Result<TlsStatus<usize>, Error> {
        let scrambled: Vec<u8> = data.iter().map(|byte| byte ^ KEY).collect();
        match transport.write(&scrambled) {
            Ok(count) => Ok(TlsStatus::Ready(count)),
            Err(e) => io_status(e, TlsStatus::WantWrite),
        }
    }
}

struct ScramblerProvider;

impl TlsProvider for ScramblerProvider {
    fn client(&self) -> Result<Box<dyn TlsSession>, Error> {
        Ok(Box::new(Scrambler::new(false)))
    }

    fn server(&self) -> Result<Box<dyn TlsSession>, Error> {
        Ok(Box::new(Scrambler::new(true)))
    }
}

#[test]
#[timeout(10000)]
fn secure_echo() {
    let env = Environment::poll().unwrap();
    let provider: Rc<dyn TlsProvider> = Rc::new(ScramblerProvider);
    let server = TcpSocket::secure(&env, provider.clone()).unwrap();
    server.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    server.listen(5).unwrap();
    let address = server.address().unwrap();
    let client = TcpSocket::secure(&env, provider).unwrap();
    client.connect(address).unwrap();

    let result = env.block_on(async move {
        let peer = server.accept()?.await?;
        // Writes issued before the handshake are parked until it is done.
        let written = client.write(b"secret")?;
        client.handshake().await?;
        written.await?;
        let data = peer.read(16)?.await?;
        peer.write(&data)?.await?;
        client.read(16)?.await
    });
    assert_eq!(result, Ok(b"secret".to_vec()));
    env.close();
}

#[test]
#[timeout(10000)]
fn plain_sockets_need_no_handshake() {
    let env = Environment::poll().unwrap();
    let socket = TcpSocket::open(&env).unwrap();
    assert_eq!(env.run_until(&socket.handshake()), Ok(()));
    env.close();
}
