use super::{handshake, read_headers, Endpoint, Message};
use crate::{
    core::{Event, Process},
    error::{Error, ProtocolError},
    http::headers::{encode_latin1, Headers},
    socket::SharedSocket,
};
use std::rc::Rc;

/// A WebSocket speaking draft-hixie-thewebsocketprotocol-76.
///
/// Messages are read as raw bytes. `origin` and `location` are announced
/// by the server side of the handshake.
#[derive(Clone)]
pub struct WebSocketHixie {
    endpoint: Rc<Endpoint<Vec<u8>>>,
    origin: String,
    location: String,
}

fn key_header(headers: &Headers, name: &'static str) -> Result<u32, Error> {
    let key = headers.get(name).ok_or(ProtocolError::MissingHeader(name))?;
    handshake::key_number(key.trim())
}

impl WebSocketHixie {
    pub fn new(socket: SharedSocket, origin: &str, location: &str) -> Self {
        Self {
            endpoint: Endpoint::new(socket),
            origin: origin.into(),
            location: location.into(),
        }
    }

    pub fn socket(&self) -> &SharedSocket {
        self.endpoint.socket()
    }

    /// Answers an upgrade request. The eight byte nonce following the
    /// request header is read from the socket.
    pub fn handshake_server(&self, headers: Option<Headers>) -> Process<()> {
        let endpoint = self.endpoint.clone();
        let (origin, location) = (self.origin.clone(), self.location.clone());
        self.endpoint.handshake(async move {
            let mut data = Vec::new();
            let headers = match headers {
                Some(headers) => headers,
                None => read_headers(&endpoint, &mut data, true).await?.1,
            };
            let first = key_header(&headers, "Sec-WebSocket-Key1")?;
            let second = key_header(&headers, "Sec-WebSocket-Key2")?;
            endpoint.fill(&mut data, 8).await?;
            let mut nonce = [0; 8];
            nonce.copy_from_slice(&data[..8]);
            data.drain(..8);

            let head = format!(
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Origin: {}\r\n\
                 Sec-WebSocket-Location: {}\r\n\r\n",
                origin, location
            );
            let mut response = encode_latin1(&head);
            response.extend_from_slice(&handshake::hixie_digest(first, second, &nonce));
            endpoint.write_all(&response).await?;
            start(&endpoint, data);
            Ok(())
        })
    }

    /// Sends an upgrade request for `uri` and verifies the digest the server
    /// answers with.
    pub fn handshake_client(&self, uri: &str) -> Process<()> {
        let endpoint = self.endpoint.clone();
        let uri = uri.to_string();
        self.endpoint.handshake(async move {
            let (first_key, first, second_key, second, nonce) = {
                let mut rng = rand::thread_rng();
                let (first_key, first) = handshake::hixie_key(&mut rng);
                let (second_key, second) = handshake::hixie_key(&mut rng);
                (first_key, first, second_key, second, rand::random::<[u8; 8]>())
            };
            let host = endpoint.socket().peer_address()?;
            let headers: Headers = [
                ("Host", host.to_string()),
                ("Upgrade", "WebSocket".into()),
                ("Connection", "Upgrade".into()),
                ("Sec-WebSocket-Key1", first_key),
                ("Sec-WebSocket-Key2", second_key),
            ]
            .into_iter()
            .collect();
            let mut request = encode_latin1(&format!("GET {} HTTP/1.1\r\n{}\r\n", uri, headers));
            request.extend_from_slice(&nonce);
            endpoint.write_all(&request).await?;

            let mut data = Vec::new();
            read_headers(&endpoint, &mut data, false).await?;
            endpoint.fill(&mut data, 16).await?;
            let digest: Vec<u8> = data.drain(..16).collect();
            if digest != handshake::hixie_digest(first, second, &nonce) {
                return Err(ProtocolError::AcceptKeyMismatch.into());
            }
            start(&endpoint, data);
            Ok(())
        })
    }

    /// Receives the payload of the next frame.
    pub fn read(&self) -> Result<Event<Vec<u8>>, Error> {
        self.endpoint.read()
    }

    /// Text is sent as UTF-8.
    pub fn write(&self, message: impl Into<Message>) -> Result<Event<()>, Error> {
        self.endpoint.write(message.into())
    }

    pub fn close(&self) {
        self.endpoint.close();
    }
}

/// Frames are a zero byte, the payload and a 0xff byte.
fn decode(data: &mut Vec<u8>) -> Result<Option<Vec<u8>>, Error> {
    let Some(&kind) = data.first() else {
        return Ok(None);
    };
    if kind & 0x80 != 0 {
        return Err(ProtocolError::UnsupportedFrame(kind).into());
    }
    let Some(end) = data.iter().skip(1).position(|byte| *byte == 0xff) else {
        return Ok(None);
    };
    let frame: Vec<u8> = data.drain(..end + 2).collect();
    Ok(Some(frame[1..=end].to_vec()))
}

fn encode(message: &Message) -> Vec<u8> {
    let payload = message.as_bytes();
    let mut frame = Vec::with_capacity(payload.len() + 2);
    frame.push(0x00);
    frame.extend_from_slice(payload);
    frame.push(0xff);
    frame
}

fn start(endpoint: &Rc<Endpoint<Vec<u8>>>, data: Vec<u8>) {
    endpoint.start(data, decode, encode);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames() {
        let mut data = encode(&Message::from("hi"));
        data.extend(encode(&Message::Binary(Vec::new())));
        data.extend_from_slice(&[0x00, b'x']);
        assert_eq!(decode(&mut data), Ok(Some(b"hi".to_vec())));
        assert_eq!(decode(&mut data), Ok(Some(Vec::new())));
        assert_eq!(decode(&mut data), Ok(None));
        assert_eq!(data, [0x00, b'x']);
    }

    #[test]
    fn length_prefixed_frames_are_unsupported() {
        let mut data = vec![0x80, 0x02, b'h', b'i'];
        assert_eq!(
            decode(&mut data),
            Err(ProtocolError::UnsupportedFrame(0x80).into())
        );
    }
}
