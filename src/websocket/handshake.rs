//! Key derivation for the opening handshakes.

use crate::error::{Error, ProtocolError};
use base64::{engine::general_purpose::STANDARD, Engine};
use md5::Md5;
use rand::Rng;
use sha1::{Digest, Sha1};

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// A fresh `Sec-WebSocket-Key`.
pub fn client_key() -> String {
    STANDARD.encode(rand::random::<[u8; 16]>())
}

/// The number hidden in a draft-76 key: its digits divided by its spaces.
pub fn key_number(key: &str) -> Result<u32, Error> {
    let malformed = || ProtocolError::MalformedHeader(key.into());
    let digits: String = key.chars().filter(char::is_ascii_digit).collect();
    let spaces = key.chars().filter(|c| *c == ' ').count() as u64;
    let value: u64 = digits.parse().map_err(|_| malformed())?;
    if spaces == 0 || value % spaces != 0 {
        return Err(malformed().into());
    }
    u32::try_from(value / spaces).map_err(|_| malformed().into())
}

pub fn hixie_digest(first: u32, second: u32, nonce: &[u8; 8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(first.to_be_bytes());
    hasher.update(second.to_be_bytes());
    hasher.update(nonce);
    hasher.finalize().into()
}

fn noise(rng: &mut impl Rng) -> char {
    // Printable characters that are neither digits nor spaces.
    let ranges = [(0x21u8, 0x2eu8), (0x3a, 0x7d)];
    let total: u32 = ranges.iter().map(|(low, high)| (high - low + 1) as u32).sum();
    let mut pick = rng.gen_range(0..total);
    for (low, high) in ranges {
        let width = (high - low + 1) as u32;
        if pick < width {
            return (low + pick as u8) as char;
        }
        pick -= width;
    }
    '!'
}

/// Generates a draft-76 key and the number it encodes.
pub fn hixie_key(rng: &mut impl Rng) -> (String, u32) {
    let spaces: u32 = rng.gen_range(1..=12);
    let number: u32 = rng.gen_range(0..=u32::MAX / spaces);
    let mut key: Vec<char> = (number as u64 * spaces as u64).to_string().chars().collect();
    for _ in 0..rng.gen_range(1..=12) {
        let position = rng.gen_range(0..key.len());
        key.insert(position, noise(rng));
    }
    // Spaces never go first or last, header values are trimmed.
    for _ in 0..spaces {
        let position = rng.gen_range(1..=key.len().saturating_sub(2).max(1));
        key.insert(position, ' ');
    }
    (key.into_iter().collect(), number)
}
