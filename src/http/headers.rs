//! Start lines, header fields and chunk size lines.

use crate::error::{Error, ProtocolError};
use nom::{
    bytes::complete::{take_till, take_till1},
    character::complete::{char, digit1, hex_digit1, space0},
    combinator::{all_consuming, map_res, opt, rest},
    sequence::{preceded, separated_pair, terminated, tuple},
    IResult,
};
use std::fmt;

/// Header fields in insertion order. Names compare case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Sets `name`, replacing an existing field of the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(&name))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let index = self
            .entries
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))?;
        Some(self.entries.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (key, value) in iter {
            headers.insert(key, value);
        }
        headers
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.entries {
            write!(f, "{}: {}\r\n", key, value)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StartLine {
    Request {
        method: String,
        uri: String,
        version: String,
    },
    Response {
        version: String,
        code: u16,
        phrase: String,
    },
}

fn request_line(input: &str) -> IResult<&str, (&str, &str, &str)> {
    tuple((
        terminated(take_till1(|c| c == ' '), char(' ')),
        terminated(take_till(|c| c == ' '), char(' ')),
        rest,
    ))(input)
}

fn status_line(input: &str) -> IResult<&str, (&str, u16, Option<&str>)> {
    tuple((
        terminated(take_till1(|c| c == ' '), char(' ')),
        map_res(digit1, str::parse),
        opt(preceded(char(' '), rest)),
    ))(input)
}

fn header_line(input: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(take_till1(|c| c == ':'), char(':'), rest)(input)
}

/// Decodes a header section, which is ISO-8859-1 on the wire.
fn decode_latin1(data: &[u8]) -> String {
    data.iter().map(|&byte| char::from(byte)).collect()
}

/// Encodes text for the wire. Characters outside ISO-8859-1 become `?`.
pub(crate) fn encode_latin1(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

/// Parses a header section without its terminating blank line.
pub(crate) fn parse_head(data: &[u8], request: bool) -> Result<(StartLine, Headers), Error> {
    let malformed = || ProtocolError::MalformedHeader(String::from_utf8_lossy(data).into_owned());
    let text = decode_latin1(data);
    let mut lines = text.split("\r\n");
    let first = lines.next().ok_or_else(malformed)?;

    let mut headers = Headers::new();
    for line in lines {
        let (_, (key, value)) = all_consuming(header_line)(line).map_err(|_| malformed())?;
        headers.insert(key.trim(), value.trim());
    }

    let start = if request {
        let (_, (method, uri, version)) = all_consuming(request_line)(first).map_err(|_| malformed())?;
        StartLine::Request {
            method: method.into(),
            uri: uri.into(),
            version: version.into(),
        }
    } else {
        let (_, (version, code, phrase)) = all_consuming(status_line)(first).map_err(|_| malformed())?;
        StartLine::Response {
            version: version.into(),
            code,
            phrase: phrase.unwrap_or_default().into(),
        }
    };
    Ok((start, headers))
}

fn chunk_size(input: &[u8]) -> IResult<&[u8], &[u8]> {
    preceded(
        space0,
        terminated(hex_digit1, tuple((space0, opt(preceded(char(';'), rest))))),
    )(input)
}

/// Parses a chunk size line, ignoring chunk extensions.
pub(crate) fn parse_chunk_size(line: &[u8]) -> Result<usize, Error> {
    let malformed = || ProtocolError::MalformedChunkHeader(String::from_utf8_lossy(line).into_owned());
    let (_, digits) = all_consuming(chunk_size)(line).map_err(|_| malformed())?;
    let digits = std::str::from_utf8(digits).map_err(|_| malformed())?;
    Ok(usize::from_str_radix(digits, 16).map_err(|_| malformed())?)
}

pub(crate) fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|position| position + from)
}
