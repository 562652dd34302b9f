use alloc::string::{String, ToString};
use core::{
    fmt::{self, Display},
    num::NonZero,
    str::FromStr,
};

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::util::split_spaces;

/// A NATS status code
///
/// Status codes are carried in-band by the header block of a message
/// and signal control conditions such as heartbeats or the lack of
/// pending messages.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatusCode(NonZero<u16>);

/// A status marker decoded from the first line of a header block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    pub description: Option<String>,
}

/// An error encountered while decoding a [`StatusCode`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatusCodeError {
    /// The status code is not a 3 digit number
    #[error("status code is not a 3 digit number")]
    Invalid,
}

impl StatusCode {
    /// An idle heartbeat or a flow control request
    pub const IDLE_HEARTBEAT: Self = Self::new_internal(100);
    pub const OK: Self = Self::new_internal(200);
    pub const BAD_REQUEST: Self = Self::new_internal(400);
    /// The consumer has no pending messages
    pub const NO_MESSAGES: Self = Self::new_internal(404);
    /// The pull request expired before it could be fulfilled
    pub const REQUEST_TIMEOUT: Self = Self::new_internal(408);
    /// The pull request conflicts with the consumer state
    pub const CONFLICT: Self = Self::new_internal(409);
    pub const NO_RESPONDERS: Self = Self::new_internal(503);

    const fn new_internal(val: u16) -> Self {
        match NonZero::new(val) {
            Some(val) => Self(val),
            None => panic!("status code must be non zero"),
        }
    }

    /// Decode a status code from its 3 digit wire representation
    ///
    /// # Errors
    ///
    /// It returns an error if `buf` isn't exactly three ASCII digits
    /// or if it's `000`.
    pub fn from_ascii_bytes(buf: &[u8]) -> Result<Self, StatusCodeError> {
        let [a, b, c] = *buf else {
            return Err(StatusCodeError::Invalid);
        };
        if ![a, b, c].iter().all(u8::is_ascii_digit) {
            return Err(StatusCodeError::Invalid);
        }

        let val = u16::from(a - b'0') * 100 + u16::from(b - b'0') * 10 + u16::from(c - b'0');
        NonZero::new(val).map(Self).ok_or(StatusCodeError::Invalid)
    }

    #[must_use]
    pub fn to_u16(self) -> u16 {
        self.0.get()
    }
}

impl Status {
    #[must_use]
    pub fn new(code: StatusCode) -> Self {
        Self {
            code,
            description: None,
        }
    }

    /// Decode the status carried by the first line of a header block
    ///
    /// `NATS/1.0` alone carries no status and yields `Ok(None)`, while
    /// `NATS/1.0 404 No Messages` yields the code and its description.
    ///
    /// # Errors
    ///
    /// It returns an error if the status code is malformed.
    pub fn from_header_line(line: Bytes) -> Result<Option<Self>, StatusCodeError> {
        let mut chunks = split_spaces::<3>(line);
        let _version = chunks.next();
        let Some(code) = chunks.next() else {
            return Ok(None);
        };
        let code = StatusCode::from_ascii_bytes(&code)?;
        let description = chunks
            .next()
            .map(|description| String::from_utf8_lossy(&description).trim_end().to_string())
            .filter(|description| !description.is_empty());

        Ok(Some(Self { code, description }))
    }

    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

impl Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{} {}", self.code, description),
            None => Display::fmt(&self.code, f),
        }
    }
}

impl From<StatusCode> for Status {
    fn from(code: StatusCode) -> Self {
        Self::new(code)
    }
}

impl FromStr for StatusCode {
    type Err = StatusCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_ascii_bytes(s.as_bytes())
    }
}

impl TryFrom<u16> for StatusCode {
    type Error = StatusCodeError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        if (100..1000).contains(&value) {
            Ok(Self::new_internal(value))
        } else {
            Err(StatusCodeError::Invalid)
        }
    }
}

impl From<StatusCode> for u16 {
    fn from(value: StatusCode) -> Self {
        value.to_u16()
    }
}

impl Serialize for StatusCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_u16().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StatusCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let n = u16::deserialize(deserializer)?;
        n.try_into().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use claims::{assert_err, assert_none, assert_ok, assert_some};

    use super::{Status, StatusCode};

    #[test]
    fn decode_status_code() {
        assert_eq!(
            assert_ok!(StatusCode::from_ascii_bytes(b"404")),
            StatusCode::NO_MESSAGES
        );
        assert_eq!(
            assert_ok!("100".parse::<StatusCode>()),
            StatusCode::IDLE_HEARTBEAT
        );
        assert_err!(StatusCode::from_ascii_bytes(b"000"));
        assert_err!(StatusCode::from_ascii_bytes(b"40"));
        assert_err!(StatusCode::from_ascii_bytes(b"4044"));
        assert_err!(StatusCode::from_ascii_bytes(b"4x4"));
    }

    #[test]
    fn decode_header_line() {
        let status = assert_some!(assert_ok!(Status::from_header_line(Bytes::from_static(
            b"NATS/1.0 404 No Messages"
        ))));
        assert_eq!(status.code, StatusCode::NO_MESSAGES);
        assert_eq!(status.description(), Some("No Messages"));

        let status = assert_some!(assert_ok!(Status::from_header_line(Bytes::from_static(
            b"NATS/1.0 408"
        ))));
        assert_eq!(status.code, StatusCode::REQUEST_TIMEOUT);
        assert_none!(status.description());

        assert_none!(assert_ok!(Status::from_header_line(Bytes::from_static(
            b"NATS/1.0"
        ))));
        assert_err!(Status::from_header_line(Bytes::from_static(b"NATS/1.0 abc")));
    }

    #[test]
    fn json_representation() {
        assert_eq!(serde_json::to_string(&StatusCode::CONFLICT).unwrap(), "409");
        assert_eq!(
            serde_json::from_str::<StatusCode>("503").unwrap(),
            StatusCode::NO_RESPONDERS
        );
        assert!(serde_json::from_str::<StatusCode>("0").is_err());
    }
}
