//! Message headers and the `NATS/1.0` header block

use alloc::{collections::BTreeMap, vec::Vec};

use bytes::Bytes;

pub use self::name::HeaderName;
pub use self::value::HeaderValue;
use crate::{Status, util::lines_iter};

mod name;
mod value;

pub mod error {
    pub use super::HeaderDecodeError;
}

/// The `Nats-Msg-Id` header, used by the server for deduplication
pub const MESSAGE_ID: HeaderName = HeaderName::from_static("Nats-Msg-Id");
/// The `Nats-Last-Consumer` header, sent alongside flow control stalls
pub const LAST_CONSUMER: HeaderName = HeaderName::from_static("Nats-Last-Consumer");
/// The `Nats-Last-Stream` header, sent alongside flow control stalls
pub const LAST_STREAM: HeaderName = HeaderName::from_static("Nats-Last-Stream");
/// The `Nats-Consumer-Stalled` header, carrying the subject to reply to
pub const CONSUMER_STALLED: HeaderName = HeaderName::from_static("Nats-Consumer-Stalled");

/// A multimap of message headers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    headers: BTreeMap<HeaderName, Vec<HeaderValue>>,
}

/// An error encountered while decoding a header block
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderDecodeError {
    #[error("header block does not start with NATS/1.0")]
    MissingVersion,
    #[error("invalid status code")]
    StatusCode(#[source] crate::error::StatusCodeError),
    #[error("header line is missing the ':' separator")]
    MissingSeparator,
    #[error("header line is not valid UTF-8")]
    InvalidUtf8,
}

impl HeaderMap {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            headers: BTreeMap::new(),
        }
    }

    /// Decode a `NATS/1.0` header block into its status and headers
    ///
    /// # Errors
    ///
    /// It returns an error if the version line is missing, the status
    /// code is malformed or a header line can't be decoded.
    pub fn decode(block: Bytes) -> Result<(Option<Status>, Self), HeaderDecodeError> {
        let mut lines = lines_iter(block);
        let version_line = lines.next().ok_or(HeaderDecodeError::MissingVersion)?;
        if !version_line.starts_with(b"NATS/1.0") {
            return Err(HeaderDecodeError::MissingVersion);
        }
        let status =
            Status::from_header_line(version_line).map_err(HeaderDecodeError::StatusCode)?;

        let mut headers = Self::new();
        for line in lines {
            let separator =
                memchr::memchr(b':', &line).ok_or(HeaderDecodeError::MissingSeparator)?;
            let name = core::str::from_utf8(&line[..separator])
                .map_err(|_| HeaderDecodeError::InvalidUtf8)?;
            let value = core::str::from_utf8(&line[separator + 1..])
                .map_err(|_| HeaderDecodeError::InvalidUtf8)?;
            headers.append(
                HeaderName::from(name.trim()),
                HeaderValue::from(value.trim()),
            );
        }

        Ok((status, headers))
    }

    /// Get the first value of the `name` header
    #[must_use]
    pub fn get(&self, name: &HeaderName) -> Option<&HeaderValue> {
        self.headers.get(name).and_then(|values| values.first())
    }

    /// Get all values of the `name` header
    pub fn get_all(&self, name: &HeaderName) -> impl Iterator<Item = &HeaderValue> {
        self.headers.get(name).into_iter().flatten()
    }

    /// Replace all values of the `name` header with `value`
    pub fn insert(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, alloc::vec![value]);
    }

    /// Add `value` to the values of the `name` header
    pub fn append(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.entry(name).or_default().push(value);
    }

    pub fn remove(&mut self, name: &HeaderName) {
        self.headers.remove(name);
    }

    pub fn iter(
        &self,
    ) -> impl Iterator<Item = (&HeaderName, impl Iterator<Item = &HeaderValue>)> {
        self.headers.iter().map(|(name, values)| (name, values.iter()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

impl FromIterator<(HeaderName, HeaderValue)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (HeaderName, HeaderValue)>>(iter: I) -> Self {
        let mut this = Self::new();
        for (name, value) in iter {
            this.append(name, value);
        }
        this
    }
}
