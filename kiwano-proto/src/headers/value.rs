use alloc::string::String;
use core::fmt::{self, Display};

use bytestring::ByteString;

/// The value of a header
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeaderValue(ByteString);

impl HeaderValue {
    #[must_use]
    pub const fn from_static(value: &'static str) -> Self {
        Self(ByteString::from_static(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        Self(ByteString::from(value))
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        Self(ByteString::from(value))
    }
}

impl Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(self.as_str(), f)
    }
}
