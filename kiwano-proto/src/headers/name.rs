use alloc::string::String;
use core::{
    fmt::{self, Display},
    ops::Deref,
};

use bytestring::ByteString;
use unicase::UniCase;

/// The name of a header
///
/// Header names compare case insensitively.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeaderName(UniCase<ByteString>);

impl HeaderName {
    #[must_use]
    pub const fn from_static(value: &'static str) -> Self {
        Self(UniCase::unicode(ByteString::from_static(value)))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for HeaderName {
    fn from(value: &str) -> Self {
        Self(UniCase::new(ByteString::from(value)))
    }
}

impl From<String> for HeaderName {
    fn from(value: String) -> Self {
        Self(UniCase::new(ByteString::from(value)))
    }
}

impl Deref for HeaderName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl Display for HeaderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(self.as_str(), f)
    }
}
