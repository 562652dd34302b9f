use alloc::string::String;
use core::{
    fmt::{self, Display},
    ops::Deref,
};

use bytestring::ByteString;
use serde::{Deserialize, Deserializer, Serialize, de};

/// A NATS subject
///
/// Subjects are `.` separated tokens. Tokens may not be empty and
/// may not contain whitespace. `*` and `>` act as wildcards when the
/// subject is used as a subscription filter.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Subject(ByteString);

/// An error encountered while validating a [`Subject`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubjectValidateError {
    /// The subject is empty
    #[error("subject is empty")]
    Empty,
    /// The subject contains an empty token
    #[error("subject contains an empty token")]
    EmptyToken,
    /// The subject contains a whitespace character
    #[error("subject contains whitespace")]
    IllegalCharacter,
}

impl Subject {
    /// Construct a subject from a static string
    ///
    /// # Panics
    ///
    /// Panics if `subject` is not a valid subject.
    #[must_use]
    pub fn from_static(subject: &'static str) -> Self {
        match validate_subject(subject) {
            Ok(()) => Self(ByteString::from_static(subject)),
            Err(err) => panic!("invalid static subject: {err}"),
        }
    }

    /// Construct a subject without validating it
    ///
    /// Callers must guarantee `value` is a valid subject.
    #[must_use]
    pub fn from_dangerous_value(value: ByteString) -> Self {
        debug_assert!(validate_subject(&value).is_ok());
        Self(value)
    }

    /// Iterate over the `.` separated tokens of this subject
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

fn validate_subject(subject: &str) -> Result<(), SubjectValidateError> {
    if subject.is_empty() {
        return Err(SubjectValidateError::Empty);
    }

    for token in subject.split('.') {
        if token.is_empty() {
            return Err(SubjectValidateError::EmptyToken);
        }
        if token.chars().any(char::is_whitespace) {
            return Err(SubjectValidateError::IllegalCharacter);
        }
    }

    Ok(())
}

impl TryFrom<ByteString> for Subject {
    type Error = SubjectValidateError;

    fn try_from(value: ByteString) -> Result<Self, Self::Error> {
        validate_subject(&value)?;
        Ok(Self(value))
    }
}

impl TryFrom<String> for Subject {
    type Error = SubjectValidateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(ByteString::from(value))
    }
}

impl TryFrom<&str> for Subject {
    type Error = SubjectValidateError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(ByteString::from(value))
    }
}

impl Deref for Subject {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl<'de> Deserialize<'de> for Subject {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = ByteString::deserialize(deserializer)?;
        s.try_into().map_err(de::Error::custom)
    }
}
