use alloc::string::String;
use core::{
    fmt::{self, Display},
    ops::Deref,
};

use bytestring::ByteString;

/// A NATS queue group
///
/// Subscriptions sharing the same queue group have messages load
/// balanced between them instead of each receiving a copy.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueGroup(ByteString);

/// An error encountered while validating a [`QueueGroup`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueGroupValidateError {
    #[error("queue group is empty")]
    Empty,
    #[error("queue group contains whitespace")]
    IllegalCharacter,
}

impl QueueGroup {
    #[must_use]
    pub fn from_static(queue_group: &'static str) -> Self {
        match validate_queue_group(queue_group) {
            Ok(()) => Self(ByteString::from_static(queue_group)),
            Err(err) => panic!("invalid static queue group: {err}"),
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

fn validate_queue_group(queue_group: &str) -> Result<(), QueueGroupValidateError> {
    if queue_group.is_empty() {
        Err(QueueGroupValidateError::Empty)
    } else if queue_group.chars().any(char::is_whitespace) {
        Err(QueueGroupValidateError::IllegalCharacter)
    } else {
        Ok(())
    }
}

impl TryFrom<String> for QueueGroup {
    type Error = QueueGroupValidateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_queue_group(&value)?;
        Ok(Self(value.into()))
    }
}

impl Deref for QueueGroup {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for QueueGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}
