#![no_std]
#![forbid(unsafe_code)]

extern crate alloc;
#[cfg(feature = "std")]
extern crate std;

pub use self::message::{MessageBase, ServerMessage};
pub use self::queue_group::QueueGroup;
pub use self::status::{Status, StatusCode};
pub use self::subject::Subject;
pub use self::subscription_id::SubscriptionId;

pub mod headers;
mod message;
mod queue_group;
mod status;
mod subject;
mod subscription_id;
mod util;

pub mod error {
    pub use super::ServerError;
    pub use super::headers::error::HeaderDecodeError;
    pub use super::queue_group::QueueGroupValidateError;
    pub use super::status::StatusCodeError;
    pub use super::subject::SubjectValidateError;
}

/// An error reported by the NATS server through an `-ERR` reply
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServerError {
    #[error("subject is invalid")]
    InvalidSubject,
    #[error("permissions violation for subscription")]
    SubscribePermissionViolation,
    #[error("permissions violation for publish")]
    PublishPermissionViolation,
    #[error("other server error: {0}")]
    Other(alloc::string::String),
}

impl ServerError {
    /// Whether the server closes the connection after reporting this error
    ///
    /// Returns `None` when the error is not known to this implementation.
    #[must_use]
    pub fn is_fatal(&self) -> Option<bool> {
        match self {
            Self::InvalidSubject
            | Self::SubscribePermissionViolation
            | Self::PublishPermissionViolation => Some(false),
            Self::Other(_) => None,
        }
    }
}
