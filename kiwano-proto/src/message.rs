use bytes::Bytes;

use crate::{
    Status, StatusCode, Subject,
    headers::{HeaderDecodeError, HeaderMap},
    subscription_id::SubscriptionId,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBase {
    pub subject: Subject,
    pub reply_subject: Option<Subject>,
    pub headers: HeaderMap,
    pub payload: Bytes,
}

/// A message delivered by the server to one of our subscriptions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    pub status: Option<Status>,
    pub subscription_id: SubscriptionId,
    pub base: MessageBase,
}

impl ServerMessage {
    /// Build a message from the raw parts of an `HMSG`
    ///
    /// # Errors
    ///
    /// It returns an error if `header_block` can't be decoded.
    pub fn from_header_block(
        subscription_id: SubscriptionId,
        subject: Subject,
        reply_subject: Option<Subject>,
        header_block: Bytes,
        payload: Bytes,
    ) -> Result<Self, HeaderDecodeError> {
        let (status, headers) = HeaderMap::decode(header_block)?;
        Ok(Self {
            status,
            subscription_id,
            base: MessageBase {
                subject,
                reply_subject,
                headers,
                payload,
            },
        })
    }

    #[must_use]
    pub fn status_code(&self) -> Option<StatusCode> {
        self.status.as_ref().map(|status| status.code)
    }

    /// Whether this message is a control frame
    ///
    /// A control frame carries a status marker and no payload. Messages
    /// carrying a payload are application data, even if a status is present.
    #[must_use]
    pub fn has_status(&self) -> bool {
        self.status.is_some() && self.base.payload.is_empty()
    }
}
