use std::fmt::{self, Display};

use bytes::Bytes;
use jiff::Timestamp;
use kiwano_proto::{ServerMessage, Status, Subject, headers::HeaderMap};

use crate::core::{Client, ClientClosedError, ResponseError};

/// A message delivered by a JetStream consumer
///
/// Wraps the data frame exactly as it was received, together with the
/// client needed to acknowledge it.
#[derive(Debug, Clone)]
pub struct JetstreamMessage {
    message: ServerMessage,
    client: Client,
}

/// The kind of acknowledgment sent back to the server
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AckKind {
    /// The message was processed
    Ack,
    /// The message wasn't processed and should be redelivered
    Nak,
    /// Processing is still ongoing, reset the redelivery timer
    InProgress,
    /// The message must never be redelivered
    Term,
}

/// An error encountered while acknowledging a message
#[derive(Debug, thiserror::Error)]
pub enum AckError {
    #[error("message has no reply subject")]
    NoReplySubject,
    #[error("client closed")]
    ClientClosed(#[source] ClientClosedError),
    #[error("acknowledgment not confirmed")]
    Response(#[source] ResponseError),
}

/// The delivery information encoded in the reply subject of a JetStream message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMetadata {
    pub domain: Option<String>,
    pub stream: String,
    pub consumer: String,
    /// How many times the message has been delivered
    pub delivered: u64,
    pub stream_sequence: u64,
    pub consumer_sequence: u64,
    pub timestamp: Timestamp,
    /// How many messages are still pending on the consumer
    pub pending: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    #[error("message has no reply subject")]
    NoReplySubject,
    #[error("reply subject is not a JetStream ack subject")]
    NotAckSubject,
    #[error("unexpected number of tokens in ack subject: {0}")]
    TokenCount(usize),
    #[error("invalid {0} in ack subject")]
    InvalidNumber(&'static str),
    #[error("timestamp out of range")]
    InvalidTimestamp,
}

impl JetstreamMessage {
    pub(crate) fn new(message: ServerMessage, client: Client) -> Self {
        Self { message, client }
    }

    #[must_use]
    pub fn subject(&self) -> &Subject {
        &self.message.base.subject
    }

    #[must_use]
    pub fn reply_subject(&self) -> Option<&Subject> {
        self.message.base.reply_subject.as_ref()
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.message.base.headers
    }

    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.message.base.payload
    }

    /// The status marker, if the server attached one to this data frame
    #[must_use]
    pub fn status(&self) -> Option<&Status> {
        self.message.status.as_ref()
    }

    /// Get the frame as it was received from the server
    #[must_use]
    pub fn into_inner(self) -> ServerMessage {
        self.message
    }

    /// Parse the delivery information out of the reply subject
    ///
    /// # Errors
    ///
    /// It returns an error if the message has no reply subject or if it
    /// isn't a well formed JetStream ack subject.
    pub fn metadata(&self) -> Result<MessageMetadata, MetadataError> {
        let reply_subject = self.reply_subject().ok_or(MetadataError::NoReplySubject)?;
        MessageMetadata::from_ack_subject(reply_subject)
    }

    /// Acknowledge the message
    ///
    /// # Errors
    ///
    /// It returns an error if the message has no reply subject or if the client is closed.
    pub async fn ack(&self) -> Result<(), AckError> {
        self.acknowledge(AckKind::Ack).await
    }

    /// Negatively acknowledge the message, asking for a redelivery
    ///
    /// # Errors
    ///
    /// It returns an error if the message has no reply subject or if the client is closed.
    pub async fn nak(&self) -> Result<(), AckError> {
        self.acknowledge(AckKind::Nak).await
    }

    /// Tell the server the message is still being worked on
    ///
    /// # Errors
    ///
    /// It returns an error if the message has no reply subject or if the client is closed.
    pub async fn in_progress(&self) -> Result<(), AckError> {
        self.acknowledge(AckKind::InProgress).await
    }

    /// Stop the message from ever being redelivered
    ///
    /// # Errors
    ///
    /// It returns an error if the message has no reply subject or if the client is closed.
    pub async fn term(&self) -> Result<(), AckError> {
        self.acknowledge(AckKind::Term).await
    }

    /// Send an acknowledgment of the given `kind`
    ///
    /// # Errors
    ///
    /// It returns an error if the message has no reply subject or if the client is closed.
    pub async fn acknowledge(&self, kind: AckKind) -> Result<(), AckError> {
        let reply_subject = self.ack_subject()?;
        self.client
            .publish(reply_subject)
            .payload(kind.payload())
            .await
            .map_err(AckError::ClientClosed)
    }

    /// Acknowledge the message and wait for the server to confirm it
    ///
    /// # Errors
    ///
    /// It returns an error if the message has no reply subject, if the client
    /// is closed or if the server doesn't confirm the acknowledgment in time.
    pub async fn ack_sync(&self) -> Result<(), AckError> {
        let reply_subject = self.ack_subject()?;
        let response = self
            .client
            .request(reply_subject)
            .payload(AckKind::Ack.payload())
            .await
            .map_err(AckError::ClientClosed)?;
        response.await.map_err(AckError::Response)?;
        Ok(())
    }

    fn ack_subject(&self) -> Result<Subject, AckError> {
        self.reply_subject().cloned().ok_or(AckError::NoReplySubject)
    }
}

impl AckKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ack => "+ACK",
            Self::Nak => "-NAK",
            Self::InProgress => "+WPI",
            Self::Term => "+TERM",
        }
    }

    fn payload(self) -> Bytes {
        Bytes::from_static(self.as_str().as_bytes())
    }
}

impl Display for AckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MessageMetadata {
    /// Parse a `$JS.ACK` reply subject
    ///
    /// Both the legacy form
    /// `$JS.ACK.<stream>.<consumer>.<delivered>.<sseq>.<cseq>.<ts>.<pending>`
    /// and the domain aware form
    /// `$JS.ACK.<domain>.<account>.<stream>.<consumer>.<delivered>.<sseq>.<cseq>.<ts>.<pending>.<token>`
    /// are understood, the trailing token being optional. A `_` domain means no domain.
    ///
    /// # Errors
    ///
    /// It returns an error if `subject` isn't a well formed ack subject.
    pub fn from_ack_subject(subject: &Subject) -> Result<Self, MetadataError> {
        let tokens = subject.tokens().collect::<Vec<_>>();
        if tokens.len() < 2 || tokens[0] != "$JS" || tokens[1] != "ACK" {
            return Err(MetadataError::NotAckSubject);
        }

        let (domain, rest) = match tokens.len() {
            9 => (None, &tokens[2..]),
            n if n >= 11 => {
                let domain = match tokens[2] {
                    "_" => None,
                    domain => Some(domain.to_owned()),
                };
                (domain, &tokens[4..11])
            }
            n => return Err(MetadataError::TokenCount(n)),
        };

        let timestamp = parse_number::<i128>(rest[5], "timestamp")?;
        Ok(Self {
            domain,
            stream: rest[0].to_owned(),
            consumer: rest[1].to_owned(),
            delivered: parse_number(rest[2], "delivered count")?,
            stream_sequence: parse_number(rest[3], "stream sequence")?,
            consumer_sequence: parse_number(rest[4], "consumer sequence")?,
            timestamp: Timestamp::from_nanosecond(timestamp)
                .map_err(|_| MetadataError::InvalidTimestamp)?,
            pending: parse_number(rest[6], "pending count")?,
        })
    }
}

fn parse_number<T: std::str::FromStr>(token: &str, what: &'static str) -> Result<T, MetadataError> {
    token.parse().map_err(|_| MetadataError::InvalidNumber(what))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use claims::{assert_err_eq, assert_matches, assert_none, assert_ok};
    use kiwano_proto::{MessageBase, ServerMessage, Subject, SubscriptionId, headers::HeaderMap};

    use super::{AckError, AckKind, JetstreamMessage, MessageMetadata, MetadataError};
    use crate::{
        client::{ClientCommand, tests::test_client},
        core::{Client, ResponseError},
    };

    fn message(client: Client, reply_subject: Option<&'static str>) -> JetstreamMessage {
        JetstreamMessage::new(
            ServerMessage {
                status: None,
                subscription_id: SubscriptionId::MIN,
                base: MessageBase {
                    subject: Subject::from_static("orders.new"),
                    reply_subject: reply_subject.map(Subject::from_static),
                    headers: HeaderMap::new(),
                    payload: Bytes::from_static(b"order"),
                },
            },
            client,
        )
    }

    #[test]
    fn legacy_metadata() {
        let metadata = assert_ok!(MessageMetadata::from_ack_subject(&Subject::from_static(
            "$JS.ACK.ORDERS.processor.2.1042.17.1714557600000000000.5"
        )));
        assert_eq!(metadata.domain, None);
        assert_eq!(metadata.stream, "ORDERS");
        assert_eq!(metadata.consumer, "processor");
        assert_eq!(metadata.delivered, 2);
        assert_eq!(metadata.stream_sequence, 1042);
        assert_eq!(metadata.consumer_sequence, 17);
        assert_eq!(metadata.timestamp.to_string(), "2024-05-01T10:00:00Z");
        assert_eq!(metadata.pending, 5);
    }

    #[test]
    fn domain_metadata() {
        let metadata = assert_ok!(MessageMetadata::from_ack_subject(&Subject::from_static(
            "$JS.ACK.hub.ACCHASH.ORDERS.processor.1.7.3.1714557600000000000.0.rnd"
        )));
        assert_eq!(metadata.domain.as_deref(), Some("hub"));
        assert_eq!(metadata.stream, "ORDERS");
        assert_eq!(metadata.stream_sequence, 7);
        assert_eq!(metadata.pending, 0);

        let metadata = assert_ok!(MessageMetadata::from_ack_subject(&Subject::from_static(
            "$JS.ACK._.ACCHASH.ORDERS.processor.1.7.3.1714557600000000000.0.rnd"
        )));
        assert_none!(metadata.domain);
    }

    #[test]
    fn invalid_metadata() {
        assert_err_eq!(
            MessageMetadata::from_ack_subject(&Subject::from_static("_INBOX.abc")),
            MetadataError::NotAckSubject
        );
        assert_err_eq!(
            MessageMetadata::from_ack_subject(&Subject::from_static("$JS.ACK.ORDERS.processor.1")),
            MetadataError::TokenCount(5)
        );
        assert_err_eq!(
            MessageMetadata::from_ack_subject(&Subject::from_static(
                "$JS.ACK.ORDERS.processor.x.1042.17.1714557600000000000.5"
            )),
            MetadataError::InvalidNumber("delivered count")
        );

        let (client, _commands) = test_client();
        assert_err_eq!(
            message(client, None).metadata(),
            MetadataError::NoReplySubject
        );
    }

    #[tokio::test]
    async fn acknowledgments_publish_to_reply_subject() {
        let (client, mut commands) = test_client();
        let msg = message(client, Some("$JS.ACK.ORDERS.processor.1.1.1.0.0"));

        assert_ok!(msg.ack().await);
        assert_ok!(msg.nak().await);
        assert_ok!(msg.in_progress().await);
        assert_ok!(msg.term().await);

        for kind in [
            AckKind::Ack,
            AckKind::Nak,
            AckKind::InProgress,
            AckKind::Term,
        ] {
            assert_matches!(
                commands.recv().await,
                Some(ClientCommand::Publish { message })
                    if message.subject.as_str() == "$JS.ACK.ORDERS.processor.1.1.1.0.0"
                        && message.payload == kind.as_str().as_bytes()
            );
        }
    }

    #[tokio::test]
    async fn ack_without_reply_subject() {
        let (client, _commands) = test_client();
        let msg = message(client, None);

        assert_matches!(msg.ack().await, Err(AckError::NoReplySubject));
        assert_matches!(msg.ack_sync().await, Err(AckError::NoReplySubject));
    }

    #[tokio::test]
    async fn ack_on_closed_client() {
        let (client, commands) = test_client();
        drop(commands);

        let msg = message(client, Some("$JS.ACK.ORDERS.processor.1.1.1.0.0"));
        assert_matches!(msg.ack().await, Err(AckError::ClientClosed(_)));
    }

    #[tokio::test]
    async fn ack_sync_waits_for_confirmation() {
        let (client, mut commands) = test_client();
        let msg = message(client, Some("$JS.ACK.ORDERS.processor.1.1.1.0.0"));

        let responder = tokio::spawn(async move {
            let Some(ClientCommand::Request { message, reply }) = commands.recv().await else {
                panic!("expected request");
            };
            assert_eq!(message.payload, Bytes::from_static(b"+ACK"));
            reply
                .send(ServerMessage {
                    status: None,
                    subscription_id: SubscriptionId::MIN,
                    base: MessageBase {
                        subject: message.reply_subject.unwrap(),
                        reply_subject: None,
                        headers: HeaderMap::new(),
                        payload: Bytes::new(),
                    },
                })
                .unwrap();
            commands
        });

        assert_ok!(msg.ack_sync().await);
        let mut commands = responder.await.unwrap();

        // unconfirmed
        let ack_sync = tokio::spawn(async move { msg.ack_sync().await });
        drop(commands.recv().await);
        assert_matches!(
            ack_sync.await.unwrap(),
            Err(AckError::Response(ResponseError::SubscriptionClosed))
        );
    }
}
