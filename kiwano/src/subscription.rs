use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures_core::{FusedStream, Stream};
use kiwano_proto::{QueueGroup, ServerMessage, Subject, SubscriptionId, error::ServerError};
use tokio::sync::mpsc;

use crate::core::{Client, ClientClosedError};

/// A NATS Core subscription
///
/// Obtained from [`Client::subscribe`]. Messages are yielded in the order
/// the connection delivered them. The stream ends when the subscription
/// or the connection is closed.
///
/// Dropping the subscription lazily unsubscribes from the server.
#[derive(Debug)]
#[must_use = "consider calling `Subscription::close`"]
pub struct Subscription {
    id: SubscriptionId,
    subject: Subject,
    queue_group: Option<QueueGroup>,
    client: Client,
    receiver: mpsc::Receiver<Result<ServerMessage, ServerError>>,
    status: SubscriptionStatus,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SubscriptionStatus {
    Subscribed,
    Unsubscribed,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        subject: Subject,
        queue_group: Option<QueueGroup>,
        client: Client,
        receiver: mpsc::Receiver<Result<ServerMessage, ServerError>>,
    ) -> Self {
        Self {
            id,
            subject,
            queue_group,
            client,
            receiver,
            status: SubscriptionStatus::Subscribed,
        }
    }

    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// The filter subject this subscription was created with
    #[must_use]
    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    #[must_use]
    pub fn queue_group(&self) -> Option<&QueueGroup> {
        self.queue_group.as_ref()
    }

    /// Receive the next message
    ///
    /// Returns `None` once the subscription or the connection is closed.
    /// This method is cancel safe.
    pub async fn recv(&mut self) -> Option<Result<ServerMessage, ServerError>> {
        self.receiver.recv().await
    }

    /// Whether no more messages will ever be received
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.receiver.is_closed() && self.receiver.is_empty()
    }

    /// Unsubscribe and close the subscription
    ///
    /// # Errors
    ///
    /// It returns an error if the client is closed.
    pub async fn close(mut self) -> Result<(), ClientClosedError> {
        self.status = SubscriptionStatus::Unsubscribed;
        self.receiver.close();
        self.client.unsubscribe(self.id, None).await
    }
}

impl Stream for Subscription {
    type Item = Result<ServerMessage, ServerError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.receiver.len(), None)
    }
}

impl FusedStream for Subscription {
    fn is_terminated(&self) -> bool {
        self.is_closed()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.status == SubscriptionStatus::Subscribed && !self.client.is_closed() {
            self.client.lazy_unsubscribe(self.id, None);
        }
    }
}
