use std::{
    future::{Future, IntoFuture},
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use kiwano_proto::{
    MessageBase, ServerMessage, StatusCode, Subject,
    headers::{HeaderMap, HeaderName, HeaderValue},
};
use pin_project_lite::pin_project;
use tokio::{
    sync::oneshot,
    time::{Timeout, timeout},
};

use super::{Client, ClientClosedError, ClientCommand, TryCommandError};

/// A publish to be sent through a [`Client`]
///
/// Obtained from [`Client::publish`]. Awaiting it enqueues the message.
#[derive(Debug)]
#[must_use = "consider awaiting the publish"]
pub struct ClientPublish<'a> {
    client: &'a Client,
    message: MessageBase,
}

/// A request to be sent through a [`Client`]
///
/// Obtained from [`Client::request`]. Awaiting it enqueues the request
/// and returns a [`ResponseFut`] resolving to the first response.
#[derive(Debug)]
#[must_use = "consider awaiting the request"]
pub struct ClientRequest<'a> {
    client: &'a Client,
    subject: Subject,
    headers: HeaderMap,
    payload: Bytes,
    response_timeout: Duration,
}

pin_project! {
    /// A [`Future`] for receiving a response
    #[derive(Debug)]
    #[must_use = "consider awaiting the response"]
    pub struct ResponseFut {
        #[pin]
        receiver: Timeout<oneshot::Receiver<ServerMessage>>,
    }
}

/// An error encountered while waiting for a response
#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    /// The NATS server told us no subscriber is listening on the subject
    #[error("no responders")]
    NoResponders,
    /// No response was received within the response timeout
    #[error("timed out")]
    TimedOut,
    /// The connection dropped the request before a response arrived
    #[error("subscription closed")]
    SubscriptionClosed,
}

impl<'a> ClientPublish<'a> {
    pub(super) fn build(client: &'a Client, subject: Subject) -> Self {
        Self {
            client,
            message: MessageBase {
                subject,
                reply_subject: None,
                headers: HeaderMap::new(),
                payload: Bytes::new(),
            },
        }
    }

    pub fn reply_subject(mut self, reply_subject: Option<Subject>) -> Self {
        self.message.reply_subject = reply_subject;
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.message.headers.append(name, value);
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.message.headers = headers;
        self
    }

    pub fn payload(mut self, payload: Bytes) -> Self {
        self.message.payload = payload;
        self
    }

    /// Enqueue the publish without waiting for buffer space
    ///
    /// # Errors
    ///
    /// It returns an error if the client buffer is full or the client is closed.
    pub fn try_send(self) -> Result<(), TryCommandError> {
        self.client.try_enqueue_command(ClientCommand::Publish {
            message: self.message,
        })
    }
}

impl<'a> IntoFuture for ClientPublish<'a> {
    type Output = Result<(), ClientClosedError>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send + 'a>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            self.client
                .enqueue_command(ClientCommand::Publish {
                    message: self.message,
                })
                .await
        })
    }
}

impl<'a> ClientRequest<'a> {
    pub(super) fn build(client: &'a Client, subject: Subject) -> Self {
        Self {
            client,
            subject,
            headers: HeaderMap::new(),
            payload: Bytes::new(),
            response_timeout: client.default_response_timeout(),
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    /// Override the client's default response timeout for this request
    pub fn response_timeout(mut self, response_timeout: Duration) -> Self {
        self.response_timeout = response_timeout;
        self
    }
}

impl<'a> IntoFuture for ClientRequest<'a> {
    type Output = Result<ResponseFut, ClientClosedError>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send + 'a>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            let (sender, receiver) = oneshot::channel();
            let message = MessageBase {
                subject: self.subject,
                reply_subject: Some(self.client.create_inbox_subject()),
                headers: self.headers,
                payload: self.payload,
            };
            self.client
                .enqueue_command(ClientCommand::Request {
                    message,
                    reply: sender,
                })
                .await?;

            Ok(ResponseFut {
                receiver: timeout(self.response_timeout, receiver),
            })
        })
    }
}

impl Future for ResponseFut {
    type Output = Result<ServerMessage, ResponseError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.receiver.poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(Ok(message)))
                if message.has_status()
                    && message.status_code() == Some(StatusCode::NO_RESPONDERS) =>
            {
                Poll::Ready(Err(ResponseError::NoResponders))
            }
            Poll::Ready(Ok(Ok(message))) => Poll::Ready(Ok(message)),
            Poll::Ready(Ok(Err(_recv_error))) => {
                Poll::Ready(Err(ResponseError::SubscriptionClosed))
            }
            Poll::Ready(Err(_elapsed)) => Poll::Ready(Err(ResponseError::TimedOut)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use claims::{assert_matches, assert_ok};
    use kiwano_proto::{MessageBase, ServerMessage, Status, StatusCode, Subject, SubscriptionId};

    use super::ResponseError;
    use crate::client::{ClientCommand, tests::test_client};

    #[tokio::test]
    async fn request_response() {
        let (client, mut commands) = test_client();

        let response = assert_ok!(
            client
                .request(Subject::from_static("$JS.API.INFO"))
                .payload(Bytes::from_static(b"{}"))
                .await
        );
        let ClientCommand::Request { message, reply } = commands.recv().await.unwrap() else {
            panic!("expected request");
        };
        let reply_subject = message.reply_subject.unwrap();
        assert!(reply_subject.starts_with("_INBOX."));
        reply
            .send(ServerMessage {
                status: None,
                subscription_id: SubscriptionId::MIN,
                base: MessageBase {
                    subject: reply_subject,
                    reply_subject: None,
                    headers: Default::default(),
                    payload: Bytes::from_static(b"{\"type\":\"info\"}"),
                },
            })
            .unwrap();

        let response = assert_ok!(response.await);
        assert_eq!(
            response.base.payload,
            Bytes::from_static(b"{\"type\":\"info\"}")
        );
    }

    #[tokio::test]
    async fn no_responders() {
        let (client, mut commands) = test_client();

        let response = assert_ok!(client.request(Subject::from_static("nobody")).await);
        let ClientCommand::Request { message, reply } = commands.recv().await.unwrap() else {
            panic!("expected request");
        };
        reply
            .send(ServerMessage {
                status: Some(Status::new(StatusCode::NO_RESPONDERS)),
                subscription_id: SubscriptionId::MIN,
                base: MessageBase {
                    subject: message.reply_subject.unwrap(),
                    reply_subject: None,
                    headers: Default::default(),
                    payload: Bytes::new(),
                },
            })
            .unwrap();

        assert_matches!(response.await, Err(ResponseError::NoResponders));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out() {
        let (client, mut commands) = test_client();

        let response = assert_ok!(
            client
                .request(Subject::from_static("slow"))
                .response_timeout(Duration::from_secs(1))
                .await
        );
        let _cmd = commands.recv().await.unwrap();

        assert_matches!(response.await, Err(ResponseError::TimedOut));
    }

    #[tokio::test]
    async fn dropped_reply() {
        let (client, mut commands) = test_client();

        let response = assert_ok!(client.request(Subject::from_static("dropped")).await);
        drop(commands.recv().await.unwrap());

        assert_matches!(response.await, Err(ResponseError::SubscriptionClosed));
    }
}
