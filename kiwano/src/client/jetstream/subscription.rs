use std::{num::NonZero, sync::Arc, time::Duration};

use kiwano_proto::{
    QueueGroup, Subject,
    error::{ServerError, SubjectValidateError},
};
use tokio::time::{Instant, timeout_at};
use tracing::debug;

use super::{
    AckPolicy, Consumer, ConsumerConfig, JetstreamClient, JetstreamError, JetstreamMessage,
    JetstreamRequest, MessageManager, PullManager, PullRequest, PushManager, StatusError,
    SubscriptionIdentity,
};
use crate::core::{ClientClosedError, Subscription};

/// Options controlling how a subscription is bound to its consumer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    stream: Option<String>,
    consumer: Option<String>,
    bind: bool,
    ordered: bool,
    pending_messages_limit: Option<NonZero<usize>>,
}

/// How the server delivers messages to a binding
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Messages are requested by the client
    Pull,
    /// Messages are sent by the server to the deliver subject
    Push,
}

/// The outcome of waiting for the next message
#[derive(Debug)]
pub enum NextMessage {
    Message(JetstreamMessage),
    /// No data frame arrived before the deadline
    TimedOut,
    /// The subscription or the connection was closed
    Closed,
}

/// An error encountered while consuming a [`JetstreamSubscription`]
#[derive(Debug, thiserror::Error)]
pub enum JetstreamSubscriptionError {
    #[error("unexpected status")]
    Status(#[source] StatusError),
    #[error("server error")]
    Server(#[source] ServerError),
    #[error("client closed")]
    ClientClosed(#[source] ClientClosedError),
    #[error("invalid subject")]
    Subject(#[source] SubjectValidateError),
    #[error("JSON serialization")]
    Json(#[source] serde_json::Error),
    #[error("subscription is not bound to a pull consumer")]
    NotPullBound,
}

/// A subscription bound to a JetStream consumer
///
/// Every frame received on the subscription is first handed to the
/// [`MessageManager`]. Control frames are consumed there, the rest is
/// delivered in order as [`JetstreamMessage`]s.
///
/// Dropping the binding unsubscribes from the server.
#[derive(Debug)]
#[must_use = "consider calling `JetstreamSubscription::close`"]
pub struct JetstreamSubscription {
    context: JetstreamClient,
    subscription: Subscription,
    config: Arc<ConsumerConfig>,
    options: Arc<SubscribeOptions>,
    consumer: Option<Consumer>,
    manager: MessageManager,
    mode: DeliveryMode,
}

impl SubscribeOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The stream the consumer belongs to
    #[must_use]
    pub fn stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    /// The name of the consumer to bind to
    #[must_use]
    pub fn consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = Some(consumer.into());
        self
    }

    /// Require the consumer to already exist instead of creating it
    #[must_use]
    pub fn bind(mut self, bind: bool) -> Self {
        self.bind = bind;
        self
    }

    /// Consume the stream in order through an ephemeral consumer
    #[must_use]
    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    /// The maximum number of frames buffered before the connection has to wait
    #[must_use]
    pub fn pending_messages_limit(mut self, limit: NonZero<usize>) -> Self {
        self.pending_messages_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn stream_name(&self) -> Option<&str> {
        self.stream.as_deref()
    }

    #[must_use]
    pub fn consumer_name(&self) -> Option<&str> {
        self.consumer.as_deref()
    }

    #[must_use]
    pub fn is_bind(&self) -> bool {
        self.bind
    }

    #[must_use]
    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    #[must_use]
    pub fn pending_limit(&self) -> Option<NonZero<usize>> {
        self.pending_messages_limit
    }

    /// Check these options can be used together with `config`
    ///
    /// # Errors
    ///
    /// It returns [`JetstreamError::InvalidConfig`] on conflicting settings.
    pub fn validate(&self, config: &ConsumerConfig) -> Result<(), JetstreamError> {
        if !self.ordered {
            return Ok(());
        }

        if self.bind {
            return Err(JetstreamError::InvalidConfig(
                "ordered consumers can't bind to an existing consumer",
            ));
        }
        if config.durable_name.is_some() {
            return Err(JetstreamError::InvalidConfig("ordered consumers can't be durable"));
        }
        if config.ack_policy != AckPolicy::None {
            return Err(JetstreamError::InvalidConfig(
                "ordered consumers require the none ack policy",
            ));
        }
        Ok(())
    }
}

impl JetstreamSubscription {
    /// Subscribe to `subject` and bind the subscription to a consumer
    ///
    /// # Errors
    ///
    /// It returns an error if the client is closed.
    pub async fn bind(
        context: JetstreamClient,
        subject: Subject,
        queue_group: Option<QueueGroup>,
        config: ConsumerConfig,
        options: SubscribeOptions,
        consumer: Option<Consumer>,
        mode: DeliveryMode,
    ) -> Result<Self, ClientClosedError> {
        let subscription = context
            .client()
            .subscribe_with_capacity(
                subject.clone(),
                queue_group.clone(),
                options.pending_messages_limit,
            )
            .await?;

        let identity = Arc::new(SubscriptionIdentity {
            subject,
            queue_group,
            stream: options.stream.clone(),
            consumer: options.consumer.clone(),
        });
        let manager = match mode {
            DeliveryMode::Pull => MessageManager::Pull(PullManager::new(identity)),
            DeliveryMode::Push => MessageManager::Push(PushManager::new(
                identity,
                context.client().clone(),
                context.error_callback_ref().cloned(),
            )),
        };
        debug!(
            subscription_id = %subscription.id(),
            subject = %subscription.subject(),
            ?mode,
            "bound JetStream subscription"
        );

        Ok(Self {
            context,
            subscription,
            config: Arc::new(config),
            options: Arc::new(options),
            consumer,
            manager,
            mode,
        })
    }

    /// Wait for the next data message
    ///
    /// A `timeout` of [`Duration::ZERO`] waits indefinitely. Otherwise the
    /// deadline is computed once, so control frames consumed along the way
    /// don't extend it.
    ///
    /// Returns `Ok(None)` both when the deadline expires and when the
    /// subscription is closed. Use [`JetstreamSubscription::next`] to tell
    /// them apart.
    ///
    /// # Errors
    ///
    /// It returns an error if the server sends a status the consumer didn't
    /// expect or if the server reports an error for the subscription.
    pub async fn next_message(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<JetstreamMessage>, JetstreamSubscriptionError> {
        match self.next(timeout).await? {
            NextMessage::Message(message) => Ok(Some(message)),
            NextMessage::TimedOut | NextMessage::Closed => Ok(None),
        }
    }

    /// Wait for the next data message, reporting why none was received
    ///
    /// # Errors
    ///
    /// See [`JetstreamSubscription::next_message`].
    pub async fn next(
        &mut self,
        timeout: Duration,
    ) -> Result<NextMessage, JetstreamSubscriptionError> {
        let deadline = if timeout.is_zero() {
            None
        } else {
            Instant::now().checked_add(timeout)
        };

        loop {
            let received = match deadline {
                Some(deadline) => match timeout_at(deadline, self.subscription.recv()).await {
                    Ok(received) => received,
                    Err(_elapsed) => return Ok(NextMessage::TimedOut),
                },
                None => self.subscription.recv().await,
            };
            let Some(received) = received else {
                return Ok(NextMessage::Closed);
            };
            let message = received.map_err(JetstreamSubscriptionError::Server)?;

            if self
                .manager
                .manage(&message)
                .map_err(JetstreamSubscriptionError::Status)?
            {
                continue;
            }

            return Ok(NextMessage::Message(JetstreamMessage::new(
                message,
                self.context.client().clone(),
            )));
        }
    }

    /// Ask the pull consumer for up to `batch` messages
    ///
    /// # Errors
    ///
    /// It returns an error if this isn't a pull binding or if the client is closed.
    pub async fn pull(&self, batch: NonZero<usize>) -> Result<(), JetstreamSubscriptionError> {
        self.pull_with(&PullRequest::new(batch)).await
    }

    /// Ask the pull consumer for up to `batch` of the messages already pending
    ///
    /// # Errors
    ///
    /// It returns an error if this isn't a pull binding or if the client is closed.
    pub async fn pull_no_wait(
        &self,
        batch: NonZero<usize>,
    ) -> Result<(), JetstreamSubscriptionError> {
        self.pull_with(&PullRequest::no_wait(batch)).await
    }

    /// Ask the pull consumer for up to `batch` messages, waiting at most `expires`
    ///
    /// # Errors
    ///
    /// It returns an error if this isn't a pull binding or if the client is closed.
    pub async fn pull_expires_in(
        &self,
        batch: NonZero<usize>,
        expires: Duration,
    ) -> Result<(), JetstreamSubscriptionError> {
        self.pull_with(&PullRequest::expires_in(batch, expires))
            .await
    }

    /// Send a pull request to the consumer
    ///
    /// The messages it yields are delivered to this binding.
    ///
    /// # Errors
    ///
    /// It returns an error if this isn't a pull binding or if the client is closed.
    pub async fn pull_with(&self, request: &PullRequest) -> Result<(), JetstreamSubscriptionError> {
        let (DeliveryMode::Pull, Some(stream), Some(consumer)) = (
            self.mode,
            self.options.stream_name(),
            self.options.consumer_name(),
        ) else {
            return Err(JetstreamSubscriptionError::NotPullBound);
        };

        let subject = self
            .context
            .subject_for_request(&format!("CONSUMER.MSG.NEXT.{stream}.{consumer}"))
            .map_err(JetstreamSubscriptionError::Subject)?;
        let payload = request
            .to_bytes()
            .map_err(JetstreamSubscriptionError::Json)?;
        self.context
            .client()
            .publish(subject)
            .reply_subject(Some(self.subscription.subject().clone()))
            .payload(payload)
            .await
            .map_err(JetstreamSubscriptionError::ClientClosed)
    }

    /// Report missed heartbeats for push bindings whose consumer has an idle heartbeat
    pub(crate) fn check_heartbeats(&mut self) -> bool {
        match (&mut self.manager, self.config.idle_heartbeat) {
            (MessageManager::Push(push), Some(idle_heartbeat)) => {
                push.check_heartbeats(idle_heartbeat)
            }
            _ => false,
        }
    }

    /// Unsubscribe and close the binding
    ///
    /// # Errors
    ///
    /// It returns an error if the client is closed.
    pub async fn close(self) -> Result<(), ClientClosedError> {
        self.subscription.close().await
    }

    /// The JetStream context this binding belongs to
    #[must_use]
    pub fn context(&self) -> &JetstreamClient {
        &self.context
    }

    #[must_use]
    pub fn consumer_config(&self) -> &Arc<ConsumerConfig> {
        &self.config
    }

    #[must_use]
    pub fn subscribe_options(&self) -> &Arc<SubscribeOptions> {
        &self.options
    }

    /// The consumer snapshot taken when the binding was created
    #[must_use]
    pub fn consumer_info(&self) -> Option<&Consumer> {
        self.consumer.as_ref()
    }

    #[must_use]
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    #[must_use]
    pub fn identity(&self) -> &Arc<SubscriptionIdentity> {
        self.manager.identity()
    }

    #[must_use]
    pub fn manager(&self) -> &MessageManager {
        &self.manager
    }

    #[must_use]
    pub fn delivery_mode(&self) -> DeliveryMode {
        self.mode
    }
}
