use std::{error::Error, sync::Arc, time::Duration};

use kiwano_proto::error::ServerError;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{
    AckError, AckKind, Consumer, ConsumerConfig, JetstreamClient, JetstreamMessage,
    JetstreamSubscription, JetstreamSubscriptionError, NextMessage, SubscribeOptions,
    SubscriptionIdentity,
};

/// The error type returned by push subscription handlers
pub type HandlerError = Box<dyn Error + Send + Sync>;

type WrappedHandler = Box<dyn FnMut(&JetstreamMessage) -> Option<AckKind> + Send>;

/// Whether a push subscription acknowledges messages on behalf of its handler
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum AutoAck {
    /// The handler is responsible for acknowledging messages
    #[default]
    Disabled,
    /// Acknowledge every message once the handler returns, even if it failed
    Always,
    /// Acknowledge messages the handler succeeded on, negatively acknowledge the rest
    OnSuccess,
}

/// A push subscription driving a handler
///
/// Frames are received by a background task which feeds them to the
/// [`MessageManager`] and then, for data messages, to the handler. Messages
/// are handled one at a time, in the order they were received, and any
/// automatic acknowledgment is sent before the next message is handled.
///
/// When the consumer has an idle heartbeat, missing heartbeats are reported
/// to the context's error callback.
///
/// Dropping the push subscription stops the task and unsubscribes.
///
/// [`MessageManager`]: super::MessageManager
#[derive(Debug)]
#[must_use = "consider calling `PushSubscription::close`"]
pub struct PushSubscription {
    context: JetstreamClient,
    config: Arc<ConsumerConfig>,
    options: Arc<SubscribeOptions>,
    consumer: Option<Consumer>,
    identity: Arc<SubscriptionIdentity>,
    auto_ack: AutoAck,
    handle: JoinHandle<()>,
}

impl PushSubscription {
    /// Start delivering the messages received by `binding` to `handler`
    ///
    /// The handler is wrapped according to `auto_ack` once, here.
    pub fn new<F>(binding: JetstreamSubscription, handler: F, auto_ack: AutoAck) -> Self
    where
        F: FnMut(&JetstreamMessage) -> Result<(), HandlerError> + Send + 'static,
    {
        let context = binding.context().clone();
        let config = Arc::clone(binding.consumer_config());
        let options = Arc::clone(binding.subscribe_options());
        let consumer = binding.consumer_info().cloned();
        let identity = Arc::clone(binding.identity());

        let handler = wrap_handler(handler, auto_ack);
        let handle = tokio::spawn(dispatch(binding, handler));

        Self {
            context,
            config,
            options,
            consumer,
            identity,
            auto_ack,
            handle,
        }
    }

    #[must_use]
    pub fn context(&self) -> &JetstreamClient {
        &self.context
    }

    #[must_use]
    pub fn consumer_config(&self) -> &ConsumerConfig {
        &self.config
    }

    #[must_use]
    pub fn subscribe_options(&self) -> &SubscribeOptions {
        &self.options
    }

    /// The consumer snapshot taken when the binding was created
    #[must_use]
    pub fn consumer_info(&self) -> Option<&Consumer> {
        self.consumer.as_ref()
    }

    #[must_use]
    pub fn identity(&self) -> &SubscriptionIdentity {
        &self.identity
    }

    #[must_use]
    pub fn auto_ack(&self) -> AutoAck {
        self.auto_ack
    }

    /// Whether the subscription stopped receiving messages
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop handling messages and unsubscribe
    pub async fn close(mut self) {
        self.handle.abort();
        match (&mut self.handle).await {
            Err(err) if err.is_panic() => {
                warn!(identity = %self.identity, "push subscription handler panicked");
            }
            Ok(()) | Err(_) => {}
        }
    }
}

impl Drop for PushSubscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl From<bool> for AutoAck {
    fn from(value: bool) -> Self {
        if value { Self::Always } else { Self::Disabled }
    }
}

fn wrap_handler<F>(mut handler: F, auto_ack: AutoAck) -> WrappedHandler
where
    F: FnMut(&JetstreamMessage) -> Result<(), HandlerError> + Send + 'static,
{
    match auto_ack {
        AutoAck::Disabled => Box::new(move |message: &JetstreamMessage| {
            if let Err(err) = handler(message) {
                warn!(subject = %message.subject(), error = %err, "push handler failed");
            }
            None
        }),
        AutoAck::Always => Box::new(move |message: &JetstreamMessage| {
            if let Err(err) = handler(message) {
                warn!(subject = %message.subject(), error = %err, "push handler failed");
            }
            Some(AckKind::Ack)
        }),
        AutoAck::OnSuccess => Box::new(move |message: &JetstreamMessage| match handler(message) {
            Ok(()) => Some(AckKind::Ack),
            Err(err) => {
                warn!(subject = %message.subject(), error = %err, "push handler failed");
                Some(AckKind::Nak)
            }
        }),
    }
}

async fn dispatch(mut binding: JetstreamSubscription, mut handler: WrappedHandler) {
    // wake up once per heartbeat interval to look for missed heartbeats
    let wait = binding
        .consumer_config()
        .idle_heartbeat
        .unwrap_or(Duration::ZERO);

    loop {
        let message = match binding.next(wait).await {
            Ok(NextMessage::Message(message)) => message,
            Ok(NextMessage::TimedOut) => {
                binding.check_heartbeats();
                continue;
            }
            Ok(NextMessage::Closed) => {
                debug!(identity = %binding.identity(), "push subscription closed");
                break;
            }
            Err(JetstreamSubscriptionError::Server(err)) => {
                warn!(identity = %binding.identity(), error = %err, "push subscription error");
                if is_fatal(&err) {
                    break;
                }
                continue;
            }
            Err(err) => {
                warn!(identity = %binding.identity(), error = %err, "push subscription error");
                continue;
            }
        };

        trace!(subject = %message.subject(), "handling push message");
        let Some(kind) = handler(&message) else {
            continue;
        };
        match message.acknowledge(kind).await {
            Ok(()) => {}
            Err(AckError::NoReplySubject) => {
                debug!(subject = %message.subject(), "message can't be acknowledged");
            }
            Err(err) => {
                warn!(
                    subject = %message.subject(),
                    error = %err,
                    "unable to acknowledge message"
                );
            }
        }
    }
}

// nothing will ever be delivered once the subscription itself was refused
fn is_fatal(err: &ServerError) -> bool {
    matches!(err, ServerError::SubscribePermissionViolation)
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use bytes::Bytes;
    use claims::{assert_matches, assert_ok};
    use kiwano_proto::{Subject, SubscriptionId};
    use tokio::time::sleep;

    use super::{AutoAck, HandlerError, PushSubscription};
    use crate::{
        client::{
            ClientCommand,
            jetstream::{
                ConsumerConfig, DeliveryMode, JetstreamClient, JetstreamMessage,
                JetstreamSubscription, PushError, SubscribeOptions,
                tests::{FrameSender, data_frame, expect_subscribe, status_frame},
            },
            tests::test_client,
        },
        core::ClientCommands,
    };

    const ACK_SUBJECT: &str = "$JS.ACK.ORDERS.processor.1.1.1.0.0";

    async fn push_subscription(
        auto_ack: AutoAck,
        fail_on: &'static [u8],
    ) -> (
        PushSubscription,
        Arc<Mutex<Vec<Bytes>>>,
        ClientCommands,
        SubscriptionId,
        FrameSender,
    ) {
        let (client, mut commands) = test_client();
        let binding = assert_ok!(
            JetstreamSubscription::bind(
                JetstreamClient::new(client),
                Subject::from_static("deliver.orders"),
                None,
                ConsumerConfig::default(),
                SubscribeOptions::new().stream("ORDERS").consumer("processor"),
                None,
                DeliveryMode::Push,
            )
            .await
        );
        let (id, _subject, messages) = expect_subscribe(&mut commands).await;

        let handled = Arc::new(Mutex::new(Vec::new()));
        let push = PushSubscription::new(
            binding,
            {
                let handled = Arc::clone(&handled);
                move |message: &JetstreamMessage| -> Result<(), HandlerError> {
                    handled.lock().unwrap().push(message.payload().clone());
                    if message.payload() == fail_on {
                        return Err("handler failure".into());
                    }
                    Ok(())
                }
            },
            auto_ack,
        );
        (push, handled, commands, id, messages)
    }

    #[test]
    fn auto_ack_from_bool() {
        assert_eq!(AutoAck::from(true), AutoAck::Always);
        assert_eq!(AutoAck::from(false), AutoAck::Disabled);
    }

    #[tokio::test]
    async fn always_acks_once_per_message() {
        let (push, handled, mut commands, id, messages) =
            push_subscription(AutoAck::Always, b"2").await;
        assert_eq!(push.auto_ack(), AutoAck::Always);

        for payload in [&b"1"[..], b"2", b"3"] {
            messages
                .send(Ok(data_frame("orders.new", Some(ACK_SUBJECT), payload)))
                .await
                .unwrap();
        }
        drop(messages);

        for _ in 0..3 {
            assert_matches!(
                commands.recv().await,
                Some(ClientCommand::Publish { message })
                    if message.subject.as_str() == ACK_SUBJECT && message.payload == b"+ACK"[..]
            );
        }
        assert_matches!(
            commands.recv().await,
            Some(ClientCommand::Unsubscribe { id: unsubscribe_id, .. }) if unsubscribe_id == id
        );
        assert_eq!(*handled.lock().unwrap(), ["1", "2", "3"]);
        push.close().await;
    }

    #[tokio::test]
    async fn disabled_never_acks() {
        let (push, handled, mut commands, id, messages) =
            push_subscription(AutoAck::Disabled, b"2").await;

        for payload in [&b"1"[..], b"2"] {
            messages
                .send(Ok(data_frame("orders.new", Some(ACK_SUBJECT), payload)))
                .await
                .unwrap();
        }
        drop(messages);

        // the first command after the messages is the unsubscribe sent by the binding
        assert_matches!(
            commands.recv().await,
            Some(ClientCommand::Unsubscribe { id: unsubscribe_id, .. }) if unsubscribe_id == id
        );
        assert_eq!(*handled.lock().unwrap(), ["1", "2"]);
        push.close().await;
    }

    #[tokio::test]
    async fn on_success_naks_failures() {
        let (_push, handled, mut commands, _id, messages) =
            push_subscription(AutoAck::OnSuccess, b"2").await;

        for payload in [&b"1"[..], b"2", b"3"] {
            messages
                .send(Ok(data_frame("orders.new", Some(ACK_SUBJECT), payload)))
                .await
                .unwrap();
        }

        for expected in [&b"+ACK"[..], b"-NAK", b"+ACK"] {
            assert_matches!(
                commands.recv().await,
                Some(ClientCommand::Publish { message }) if message.payload == expected
            );
        }
        assert_eq!(handled.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn control_frames_never_reach_handler() {
        let (_push, handled, mut commands, _id, messages) =
            push_subscription(AutoAck::Always, b"").await;

        messages.send(Ok(status_frame(100, None))).await.unwrap();
        messages
            .send(Ok(status_frame(100, Some("$JS.FC.ORDERS.abc.1"))))
            .await
            .unwrap();
        messages
            .send(Ok(data_frame("orders.new", Some(ACK_SUBJECT), b"1")))
            .await
            .unwrap();

        assert_matches!(
            commands.recv().await,
            Some(ClientCommand::Publish { message })
                if message.subject.as_str() == "$JS.FC.ORDERS.abc.1" && message.payload.is_empty()
        );
        assert_matches!(
            commands.recv().await,
            Some(ClientCommand::Publish { message }) if message.subject.as_str() == ACK_SUBJECT
        );
        assert_eq!(*handled.lock().unwrap(), ["1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn missed_heartbeats_are_reported() {
        let (client, mut commands) = test_client();
        let reported = Arc::new(Mutex::new(Vec::new()));
        let context = JetstreamClient::new(client).error_callback({
            let reported = Arc::clone(&reported);
            move |err: &PushError| {
                if let PushError::MissedHeartbeats { idle_for, .. } = err {
                    reported.lock().unwrap().push(*idle_for);
                }
            }
        });
        let config = ConsumerConfig {
            idle_heartbeat: Some(Duration::from_secs(1)),
            ..ConsumerConfig::default()
        };
        let binding = assert_ok!(
            JetstreamSubscription::bind(
                context,
                Subject::from_static("deliver.orders"),
                None,
                config,
                SubscribeOptions::new().stream("ORDERS").consumer("processor"),
                None,
                DeliveryMode::Push,
            )
            .await
        );
        let (_id, _subject, messages) = expect_subscribe(&mut commands).await;
        let push = PushSubscription::new(binding, |_: &JetstreamMessage| Ok(()), AutoAck::Always);

        // three silent intervals are tolerated
        sleep(Duration::from_millis(3500)).await;
        assert!(reported.lock().unwrap().is_empty());
        sleep(Duration::from_secs(1)).await;
        assert_eq!(reported.lock().unwrap().len(), 1);
        assert!(reported.lock().unwrap()[0] > Duration::from_secs(3));

        // reported once until the consumer is heard from again
        sleep(Duration::from_secs(4)).await;
        assert_eq!(reported.lock().unwrap().len(), 1);

        messages.send(Ok(status_frame(100, None))).await.unwrap();
        sleep(Duration::from_secs(5)).await;
        assert_eq!(reported.lock().unwrap().len(), 2);
        assert!(!push.is_finished());

        push.close().await;
    }

    #[tokio::test]
    async fn close_stops_dispatch() {
        let (push, handled, mut commands, id, messages) =
            push_subscription(AutoAck::Always, b"").await;

        push.close().await;
        assert_matches!(
            commands.recv().await,
            Some(ClientCommand::Unsubscribe { id: unsubscribe_id, .. }) if unsubscribe_id == id
        );
        assert!(messages.is_closed());
        assert!(handled.lock().unwrap().is_empty());
    }
}
