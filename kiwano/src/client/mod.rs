use std::{
    fmt::Write,
    num::NonZero,
    process::abort,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use kiwano_proto::{
    MessageBase, QueueGroup, ServerMessage, Subject, SubscriptionId, error::ServerError,
};
use tokio::sync::{
    mpsc::{self, Permit, error::TrySendError},
    oneshot,
};
use tracing::debug;

pub use self::builder::ClientBuilder;
pub use self::commands::{ClientPublish, ClientRequest, ResponseError, ResponseFut};
use crate::subscription::Subscription;

mod builder;
mod commands;
pub(crate) mod jetstream;

#[cfg(feature = "from-env")]
mod from_env;

const CLIENT_OP_CHANNEL_SIZE: usize = 512;
const SUBSCRIPTION_CHANNEL_SIZE: usize = 256;

/// The receiving half of the [`Client`] command channel
///
/// Whatever owns this receiver is the connection: it writes the commands
/// to the wire and routes incoming messages into the subscription senders
/// it was handed. Dropping it closes the client and every subscription.
pub type ClientCommands = mpsc::Receiver<ClientCommand>;

/// A NATS client
///
/// `Client` is a `Clone`able handle to a NATS connection. The connection
/// itself lives on the other side of the [`ClientCommands`] channel returned
/// by [`ClientBuilder::build`].
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    sender: mpsc::Sender<ClientCommand>,
    next_subscription_id: AtomicU64,
    inbox_prefix: Subject,
    default_response_timeout: Duration,
    subscription_buffer: usize,
}

/// A command sent by a [`Client`] to the connection
#[derive(Debug)]
pub enum ClientCommand {
    /// Publish a message
    Publish { message: MessageBase },
    /// Publish a message and deliver the first reply to `reply`
    ///
    /// `message.reply_subject` is always set to a fresh inbox subject.
    Request {
        message: MessageBase,
        reply: oneshot::Sender<ServerMessage>,
    },
    /// Subscribe to `subject`, delivering messages to `messages`
    Subscribe {
        id: SubscriptionId,
        subject: Subject,
        queue_group: Option<QueueGroup>,
        messages: mpsc::Sender<Result<ServerMessage, ServerError>>,
    },
    /// Unsubscribe, either immediately or after `max_messages` more messages
    Unsubscribe {
        id: SubscriptionId,
        max_messages: Option<NonZero<u64>>,
    },
}

/// An error encountered while trying to publish a command to a closed [`Client`]
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
#[error("client closed")]
pub struct ClientClosedError;

#[derive(Debug, thiserror::Error)]
#[error("try command error")]
pub enum TryCommandError {
    /// The client's internal buffer is currently full
    #[error("buffer full")]
    BufferFull,
    /// The connection side of the client has been dropped
    #[error("client closed")]
    Closed(#[source] ClientClosedError),
}

impl Client {
    /// Construct a new client
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub(super) fn from_builder(builder: ClientBuilder) -> (Self, ClientCommands) {
        let (sender, receiver) = mpsc::channel(builder.command_buffer);

        let this = Self {
            inner: Arc::new(ClientInner {
                sender,
                next_subscription_id: AtomicU64::new(u64::from(SubscriptionId::MIN)),
                inbox_prefix: builder.inbox_prefix,
                default_response_timeout: builder.default_response_timeout,
                subscription_buffer: builder.subscription_buffer,
            }),
        };
        (this, receiver)
    }

    /// Publish a new message to the NATS server
    #[must_use]
    pub fn publish(&self, subject: Subject) -> ClientPublish<'_> {
        ClientPublish::build(self, subject)
    }

    /// Publish a new request to the NATS server and wait for the response
    #[must_use]
    pub fn request(&self, subject: Subject) -> ClientRequest<'_> {
        ClientRequest::build(self, subject)
    }

    /// Subscribe to the given filter subject
    ///
    /// If `queue_group` is provided and multiple clients subscribe with
    /// the same [`QueueGroup`] value, the NATS server will try to deliver
    /// these messages to only one of the clients.
    ///
    /// # Errors
    ///
    /// This returns an error if the connection with the client is closed.
    pub async fn subscribe(
        &self,
        filter_subject: Subject,
        queue_group: Option<QueueGroup>,
    ) -> Result<Subscription, ClientClosedError> {
        self.subscribe_with_capacity(filter_subject, queue_group, None)
            .await
    }

    pub(crate) async fn subscribe_with_capacity(
        &self,
        filter_subject: Subject,
        queue_group: Option<QueueGroup>,
        capacity: Option<NonZero<usize>>,
    ) -> Result<Subscription, ClientClosedError> {
        let permit = self
            .inner
            .sender
            .reserve()
            .await
            .map_err(|_| ClientClosedError)?;

        let capacity = capacity.map_or(self.inner.subscription_buffer, NonZero::get);
        Ok(self.do_subscribe(permit, filter_subject, queue_group, capacity))
    }

    fn do_subscribe(
        &self,
        permit: Permit<'_, ClientCommand>,
        filter_subject: Subject,
        queue_group: Option<QueueGroup>,
        capacity: usize,
    ) -> Subscription {
        let id = self
            .inner
            .next_subscription_id
            .fetch_add(1, Ordering::AcqRel)
            .into();
        if id == SubscriptionId::MAX {
            abort();
        }
        let (sender, receiver) = mpsc::channel(capacity);

        permit.send(ClientCommand::Subscribe {
            id,
            subject: filter_subject.clone(),
            queue_group: queue_group.clone(),
            messages: sender,
        });
        Subscription::new(id, filter_subject, queue_group, self.clone(), receiver)
    }

    pub(crate) fn create_inbox_subject(&self) -> Subject {
        create_inbox_subject(&self.inner.inbox_prefix)
    }

    pub(crate) fn default_response_timeout(&self) -> Duration {
        self.inner.default_response_timeout
    }

    pub(crate) async fn unsubscribe(
        &self,
        id: SubscriptionId,
        max_messages: Option<NonZero<u64>>,
    ) -> Result<(), ClientClosedError> {
        self.enqueue_command(ClientCommand::Unsubscribe { id, max_messages })
            .await
    }

    pub(crate) fn lazy_unsubscribe(&self, id: SubscriptionId, max_messages: Option<NonZero<u64>>) {
        let cmd = ClientCommand::Unsubscribe { id, max_messages };
        if let Err(err) = self.try_enqueue_command(cmd) {
            debug!(subscription_id = %id, error = %err, "unable to unsubscribe");
        }
    }

    pub(crate) async fn enqueue_command(
        &self,
        cmd: ClientCommand,
    ) -> Result<(), ClientClosedError> {
        self.inner
            .sender
            .send(cmd)
            .await
            .map_err(|_| ClientClosedError)
    }

    pub(crate) fn try_enqueue_command(&self, cmd: ClientCommand) -> Result<(), TryCommandError> {
        self.inner
            .sender
            .try_send(cmd)
            .map_err(TryCommandError::from_try_send_error)
    }

    /// Whether the connection side of this client has gone away
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.sender.is_closed()
    }
}

impl TryCommandError {
    #[expect(
        clippy::needless_pass_by_value,
        reason = "this is an auxiliary conversion function"
    )]
    pub(crate) fn from_try_send_error<T>(err: TrySendError<T>) -> Self {
        match err {
            TrySendError::Full(_) => Self::BufferFull,
            TrySendError::Closed(_) => Self::Closed(ClientClosedError),
        }
    }
}

pub(crate) fn create_inbox_subject(prefix: &Subject) -> Subject {
    let mut suffix = [0u8; 16];
    rand::fill(&mut suffix);

    let mut subject = String::with_capacity(prefix.len() + ".".len() + (suffix.len() * 2));
    let _ = write!(&mut subject, "{}.{:x}", prefix, u128::from_ne_bytes(suffix));

    Subject::from_dangerous_value(subject.into())
}
