use std::time::Duration;

use kiwano_proto::Subject;

#[cfg(feature = "from-env")]
use super::from_env::FromEnv;
use super::{CLIENT_OP_CHANNEL_SIZE, ClientCommands, SUBSCRIPTION_CHANNEL_SIZE};
use crate::core::Client;

/// A builder for [`Client`]
///
/// Obtained from [`Client::builder`].
#[derive(Debug)]
pub struct ClientBuilder {
    pub(crate) inbox_prefix: Subject,
    pub(crate) default_response_timeout: Duration,
    pub(crate) command_buffer: usize,
    pub(crate) subscription_buffer: usize,
}

impl ClientBuilder {
    pub(super) fn new() -> Self {
        Self {
            inbox_prefix: Subject::from_static("_INBOX"),
            default_response_timeout: Duration::from_secs(5),
            command_buffer: CLIENT_OP_CHANNEL_SIZE,
            subscription_buffer: SUBSCRIPTION_CHANNEL_SIZE,
        }
    }

    /// Construct [`ClientBuilder`] from environment variables
    ///
    /// Reads the following environment variables into [`ClientBuilder`]:
    ///
    /// * `NATS_INBOX_PREFIX`: the inbox prefix
    /// * `NATS_RESPONSE_TIMEOUT_MS`: the default response timeout, in milliseconds
    ///
    /// # Panics
    ///
    /// It panics if the environment variables can't be read or deserialized.
    #[cfg(feature = "from-env")]
    #[must_use]
    pub fn from_env() -> Self {
        let env = envy::prefixed("NATS_")
            .from_env::<FromEnv>()
            .expect("FromEnv deserialization error");

        let mut this = Self::new();
        if let Some(inbox_prefix) = env.inbox_prefix {
            this = this.inbox_prefix(inbox_prefix);
        }
        if let Some(response_timeout_ms) = env.response_timeout_ms {
            this = this.default_response_timeout(Duration::from_millis(response_timeout_ms));
        }
        this
    }

    /// Configure the inbox prefix to which replies from the NATS server will be received
    ///
    /// Default: `_INBOX`
    #[must_use]
    pub fn inbox_prefix(mut self, inbox_prefix: Subject) -> Self {
        self.inbox_prefix = inbox_prefix;
        self
    }

    /// The default timeout for [`ResponseFut`]
    ///
    /// Default: 5 seconds.
    ///
    /// [`ResponseFut`]: crate::core::ResponseFut
    #[must_use]
    pub fn default_response_timeout(mut self, timeout: Duration) -> Self {
        self.default_response_timeout = timeout;
        self
    }

    /// The number of commands that can be buffered before the connection picks them up
    ///
    /// Default: 512
    #[must_use]
    pub fn command_buffer(mut self, command_buffer: usize) -> Self {
        self.command_buffer = command_buffer.max(1);
        self
    }

    /// The number of messages each subscription buffers before the connection
    /// has to wait for it to be read
    ///
    /// Default: 256
    #[must_use]
    pub fn subscription_buffer(mut self, subscription_buffer: usize) -> Self {
        self.subscription_buffer = subscription_buffer.max(1);
        self
    }

    /// Creates a new [`Client`] together with the command channel the
    /// connection has to drive.
    #[must_use]
    pub fn build(self) -> (Client, ClientCommands) {
        Client::from_builder(self)
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
