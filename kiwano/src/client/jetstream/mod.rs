use std::{
    fmt::{self, Display},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use kiwano_proto::{QueueGroup, StatusCode, Subject, error::SubjectValidateError};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::debug;

pub use self::api::{
    ApiErrorMode, ApiResponse, CreateConsumerRequest, JetstreamRequest, PullRequest,
    StreamInfoRequest, SuccessResponse,
};
pub use self::manager::{
    MessageManager, PullManager, PushError, PushManager, StatusError, SubscriptionIdentity,
};
pub use self::message::{AckError, AckKind, JetstreamMessage, MessageMetadata, MetadataError};
pub use self::push::{AutoAck, HandlerError, PushSubscription};
pub use self::resources::{
    AckPolicy, Consumer, ConsumerConfig, DeliverPolicy, ReplayPolicy, RetentionPolicy,
    SequenceInfo, Storage, Stream, StreamConfig, StreamState,
};
pub use self::subscription::{
    DeliveryMode, JetstreamSubscription, JetstreamSubscriptionError, NextMessage,
    SubscribeOptions,
};
#[cfg(feature = "from-env")]
use super::from_env::JetstreamFromEnv;
use super::{ClientClosedError, ResponseError};
use crate::core::Client;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

mod api;
mod manager;
mod message;
mod push;
mod resources;
mod subscription;

/// A NATS Jetstream client
///
/// `JetstreamClient` is a `Clone`able handle to a NATS [`Client`],
/// with Jetstream specific configurations. It is the context every
/// [`JetstreamSubscription`] is bound to.
#[derive(Debug, Clone)]
pub struct JetstreamClient {
    client: Client,
    prefix: Subject,
    request_timeout: Duration,
    error_callback: Option<ErrorCallback>,
}

/// A callback notified of the errors hit by push subscriptions
///
/// Push subscriptions have no caller waiting on them, so unexpected
/// status frames and missed heartbeats are reported here instead of
/// being returned.
#[derive(Clone)]
pub struct ErrorCallback(Arc<dyn Fn(&PushError) + Send + Sync>);

/// A Jetstream API error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("jetstream error status={status} code={code} description={description}")]
pub struct JetstreamApiError {
    #[serde(rename = "code")]
    status: StatusCode,
    #[serde(rename = "err_code")]
    code: JetstreamErrorCode,
    description: String,
}

/// The type of error encountered while processing a Jetstream request
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JetstreamErrorCode(u16);

/// An error encountered while making a Jetstream request
#[derive(Debug, thiserror::Error)]
pub enum JetstreamError {
    #[error("invalid subject")]
    Subject(#[source] SubjectValidateError),
    #[error("client closed")]
    ClientClosed(#[source] ClientClosedError),
    #[error("client request failure")]
    ResponseError(#[source] ResponseError),
    #[error("JSON deserialization")]
    Json(#[source] serde_json::Error),
    #[error("bad response code")]
    Api(#[source] JetstreamApiError),
    #[error("consumer {consumer} not found on stream {stream}")]
    ConsumerNotFound { stream: String, consumer: String },
    #[error("invalid consumer configuration: {0}")]
    InvalidConfig(&'static str),
}

impl JetstreamClient {
    /// Create a Jetstream client using the default configuration
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self::new_with_prefix(client, Subject::from_static("$JS.API"))
    }

    /// Create a Jetstream client using the provided `domain`
    ///
    /// # Errors
    ///
    /// It returns an error if the subject derived by the `domain` is not valid.
    pub fn new_with_domain(
        client: Client,
        domain: impl Display,
    ) -> Result<Self, SubjectValidateError> {
        let prefix = format!("$JS.{domain}.API").try_into()?;
        Ok(Self::new_with_prefix(client, prefix))
    }

    /// Create a Jetstream client using the provided API `prefix`
    #[must_use]
    pub fn new_with_prefix(client: Client, prefix: Subject) -> Self {
        Self {
            client,
            prefix,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            error_callback: None,
        }
    }

    /// Create a Jetstream client configured from environment variables
    ///
    /// Reads `NATS_JS_API_PREFIX`, falling back to `NATS_JS_DOMAIN`, and
    /// `NATS_JS_REQUEST_TIMEOUT_MS`.
    ///
    /// # Errors
    ///
    /// It returns an error if the subject derived by the domain is not valid.
    ///
    /// # Panics
    ///
    /// It panics if the environment variables can't be read or deserialized.
    #[cfg(feature = "from-env")]
    pub fn from_env(client: Client) -> Result<Self, SubjectValidateError> {
        let env = envy::prefixed("NATS_")
            .from_env::<JetstreamFromEnv>()
            .expect("JetstreamFromEnv deserialization error");

        let mut this = match (env.js_api_prefix, env.js_domain) {
            (Some(prefix), _) => Self::new_with_prefix(client, prefix),
            (None, Some(domain)) => Self::new_with_domain(client, domain)?,
            (None, None) => Self::new(client),
        };
        if let Some(request_timeout_ms) = env.js_request_timeout_ms {
            this = this.request_timeout(Duration::from_millis(request_timeout_ms));
        }
        Ok(this)
    }

    /// Define how long to wait for JetStream API responses
    ///
    /// Default: 2 seconds
    #[must_use]
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Define the callback notified of the errors hit by push subscriptions
    ///
    /// Without a callback the errors are only logged.
    #[must_use]
    pub fn error_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&PushError) + Send + Sync + 'static,
    {
        self.error_callback = Some(ErrorCallback::new(callback));
        self
    }

    /// Obtain information about a stream present within this client's Jetstream context
    ///
    /// # Errors
    ///
    /// It returns an error if the given `name` produces an invalid subject or if an error occurs
    /// while querying the stream.
    pub async fn stream_info(
        &self,
        name: impl Display,
        request: &StreamInfoRequest,
    ) -> Result<Option<Stream>, JetstreamError> {
        let subject = format!("{}.STREAM.INFO.{}", self.prefix, name)
            .try_into()
            .map_err(JetstreamError::Subject)?;

        let payload = request.to_bytes().map_err(JetstreamError::Json)?;
        let response = self.api_request::<Stream>(subject, payload).await?;
        match response.into_result() {
            Ok(stream) => Ok(Some(stream)),
            Err(error) if error.code == JetstreamErrorCode::STREAM_NOT_FOUND => Ok(None),
            Err(error) => Err(JetstreamError::Api(error)),
        }
    }

    /// Obtain a consumer present within this client's Jetstream context
    ///
    /// # Errors
    ///
    /// It returns an error if the given `stream_name` and `consumer_name` produce an invalid
    /// subject or if an error occurs while querying the consumer.
    pub async fn consumer_info(
        &self,
        stream_name: impl Display,
        consumer_name: impl Display,
    ) -> Result<Option<Consumer>, JetstreamError> {
        let subject = format!(
            "{}.CONSUMER.INFO.{}.{}",
            self.prefix, stream_name, consumer_name
        )
        .try_into()
        .map_err(JetstreamError::Subject)?;

        let response = self.api_request::<Consumer>(subject, Bytes::new()).await?;
        match response.into_result() {
            Ok(consumer) => Ok(Some(consumer)),
            Err(error) if error.code == JetstreamErrorCode::CONSUMER_NOT_FOUND => Ok(None),
            Err(error) => Err(JetstreamError::Api(error)),
        }
    }

    /// Create a new consumer
    ///
    /// # Errors
    ///
    /// It returns an error if the given `stream_name` or consumer name produces an invalid subject
    /// or if an error occurs while creating the consumer.
    pub async fn create_consumer(
        &self,
        stream_name: &str,
        config: &ConsumerConfig,
    ) -> Result<Consumer, JetstreamError> {
        let mut subject = format!("{}.CONSUMER.CREATE.{}", self.prefix, stream_name);
        if let Some(name) = config.name.as_ref().or(config.durable_name.as_ref()) {
            subject.push('.');
            subject.push_str(name);
        }
        let subject = subject.try_into().map_err(JetstreamError::Subject)?;

        let payload = CreateConsumerRequest::new(stream_name, config)
            .to_bytes()
            .map_err(JetstreamError::Json)?;
        let response = self.api_request::<Consumer>(subject, payload).await?;
        response.into_result().map_err(JetstreamError::Api)
    }

    /// Bind a new pull subscription to a consumer of `stream_name`
    ///
    /// With [`SubscribeOptions::bind`] the consumer must already exist,
    /// otherwise it's created from `config`.
    ///
    /// # Errors
    ///
    /// It returns an error if the configuration isn't valid for a pull consumer,
    /// if the consumer can't be looked up or created or if the client is closed.
    pub async fn pull_subscribe(
        &self,
        stream_name: &str,
        config: ConsumerConfig,
        options: SubscribeOptions,
    ) -> Result<JetstreamSubscription, JetstreamError> {
        if config.deliver_subject.is_some() {
            return Err(JetstreamError::InvalidConfig(
                "pull consumers can't have a deliver subject",
            ));
        }
        options.validate(&config)?;

        let consumer = self.bind_consumer(stream_name, &config, &options).await?;
        let inbox = self.client.create_inbox_subject();
        JetstreamSubscription::bind(
            self.clone(),
            inbox,
            None,
            config,
            options.stream(stream_name).consumer(consumer.name.clone()),
            Some(consumer),
            DeliveryMode::Pull,
        )
        .await
        .map_err(JetstreamError::ClientClosed)
    }

    /// Bind a new push subscription to a consumer of `stream_name`
    ///
    /// Every data message is handed to `handler`. `auto_ack` decides whether
    /// and how messages get acknowledged once the handler returns.
    ///
    /// # Errors
    ///
    /// It returns an error if the consumer can't be looked up or created or
    /// if the client is closed.
    pub async fn push_subscribe<F>(
        &self,
        stream_name: &str,
        mut config: ConsumerConfig,
        options: SubscribeOptions,
        queue_group: Option<QueueGroup>,
        handler: F,
        auto_ack: impl Into<AutoAck>,
    ) -> Result<PushSubscription, JetstreamError>
    where
        F: FnMut(&JetstreamMessage) -> Result<(), HandlerError> + Send + 'static,
    {
        options.validate(&config)?;
        let deliver_subject = match &config.deliver_subject {
            Some(deliver_subject) => deliver_subject.clone(),
            None => {
                let inbox = self.client.create_inbox_subject();
                config.deliver_subject = Some(inbox.clone());
                inbox
            }
        };
        if let Some(queue_group) = &queue_group {
            config.deliver_group = Some(queue_group.to_string());
        }

        let consumer = self.bind_consumer(stream_name, &config, &options).await?;
        let binding = JetstreamSubscription::bind(
            self.clone(),
            deliver_subject,
            queue_group,
            config,
            options.stream(stream_name).consumer(consumer.name.clone()),
            Some(consumer),
            DeliveryMode::Push,
        )
        .await
        .map_err(JetstreamError::ClientClosed)?;
        Ok(PushSubscription::new(binding, handler, auto_ack.into()))
    }

    async fn bind_consumer(
        &self,
        stream_name: &str,
        config: &ConsumerConfig,
        options: &SubscribeOptions,
    ) -> Result<Consumer, JetstreamError> {
        if !options.is_bind() {
            return self.create_consumer(stream_name, config).await;
        }

        let consumer_name = options
            .consumer_name()
            .or(config.durable_name.as_deref())
            .or(config.name.as_deref())
            .ok_or(JetstreamError::InvalidConfig("binding requires a consumer name"))?;
        debug!(
            stream = stream_name,
            consumer = consumer_name,
            "binding to existing consumer"
        );
        self.consumer_info(stream_name, consumer_name)
            .await?
            .ok_or_else(|| JetstreamError::ConsumerNotFound {
                stream: stream_name.to_owned(),
                consumer: consumer_name.to_owned(),
            })
    }

    async fn api_request<T: DeserializeOwned>(
        &self,
        subject: Subject,
        payload: Bytes,
    ) -> Result<ApiResponse<T>, JetstreamError> {
        let resp = self
            .client
            .request(subject)
            .response_timeout(self.request_timeout)
            .payload(payload)
            .await
            .map_err(JetstreamError::ClientClosed)?;
        let resp = resp.await.map_err(JetstreamError::ResponseError)?;

        ApiResponse::from_slice(&resp.base.payload, ApiErrorMode::Return)
    }

    pub(crate) fn subject_for_request(
        &self,
        endpoint: &str,
    ) -> Result<Subject, SubjectValidateError> {
        format!("{}.{}", self.prefix, endpoint).try_into()
    }

    pub(crate) fn error_callback_ref(&self) -> Option<&ErrorCallback> {
        self.error_callback.as_ref()
    }

    /// Get a reference to the inner NATS Core client
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    #[must_use]
    pub fn prefix(&self) -> &Subject {
        &self.prefix
    }
}

impl ErrorCallback {
    pub(crate) fn new<F>(callback: F) -> Self
    where
        F: Fn(&PushError) + Send + Sync + 'static,
    {
        Self(Arc::new(callback))
    }

    pub(crate) fn notify(&self, error: &PushError) {
        (self.0)(error);
    }
}

impl fmt::Debug for ErrorCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorCallback").finish_non_exhaustive()
    }
}

impl JetstreamApiError {
    /// The status code of the response
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The JetStream specific error code
    #[must_use]
    pub fn code(&self) -> JetstreamErrorCode {
        self.code
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }
}

impl JetstreamErrorCode {
    pub const NOT_ENABLED: Self = Self(10076);
    pub const NOT_ENABLED_FOR_ACCOUNT: Self = Self(10039);
    pub const BAD_REQUEST: Self = Self(10003);

    pub const STREAM_NOT_FOUND: Self = Self(10059);

    pub const COULD_NOT_CREATE_CONSUMER: Self = Self(10012);
    pub const CONSUMER_NOT_FOUND: Self = Self(10014);
    pub const CONSUMER_NAME_IN_USE: Self = Self(10148);
}

impl Display for JetstreamErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl From<u16> for JetstreamErrorCode {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<JetstreamErrorCode> for u16 {
    fn from(value: JetstreamErrorCode) -> Self {
        value.0
    }
}
