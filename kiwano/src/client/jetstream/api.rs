//! JetStream control plane requests and responses
//!
//! Requests are flat JSON objects with fixed field names. Responses share
//! a common envelope: an error response carries an `error` object, anything
//! else is a success response whose fields depend on the request.

use std::{num::NonZero, time::Duration};

use bytes::Bytes;
use kiwano_proto::Subject;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use super::{
    JetstreamApiError, JetstreamError,
    resources::{ConsumerConfig, nanos_option},
};

/// A JetStream API request body
pub trait JetstreamRequest: Serialize {
    /// Render the request into its canonical JSON representation
    ///
    /// # Errors
    ///
    /// It returns an error if the request can't be represented as JSON.
    fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    /// Render the request into a JSON string, for diagnostics
    ///
    /// # Errors
    ///
    /// It returns an error if the request can't be represented as JSON.
    fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// The body of a stream info request
///
/// The subjects filter asks the server to report per-subject message
/// counts for the subjects matching it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfoRequest {
    subjects_filter: Subject,
}

/// The body of a pull request, asking a pull consumer for more messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    batch: NonZero<usize>,
    /// How long the server keeps the request open
    #[serde(
        default,
        with = "nanos_option",
        skip_serializing_if = "Option::is_none"
    )]
    expires: Option<Duration>,
    /// Have the server reply with a `404` instead of waiting when
    /// no messages are pending
    #[serde(default, skip_serializing_if = "is_false")]
    no_wait: bool,
}

/// The body of a consumer create request
#[derive(Debug, Serialize)]
pub struct CreateConsumerRequest<'a> {
    stream_name: &'a str,
    config: &'a ConsumerConfig,
    action: &'static str,
}

/// Whether an error envelope is raised or returned
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ApiErrorMode {
    /// Turn an error envelope into [`JetstreamError::Api`]
    #[default]
    Raise,
    /// Return an error envelope as an [`ApiResponse`] for inspection
    Return,
}

/// A decoded JetStream API response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse<T> {
    response_type: Option<String>,
    result: Result<T, JetstreamApiError>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Envelope<T> {
    Error {
        #[serde(rename = "type", default)]
        response_type: Option<String>,
        error: JetstreamApiError,
    },
    Response {
        #[serde(rename = "type", default)]
        response_type: Option<String>,
        #[serde(flatten)]
        response: T,
    },
}

/// The response to requests which only acknowledge their execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

impl StreamInfoRequest {
    /// Request information about a stream, filtered by `subjects_filter`
    #[must_use]
    pub fn new(subjects_filter: Subject) -> Self {
        Self { subjects_filter }
    }

    /// Request information about a stream, matching every subject
    #[must_use]
    pub fn all() -> Self {
        Self::new(Subject::from_static(">"))
    }

    #[must_use]
    pub fn subjects_filter(&self) -> &Subject {
        &self.subjects_filter
    }
}

impl Default for StreamInfoRequest {
    fn default() -> Self {
        Self::all()
    }
}

impl JetstreamRequest for StreamInfoRequest {}

impl PullRequest {
    /// Request up to `batch` messages, waiting until the server's default expiry
    #[must_use]
    pub fn new(batch: NonZero<usize>) -> Self {
        Self {
            batch,
            expires: None,
            no_wait: false,
        }
    }

    /// Request up to `batch` messages, without waiting for new ones
    #[must_use]
    pub fn no_wait(batch: NonZero<usize>) -> Self {
        Self {
            no_wait: true,
            ..Self::new(batch)
        }
    }

    /// Request up to `batch` messages, keeping the request open for `expires`
    #[must_use]
    pub fn expires_in(batch: NonZero<usize>, expires: Duration) -> Self {
        Self {
            expires: Some(expires),
            ..Self::new(batch)
        }
    }

    #[must_use]
    pub fn batch(&self) -> NonZero<usize> {
        self.batch
    }

    #[must_use]
    pub fn expires(&self) -> Option<Duration> {
        self.expires
    }

    #[must_use]
    pub fn is_no_wait(&self) -> bool {
        self.no_wait
    }
}

impl JetstreamRequest for PullRequest {}

impl<'a> CreateConsumerRequest<'a> {
    #[must_use]
    pub fn new(stream_name: &'a str, config: &'a ConsumerConfig) -> Self {
        Self {
            stream_name,
            config,
            action: "create",
        }
    }
}

impl JetstreamRequest for CreateConsumerRequest<'_> {}

impl<T: DeserializeOwned> ApiResponse<T> {
    /// Decode a response from its raw JSON bytes
    ///
    /// # Errors
    ///
    /// It returns [`JetstreamError::Json`] if `payload` isn't a valid
    /// envelope and [`JetstreamError::Api`] if it is an error envelope
    /// and `mode` is [`ApiErrorMode::Raise`].
    pub fn from_slice(payload: &[u8], mode: ApiErrorMode) -> Result<Self, JetstreamError> {
        let envelope =
            serde_json::from_slice::<Envelope<T>>(payload).map_err(JetstreamError::Json)?;
        Self::from_envelope(envelope, mode)
    }

    /// Decode a response from its JSON text
    ///
    /// # Errors
    ///
    /// See [`ApiResponse::from_slice`].
    pub fn from_text(payload: &str, mode: ApiErrorMode) -> Result<Self, JetstreamError> {
        let envelope =
            serde_json::from_str::<Envelope<T>>(payload).map_err(JetstreamError::Json)?;
        Self::from_envelope(envelope, mode)
    }

    fn from_envelope(envelope: Envelope<T>, mode: ApiErrorMode) -> Result<Self, JetstreamError> {
        match (envelope, mode) {
            (Envelope::Error { error, .. }, ApiErrorMode::Raise) => Err(JetstreamError::Api(error)),
            (
                Envelope::Error {
                    response_type,
                    error,
                },
                ApiErrorMode::Return,
            ) => Ok(Self {
                response_type,
                result: Err(error),
            }),
            (
                Envelope::Response {
                    response_type,
                    response,
                },
                _,
            ) => Ok(Self {
                response_type,
                result: Ok(response),
            }),
        }
    }
}

impl<T> ApiResponse<T> {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// The `type` the server tagged the response with
    #[must_use]
    pub fn response_type(&self) -> Option<&str> {
        self.response_type.as_deref()
    }

    #[must_use]
    pub fn error(&self) -> Option<&JetstreamApiError> {
        self.result.as_ref().err()
    }

    #[must_use]
    pub fn response(&self) -> Option<&T> {
        self.result.as_ref().ok()
    }

    /// Turn this response into the success body or the API error
    ///
    /// # Errors
    ///
    /// It returns the API error carried by an error envelope.
    pub fn into_result(self) -> Result<T, JetstreamApiError> {
        self.result
    }
}

#[expect(
    clippy::trivially_copy_pass_by_ref,
    reason = "serde's skip_serializing_if passes a reference"
)]
fn is_false(val: &bool) -> bool {
    !*val
}
