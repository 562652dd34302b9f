use std::{
    fmt::{self, Display},
    sync::Arc,
    time::Duration,
};

use kiwano_proto::{
    QueueGroup, ServerMessage, Status, StatusCode, Subject, headers::CONSUMER_STALLED,
};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::ErrorCallback;
use crate::core::Client;

/// The number of idle heartbeat intervals after which a push consumer
/// is considered gone
const MISSED_HEARTBEATS_THRESHOLD: u32 = 3;

/// The statuses a pull request can legitimately be answered with
const PULL_STATUSES: [StatusCode; 3] = [
    StatusCode::NO_MESSAGES,
    StatusCode::REQUEST_TIMEOUT,
    StatusCode::CONFLICT,
];

/// The identity of a bound subscription, carried by protocol errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionIdentity {
    pub subject: Subject,
    pub queue_group: Option<QueueGroup>,
    pub stream: Option<String>,
    pub consumer: Option<String>,
}

/// A status frame the message manager didn't expect
///
/// This signals a mismatch between what the client asked for and
/// what the server is sending.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unexpected status {status} on {identity}")]
pub struct StatusError {
    identity: Arc<SubscriptionIdentity>,
    status: Status,
}

/// An error hit by a push subscription, reported to the [`ErrorCallback`]
#[derive(Debug, Clone, thiserror::Error)]
pub enum PushError {
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error("missed heartbeats on {identity}, idle for {idle_for:?}")]
    MissedHeartbeats {
        identity: Arc<SubscriptionIdentity>,
        idle_for: Duration,
    },
}

/// The per-subscription protocol state machine
///
/// Every frame received by a binding goes through [`MessageManager::manage`]
/// before it can reach the application.
#[derive(Debug)]
pub enum MessageManager {
    Pull(PullManager),
    Push(PushManager),
}

/// Status handling for pull subscriptions
///
/// Pull requests are answered with `404`, `408` or `409` when they can't
/// be fulfilled. Those are consumed; anything else is a protocol violation.
#[derive(Debug)]
pub struct PullManager {
    identity: Arc<SubscriptionIdentity>,
    consumed: u64,
}

/// Status handling for push subscriptions
///
/// Idle heartbeats and flow control requests keep the push consumer alive
/// and are consumed. Flow control requests get answered on the spot.
/// Unexpected statuses and missed heartbeats are reported to the
/// [`ErrorCallback`].
#[derive(Debug)]
pub struct PushManager {
    identity: Arc<SubscriptionIdentity>,
    client: Client,
    error_callback: Option<ErrorCallback>,
    last_activity: Instant,
    idle_reported: bool,
    heartbeats: u64,
    flow_control_responses: u64,
}

impl MessageManager {
    /// Classify `message`
    ///
    /// Returns `Ok(true)` if `message` was a control frame which has been fully
    /// handled and must not be delivered, `Ok(false)` if it's application data.
    ///
    /// # Errors
    ///
    /// A pull manager returns an error for status codes it doesn't expect.
    pub fn manage(&mut self, message: &ServerMessage) -> Result<bool, StatusError> {
        if let Self::Push(push) = self {
            push.touch();
        }

        let Some(status) = message.status.as_ref().filter(|_| message.has_status()) else {
            trace!(subject = %message.base.subject, "data message");
            return Ok(false);
        };

        match self {
            Self::Pull(pull) => pull.manage_status(status),
            Self::Push(push) => {
                push.manage_status(message, status);
                Ok(true)
            }
        }
    }

    #[must_use]
    pub fn identity(&self) -> &Arc<SubscriptionIdentity> {
        match self {
            Self::Pull(pull) => &pull.identity,
            Self::Push(push) => &push.identity,
        }
    }
}

impl PullManager {
    #[must_use]
    pub fn new(identity: Arc<SubscriptionIdentity>) -> Self {
        Self {
            identity,
            consumed: 0,
        }
    }

    /// The number of status frames consumed so far
    #[must_use]
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    fn manage_status(&mut self, status: &Status) -> Result<bool, StatusError> {
        if PULL_STATUSES.contains(&status.code) {
            self.consumed += 1;
            debug!(
                subject = %self.identity.subject,
                status = %status,
                "consumed pull status"
            );
            Ok(true)
        } else {
            warn!(
                subject = %self.identity.subject,
                status = %status,
                "unexpected pull status"
            );
            Err(StatusError::new(Arc::clone(&self.identity), status.clone()))
        }
    }
}

impl PushManager {
    #[must_use]
    pub fn new(
        identity: Arc<SubscriptionIdentity>,
        client: Client,
        error_callback: Option<ErrorCallback>,
    ) -> Self {
        Self {
            identity,
            client,
            error_callback,
            last_activity: Instant::now(),
            idle_reported: false,
            heartbeats: 0,
            flow_control_responses: 0,
        }
    }

    /// The number of idle heartbeats received so far
    #[must_use]
    pub fn heartbeats(&self) -> u64 {
        self.heartbeats
    }

    /// The number of flow control requests answered so far
    #[must_use]
    pub fn flow_control_responses(&self) -> u64 {
        self.flow_control_responses
    }

    /// How long since the last frame was received
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Whether enough heartbeats have been missed for the consumer to be considered gone
    #[must_use]
    pub fn is_idle(&self, idle_heartbeat: Duration) -> bool {
        idle_heartbeat
            .checked_mul(MISSED_HEARTBEATS_THRESHOLD)
            .is_some_and(|limit| self.idle_for() > limit)
    }

    /// Report missed heartbeats if the consumer has gone idle
    ///
    /// A silent period is reported once. Returns whether it was reported by this call.
    pub fn check_heartbeats(&mut self, idle_heartbeat: Duration) -> bool {
        if self.idle_reported || !self.is_idle(idle_heartbeat) {
            return false;
        }

        self.idle_reported = true;
        self.report(&PushError::MissedHeartbeats {
            identity: Arc::clone(&self.identity),
            idle_for: self.idle_for(),
        });
        true
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.idle_reported = false;
    }

    fn report(&self, err: &PushError) {
        match &self.error_callback {
            Some(error_callback) => error_callback.notify(err),
            None => warn!(error = %err, "push subscription error"),
        }
    }

    fn manage_status(&mut self, message: &ServerMessage, status: &Status) {
        if status.code != StatusCode::IDLE_HEARTBEAT {
            let err = StatusError::new(Arc::clone(&self.identity), status.clone());
            self.report(&PushError::Status(err));
            return;
        }

        if let Some(reply_subject) = &message.base.reply_subject {
            // flow control request
            self.respond_flow_control(reply_subject.clone());
        } else {
            self.heartbeats += 1;
            trace!(subject = %self.identity.subject, "idle heartbeat");

            // a heartbeat sent while the consumer is stalled carries the
            // flow control subject the server is still waiting on
            if let Some(stalled) = message.base.headers.get(&CONSUMER_STALLED) {
                match Subject::try_from(stalled.as_str()) {
                    Ok(stalled) => self.respond_flow_control(stalled),
                    Err(err) => {
                        warn!(error = %err, "invalid consumer stalled subject");
                    }
                }
            }
        }
    }

    fn respond_flow_control(&mut self, reply_subject: Subject) {
        match self.client.publish(reply_subject).try_send() {
            Ok(()) => {
                self.flow_control_responses += 1;
                debug!(subject = %self.identity.subject, "answered flow control request");
            }
            Err(err) => {
                warn!(
                    subject = %self.identity.subject,
                    error = %err,
                    "unable to answer flow control request"
                );
            }
        }
    }
}

impl StatusError {
    pub(crate) fn new(identity: Arc<SubscriptionIdentity>, status: Status) -> Self {
        Self { identity, status }
    }

    /// The subscription which received the status
    #[must_use]
    pub fn identity(&self) -> &SubscriptionIdentity {
        &self.identity
    }

    /// The offending status
    #[must_use]
    pub fn status(&self) -> &Status {
        &self.status
    }
}

impl Display for SubscriptionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscription subject={}", self.subject)?;
        if let Some(queue_group) = &self.queue_group {
            write!(f, " queue_group={queue_group}")?;
        }
        if let Some(stream) = &self.stream {
            write!(f, " stream={stream}")?;
        }
        if let Some(consumer) = &self.consumer {
            write!(f, " consumer={consumer}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use bytes::Bytes;
    use claims::{assert_err, assert_matches, assert_ok};
    use kiwano_proto::{
        MessageBase, ServerMessage, Status, StatusCode, Subject, SubscriptionId,
        headers::{CONSUMER_STALLED, HeaderMap, HeaderName, HeaderValue},
    };

    use super::{MessageManager, PullManager, PushError, PushManager, SubscriptionIdentity};
    use crate::{
        client::{ClientCommand, tests::test_client},
        jetstream::ErrorCallback,
    };

    fn identity() -> Arc<SubscriptionIdentity> {
        Arc::new(SubscriptionIdentity {
            subject: Subject::from_static("_INBOX.pull"),
            queue_group: None,
            stream: Some("ORDERS".to_owned()),
            consumer: Some("processor".to_owned()),
        })
    }

    fn frame(
        status: Option<u16>,
        reply_subject: Option<&'static str>,
        payload: &'static [u8],
    ) -> ServerMessage {
        ServerMessage {
            status: status.map(|code| Status::new(StatusCode::try_from(code).unwrap())),
            subscription_id: SubscriptionId::MIN,
            base: MessageBase {
                subject: Subject::from_static("_INBOX.pull"),
                reply_subject: reply_subject.map(Subject::from_static),
                headers: HeaderMap::new(),
                payload: Bytes::from_static(payload),
            },
        }
    }

    #[test]
    fn pull_consumes_expected_statuses() {
        let mut manager = MessageManager::Pull(PullManager::new(identity()));

        for code in [404, 408, 409] {
            assert!(assert_ok!(manager.manage(&frame(Some(code), None, b""))));
        }
        let MessageManager::Pull(pull) = &manager else {
            unreachable!()
        };
        assert_eq!(pull.consumed(), 3);
    }

    #[test]
    fn pull_rejects_unexpected_status() {
        let mut manager = MessageManager::Pull(PullManager::new(identity()));

        let err = assert_err!(manager.manage(&frame(Some(400), None, b"")));
        assert_eq!(err.status().code, StatusCode::BAD_REQUEST);
        assert_eq!(err.identity().subject.as_str(), "_INBOX.pull");
        assert_eq!(err.identity().consumer.as_deref(), Some("processor"));
        assert_eq!(
            err.to_string(),
            "unexpected status 400 on subscription subject=_INBOX.pull stream=ORDERS consumer=processor"
        );

        let MessageManager::Pull(pull) = &manager else {
            unreachable!()
        };
        assert_eq!(pull.consumed(), 0);
    }

    #[test]
    fn data_passes_through() {
        let mut manager = MessageManager::Pull(PullManager::new(identity()));

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("Nats-Msg-Id"),
            HeaderValue::from_static("1"),
        );
        let data = ServerMessage {
            base: MessageBase {
                headers,
                ..frame(None, Some("$JS.ACK.ORDERS.processor.1.1.1.0.0"), b"payload").base
            },
            ..frame(None, None, b"")
        };
        let before = data.clone();
        assert!(!assert_ok!(manager.manage(&data)));
        assert_eq!(data, before);

        // a status marker next to a payload is still data
        assert!(!assert_ok!(manager.manage(&frame(Some(400), None, b"payload"))));
    }

    #[tokio::test]
    async fn push_consumes_heartbeats_and_answers_flow_control() {
        let (client, mut commands) = test_client();
        let mut manager = MessageManager::Push(PushManager::new(identity(), client, None));

        assert!(assert_ok!(manager.manage(&frame(Some(100), None, b""))));
        assert!(assert_ok!(manager.manage(&frame(
            Some(100),
            Some("$JS.FC.ORDERS.abc.1"),
            b""
        ))));

        let mut stalled = frame(Some(100), None, b"");
        stalled.base.headers.insert(
            CONSUMER_STALLED,
            HeaderValue::from_static("$JS.FC.ORDERS.abc.2"),
        );
        assert!(assert_ok!(manager.manage(&stalled)));

        let MessageManager::Push(push) = &manager else {
            unreachable!()
        };
        assert_eq!(push.heartbeats(), 2);
        assert_eq!(push.flow_control_responses(), 2);

        for expected in ["$JS.FC.ORDERS.abc.1", "$JS.FC.ORDERS.abc.2"] {
            assert_matches!(
                commands.recv().await,
                Some(ClientCommand::Publish { message })
                    if message.subject.as_str() == expected && message.payload.is_empty()
            );
        }
    }

    #[tokio::test]
    async fn push_reports_unexpected_status_to_callback() {
        let (client, _commands) = test_client();
        let reported = Arc::new(Mutex::new(Vec::new()));
        let callback = ErrorCallback::new({
            let reported = Arc::clone(&reported);
            move |err: &PushError| {
                let PushError::Status(err) = err else {
                    panic!("expected a status error, got {err:?}");
                };
                reported.lock().unwrap().push(err.status().code);
            }
        });
        let mut manager =
            MessageManager::Push(PushManager::new(identity(), client, Some(callback)));

        assert!(assert_ok!(manager.manage(&frame(Some(409), None, b""))));
        assert!(!assert_ok!(manager.manage(&frame(None, None, b"data"))));
        assert_eq!(*reported.lock().unwrap(), [StatusCode::CONFLICT]);
    }

    #[tokio::test(start_paused = true)]
    async fn push_idle_tracking() {
        let (client, _commands) = test_client();
        let mut manager = PushManager::new(identity(), client, None);
        let heartbeat = Duration::from_secs(5);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!manager.is_idle(heartbeat));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(manager.is_idle(heartbeat));

        manager.touch();
        assert_eq!(manager.idle_for(), Duration::ZERO);
        assert!(!manager.is_idle(heartbeat));
    }

    #[tokio::test(start_paused = true)]
    async fn huge_heartbeat_interval_is_never_idle() {
        let (client, _commands) = test_client();
        let mut manager = PushManager::new(identity(), client, None);

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(!manager.is_idle(Duration::MAX));
        assert!(!manager.check_heartbeats(Duration::MAX));
        assert!(manager.is_idle(Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn missed_heartbeats_are_reported_once_per_silence() {
        let (client, _commands) = test_client();
        let reported = Arc::new(Mutex::new(Vec::new()));
        let callback = ErrorCallback::new({
            let reported = Arc::clone(&reported);
            move |err: &PushError| {
                let PushError::MissedHeartbeats { identity, idle_for } = err else {
                    panic!("expected missed heartbeats, got {err:?}");
                };
                assert_eq!(identity.consumer.as_deref(), Some("processor"));
                reported.lock().unwrap().push(*idle_for);
            }
        });
        let mut manager =
            MessageManager::Push(PushManager::new(identity(), client, Some(callback)));
        let heartbeat = Duration::from_secs(1);

        let MessageManager::Push(push) = &mut manager else {
            unreachable!()
        };
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!push.check_heartbeats(heartbeat));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(push.check_heartbeats(heartbeat));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!push.check_heartbeats(heartbeat));
        assert_eq!(*reported.lock().unwrap(), [Duration::from_secs(4)]);

        // any frame starts a new silent period
        assert!(assert_ok!(manager.manage(&frame(Some(100), None, b""))));
        let MessageManager::Push(push) = &mut manager else {
            unreachable!()
        };
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(push.check_heartbeats(heartbeat));
        assert_eq!(reported.lock().unwrap().len(), 2);
    }
}
