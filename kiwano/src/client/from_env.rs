use kiwano_proto::Subject;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub(super) struct FromEnv {
    pub(super) inbox_prefix: Option<Subject>,
    pub(super) response_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(super) struct JetstreamFromEnv {
    pub(super) js_domain: Option<String>,
    pub(super) js_api_prefix: Option<Subject>,
    pub(super) js_request_timeout_ms: Option<u64>,
}
