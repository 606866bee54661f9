//! Firebase FCM legacy 推送客户端
//!
//! HTTP/1.1 POST 到固定的 legacy 端点，使用静态 API key 认证。
//! 单连接、禁用流水线，请求严格按入队顺序完成。

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use vireo_sip_core::metrics::PushClientMetrics;

use crate::client::{ClientChannel, DeliveryOutcome, DeliveryTransport, PushClient, RetryPolicy};
use crate::error::PushError;
use crate::hook::TokenInvalidationHook;
use crate::push_info::{PushInfo, PushType};
use crate::request::PushRequest;

const FCM_LEGACY_ENDPOINT: &str = "https://fcm.googleapis.com/fcm/send";

pub struct FirebaseLegacyClient {
    channel: ClientChannel,
}

impl FirebaseLegacyClient {
    pub fn new(
        app_id: &str,
        api_key: impl Into<String>,
        max_queue_size: usize,
        retry: RetryPolicy,
        hook: Arc<dyn TokenInvalidationHook>,
        metrics: Arc<PushClientMetrics>,
    ) -> Result<Self, PushError> {
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .http1_only()
            .pool_max_idle_per_host(1)
            .build()
            .map_err(|err| {
                PushError::Transport(format!("cannot build FCM legacy client [{app_id}]: {err}"))
            })?;

        let transport = Arc::new(LegacyTransport {
            http,
            api_key: api_key.into(),
        });

        Ok(Self {
            channel: ClientChannel::spawn(app_id, max_queue_size, 1, retry, transport, hook, metrics),
        })
    }
}

impl PushClient for FirebaseLegacyClient {
    fn name(&self) -> &str {
        self.channel.name()
    }

    fn make_request(
        &self,
        push_type: PushType,
        info: &Arc<PushInfo>,
    ) -> Result<Arc<PushRequest>, PushError> {
        let destination = info
            .destination(push_type)
            .ok_or(PushError::MissingDestination(push_type))?;
        let body = build_payload(push_type, info, &destination.device_token);
        Ok(PushRequest::new(
            self.name(),
            push_type,
            Arc::clone(info),
            body,
        ))
    }

    fn send_push(&self, request: Arc<PushRequest>) -> Result<(), PushError> {
        self.channel.enqueue(request)
    }

    fn is_idle(&self) -> bool {
        self.channel.is_idle()
    }
}

fn build_payload(push_type: PushType, info: &PushInfo, device_token: &str) -> Vec<u8> {
    let mut data = Map::new();
    data.insert("type".to_string(), json!(push_type.to_string()));
    data.insert("from-name".to_string(), json!(&info.from_name));
    data.insert("from-uri".to_string(), json!(&info.from_uri));
    if !info.call_id.is_empty() {
        data.insert("call-id".to_string(), json!(&info.call_id));
    }
    if let Some(event_id) = &info.event_id {
        data.insert("event-id".to_string(), json!(event_id));
    }
    for (key, value) in &info.custom_payload {
        data.insert(key.clone(), json!(value));
    }

    let mut root = Map::new();
    root.insert("to".to_string(), json!(device_token));
    root.insert("priority".to_string(), json!("high"));
    root.insert("time_to_live".to_string(), json!(info.ttl.as_secs()));
    if let Some(collapse_key) = &info.collapse_key {
        root.insert("collapse_key".to_string(), json!(collapse_key));
    }
    root.insert("data".to_string(), Value::Object(data));

    serde_json::to_vec(&Value::Object(root)).unwrap_or_default()
}

struct LegacyTransport {
    http: reqwest::Client,
    api_key: String,
}

#[async_trait]
impl DeliveryTransport for LegacyTransport {
    async fn deliver(&self, request: &PushRequest) -> DeliveryOutcome {
        let Some(destination) = request.info().destination(request.push_type()) else {
            return DeliveryOutcome::Rejected {
                reason: "missing destination".to_string(),
                unregistered_token: None,
            };
        };

        let response = match self
            .http
            .post(FCM_LEGACY_ENDPOINT)
            .header("content-type", "application/json")
            .header("authorization", format!("key={}", self.api_key))
            .body(request.body().to_vec())
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                return DeliveryOutcome::Retry {
                    reason: format!("FCM request failed: {err}"),
                };
            }
        };

        let status = response.status();
        let body = response.bytes().await.unwrap_or_default();
        classify_response(status, &body, &destination.device_token)
    }
}

#[derive(Debug, Deserialize)]
struct LegacyResponse {
    #[serde(default)]
    failure: u32,
    #[serde(default)]
    results: Vec<LegacyResult>,
}

#[derive(Debug, Deserialize)]
struct LegacyResult {
    #[serde(default)]
    error: Option<String>,
}

/// FCM legacy 响应分类
///
/// HTTP 层：401 认证失败终态，400 请求体非法终态，429/5xx 重试。
/// 业务层：逐设备结果里 `NotRegistered` / `InvalidRegistration` 为终态
/// 并上报失效回调，`Unavailable` / `InternalServerError` 可重试。
fn classify_response(status: StatusCode, body: &[u8], device_token: &str) -> DeliveryOutcome {
    if status == StatusCode::UNAUTHORIZED {
        return DeliveryOutcome::Rejected {
            reason: "FCM authentication failure".to_string(),
            unregistered_token: None,
        };
    }
    if status == StatusCode::BAD_REQUEST {
        return DeliveryOutcome::Rejected {
            reason: "FCM rejected the request as malformed".to_string(),
            unregistered_token: None,
        };
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return DeliveryOutcome::Retry {
            reason: format!("FCM unavailable (status {status})"),
        };
    }
    if !status.is_success() {
        return DeliveryOutcome::Rejected {
            reason: format!("FCM rejected the notification with status {status}"),
            unregistered_token: None,
        };
    }

    let parsed: LegacyResponse = match serde_json::from_slice(body) {
        Ok(parsed) => parsed,
        Err(err) => {
            return DeliveryOutcome::Retry {
                reason: format!("malformed FCM response: {err}"),
            };
        }
    };
    if parsed.failure == 0 {
        return DeliveryOutcome::Delivered;
    }

    let error = parsed
        .results
        .iter()
        .find_map(|result| result.error.as_deref())
        .unwrap_or("Unknown");
    match error {
        "NotRegistered" | "InvalidRegistration" => DeliveryOutcome::Rejected {
            reason: error.to_string(),
            unregistered_token: Some(device_token.to_string()),
        },
        "Unavailable" | "InternalServerError" => DeliveryOutcome::Retry {
            reason: format!("FCM reported [{error}]"),
        },
        _ => DeliveryOutcome::Rejected {
            reason: error.to_string(),
            unregistered_token: None,
        },
    }
}
