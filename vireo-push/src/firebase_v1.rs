//! Firebase FCM v1 推送客户端
//!
//! 每个 service account 一条 HTTP/2 连接；每次投递前从 [`TokenManager`]
//! 取当前可用的 bearer token，没有可用 token 时请求挂起等待下一次发布，
//! 超时则以 TokenUnavailable 终态失败（不在客户端层重试）。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{Map, Value, json};

use vireo_sip_core::metrics::PushClientMetrics;

use crate::client::{ClientChannel, DeliveryOutcome, DeliveryTransport, PushClient, RetryPolicy};
use crate::error::PushError;
use crate::hook::TokenInvalidationHook;
use crate::push_info::{PushInfo, PushType};
use crate::request::PushRequest;
use crate::token_manager::TokenManager;

/// 等待 token 发布的上限
const TOKEN_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// 与 FCM 协商到的并发流上限的本地预算
const FCM_MAX_CONCURRENT_STREAMS: usize = 100;

pub struct FirebaseV1Client {
    channel: ClientChannel,
}

impl FirebaseV1Client {
    pub fn new(
        app_id: &str,
        token_manager: Arc<TokenManager>,
        max_queue_size: usize,
        retry: RetryPolicy,
        hook: Arc<dyn TokenInvalidationHook>,
        metrics: Arc<PushClientMetrics>,
    ) -> Result<Self, PushError> {
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .pool_idle_timeout(None)
            .build()
            .map_err(|err| {
                PushError::Transport(format!("cannot build FCM v1 client [{app_id}]: {err}"))
            })?;

        let endpoint = format!(
            "https://fcm.googleapis.com/v1/projects/{}/messages:send",
            token_manager.project_id()
        );
        let transport = Arc::new(V1Transport {
            http,
            endpoint,
            token_manager,
        });

        Ok(Self {
            channel: ClientChannel::spawn(
                app_id,
                max_queue_size,
                FCM_MAX_CONCURRENT_STREAMS,
                retry,
                transport,
                hook,
                metrics,
            ),
        })
    }
}

impl PushClient for FirebaseV1Client {
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

    let mut android = Map::new();
    android.insert("priority".to_string(), json!("high"));
    android.insert("ttl".to_string(), json!(format!("{}s", info.ttl.as_secs())));
    if let Some(collapse_key) = &info.collapse_key {
        android.insert("collapse_key".to_string(), json!(collapse_key));
    }

    let message = json!({
        "message": {
            "token": device_token,
            "android": Value::Object(android),
            "data": Value::Object(data),
        }
    });
    serde_json::to_vec(&message).unwrap_or_default()
}

struct V1Transport {
    http: reqwest::Client,
    endpoint: String,
    token_manager: Arc<TokenManager>,
}

#[async_trait]
impl DeliveryTransport for V1Transport {
    async fn deliver(&self, request: &PushRequest) -> DeliveryOutcome {
        let Some(destination) = request.info().destination(request.push_type()) else {
            return DeliveryOutcome::Rejected {
                reason: "missing destination".to_string(),
                unregistered_token: None,
            };
        };

        // 发送时刻必须持有可用 token；拿不到则终态失败，不重试
        let token = match self.token_manager.token(TOKEN_WAIT_TIMEOUT).await {
            Ok(token) => token,
            Err(err) => {
                return DeliveryOutcome::Rejected {
                    reason: format!("TokenUnavailable: {err}"),
                    unregistered_token: None,
                };
            }
        };

        let response = match self
            .http
            .post(&self.endpoint)
            .header("content-type", "application/json")
            .bearer_auth(&token.token)
            .body(request.body().to_vec())
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                return DeliveryOutcome::Retry {
                    reason: format!("FCM v1 request failed: {err}"),
                };
            }
        };

        let status = response.status();
        let body = response.bytes().await.unwrap_or_default();
        classify_response(status, &body, &destination.device_token)
    }
}

/// FCM v1 响应分类
///
/// 404/UNREGISTERED 为设备已注销的终态并上报失效回调；
/// 400/401/403 终态；429 与 5xx 重试。
fn classify_response(status: StatusCode, body: &[u8], device_token: &str) -> DeliveryOutcome {
    if status.is_success() {
        return DeliveryOutcome::Delivered;
    }

    let error_status = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("status"))
                .and_then(Value::as_str)
                .map(String::from)
        })
        .unwrap_or_default();

    if status == StatusCode::NOT_FOUND || error_status == "UNREGISTERED" {
        return DeliveryOutcome::Rejected {
            reason: "Unregistered".to_string(),
            unregistered_token: Some(device_token.to_string()),
        };
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return DeliveryOutcome::Retry {
            reason: "FCM v1 quota exceeded".to_string(),
        };
    }
    if status.is_client_error() {
        let reason = if error_status.is_empty() {
            format!("FCM v1 rejected the notification with status {status}")
        } else {
            error_status
        };
        return DeliveryOutcome::Rejected {
            reason,
            unregistered_token: None,
        };
    }
    DeliveryOutcome::Retry {
        reason: format!("FCM v1 unavailable (status {status})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push_info::PushDestination;

    #[test]
    fn test_payload_shape() {
        let mut info = PushInfo::new("app2");
        info.from_name = "Carol".to_string();
        info.ttl = std::time::Duration::from_secs(60);
        info.collapse_key = Some("call".to_string());
        info.add_destination(
            PushType::Call,
            PushDestination::new("fcm", "v1-token", "app2"),
        );

        let body: Value =
            serde_json::from_slice(&build_payload(PushType::Call, &info, "v1-token")).unwrap();
        assert_eq!(body["message"]["token"], "v1-token");
        assert_eq!(body["message"]["android"]["priority"], "high");
        assert_eq!(body["message"]["android"]["ttl"], "60s");
        assert_eq!(body["message"]["android"]["collapse_key"], "call");
        assert_eq!(body["message"]["data"]["type"], "call");
    }

    #[test]
    fn test_classify_unregistered() {
        let body = br#"{"error":{"code":404,"status":"UNREGISTERED","message":"unregistered"}}"#;
        match classify_response(StatusCode::NOT_FOUND, body, "v1-token") {
            DeliveryOutcome::Rejected {
                reason,
                unregistered_token,
            } => {
                assert_eq!(reason, "Unregistered");
                assert_eq!(unregistered_token.as_deref(), Some("v1-token"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_classify_invalid_argument_terminal() {
        let body = br#"{"error":{"code":400,"status":"INVALID_ARGUMENT","message":"bad"}}"#;
        match classify_response(StatusCode::BAD_REQUEST, body, "v1-token") {
            DeliveryOutcome::Rejected {
                reason,
                unregistered_token,
            } => {
                assert_eq!(reason, "INVALID_ARGUMENT");
                assert!(unregistered_token.is_none());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_classify_retryable() {
        assert!(matches!(
            classify_response(StatusCode::TOO_MANY_REQUESTS, b"", "t"),
            DeliveryOutcome::Retry { .. }
        ));
        assert!(matches!(
            classify_response(StatusCode::INTERNAL_SERVER_ERROR, b"", "t"),
            DeliveryOutcome::Retry { .. }
        ));
    }
}
