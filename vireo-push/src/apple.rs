//! Apple APNs 推送客户端
//!
//! 每个 iOS 应用一个客户端，使用该应用的客户端证书与 APNs 建立
//! 双向 TLS 的 HTTP/2 连接，请求以并发流的方式复用同一连接。

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde_json::{Map, Value, json};

use vireo_sip_core::metrics::PushClientMetrics;

use crate::client::{ClientChannel, DeliveryOutcome, DeliveryTransport, PushClient, RetryPolicy};
use crate::error::PushError;
use crate::hook::TokenInvalidationHook;
use crate::push_info::{PushInfo, PushKind, PushType};
use crate::request::PushRequest;

const APNS_HOST: &str = "https://api.push.apple.com";
const APNS_DEV_HOST: &str = "https://api.development.push.apple.com";

/// 与 APNs 协商到的并发流上限的本地预算
const APNS_MAX_CONCURRENT_STREAMS: usize = 100;

/// 空闲连接保活探测间隔
const APNS_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

pub struct AppleClient {
    channel: ClientChannel,
}

impl AppleClient {
    /// 从一个 `.pem` 证书（私钥 + 证书链）构造客户端
    ///
    /// 证书名以 `.dev` 结尾时使用 APNs 沙箱环境；
    /// `apns-topic` 为证书名去掉 `.dev` / `.prod` 修饰后的应用 bundle id。
    pub fn new(
        name: &str,
        cert_path: &Path,
        ca_file: &Path,
        max_queue_size: usize,
        retry: RetryPolicy,
        hook: Arc<dyn TokenInvalidationHook>,
        metrics: Arc<PushClientMetrics>,
    ) -> Result<Self, PushError> {
        let pem = std::fs::read(cert_path).map_err(|err| {
            PushError::Tls(format!(
                "cannot read certificate [{}]: {err}",
                cert_path.display()
            ))
        })?;
        let identity = reqwest::Identity::from_pem(&pem).map_err(|err| {
            PushError::Tls(format!(
                "invalid client certificate [{}]: {err}",
                cert_path.display()
            ))
        })?;
        let ca = std::fs::read(ca_file).map_err(|err| {
            PushError::Tls(format!("cannot read CA bundle [{}]: {err}", ca_file.display()))
        })?;
        let ca_cert = reqwest::Certificate::from_pem(&ca)
            .map_err(|err| PushError::Tls(format!("invalid CA bundle [{}]: {err}", ca_file.display())))?;

        // 连接保持打开，空闲时靠 TCP keepalive 探测对端存活；
        // 断连后下一次投递触发重连，在途请求按各自的重试预算重新投递。
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .identity(identity)
            .add_root_certificate(ca_cert)
            .tcp_keepalive(Some(APNS_KEEPALIVE_INTERVAL))
            .pool_idle_timeout(None)
            .build()
            .map_err(|err| PushError::Tls(format!("cannot build APNs client [{name}]: {err}")))?;

        let base_url = if name.ends_with(".dev") {
            APNS_DEV_HOST
        } else {
            APNS_HOST
        };
        let topic = name
            .strip_suffix(".dev")
            .or_else(|| name.strip_suffix(".prod"))
            .unwrap_or(name)
            .to_string();

        let transport = Arc::new(AppleTransport {
            http,
            base_url: base_url.to_string(),
            topic,
        });

        Ok(Self {
            channel: ClientChannel::spawn(
                name,
                max_queue_size,
                APNS_MAX_CONCURRENT_STREAMS,
                retry,
                transport,
                hook,
                metrics,
            ),
        })
    }
}

impl PushClient for AppleClient {
    fn name(&self) -> &str {
        self.channel.name()
    }

    fn make_request(
        &self,
        push_type: PushType,
        info: &Arc<PushInfo>,
    ) -> Result<Arc<PushRequest>, PushError> {
        if info.destination(push_type).is_none() {
            return Err(PushError::MissingDestination(push_type));
        }
        let body = build_payload(push_type, info);
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

/// 按推送类别构造 aps payload
///
/// 模板由推送类别选择；alert 的具体形态再按 PushInfo 的 payload
/// 内容类别细分：RemoteBasic 生成不带模板参数的基础 alert，
/// Background 内容类别即使走 alert 类别也只发 content-available。
fn build_payload(push_type: PushType, info: &PushInfo) -> Vec<u8> {
    let mut aps = Map::new();
    match push_type {
        PushType::Message | PushType::Call => match info.kind {
            PushKind::Background => {
                aps.insert("content-available".to_string(), json!(1));
            }
            PushKind::RemoteBasic => {
                aps.insert("alert".to_string(), json!({ "loc-key": loc_key(push_type) }));
                aps.insert("sound".to_string(), json!("default"));
                if let Some(badge) = info.badge {
                    aps.insert("badge".to_string(), json!(badge));
                }
            }
            PushKind::Message | PushKind::Call => {
                aps.insert(
                    "alert".to_string(),
                    json!({
                        "loc-key": loc_key(push_type),
                        "loc-args": [&info.from_name],
                    }),
                );
                aps.insert("sound".to_string(), json!("default"));
                if let Some(badge) = info.badge {
                    aps.insert("badge".to_string(), json!(badge));
                }
            }
        },
        PushType::Background => {
            aps.insert("content-available".to_string(), json!(1));
        }
    }

    let mut root = Map::new();
    root.insert("aps".to_string(), Value::Object(aps));
    if !info.from_uri.is_empty() {
        root.insert("from-uri".to_string(), json!(&info.from_uri));
    }
    if !info.call_id.is_empty() {
        root.insert("call-id".to_string(), json!(&info.call_id));
    }
    if let Some(event_id) = &info.event_id {
        root.insert("pn-event-id".to_string(), json!(event_id));
    }
    for (key, value) in &info.custom_payload {
        root.insert(key.clone(), json!(value));
    }

    serde_json::to_vec(&Value::Object(root)).unwrap_or_default()
}

struct AppleTransport {
    http: reqwest::Client,
    base_url: String,
    topic: String,
}

#[async_trait]
impl DeliveryTransport for AppleTransport {
    async fn deliver(&self, request: &PushRequest) -> DeliveryOutcome {
        let Some(destination) = request.info().destination(request.push_type()) else {
            return DeliveryOutcome::Rejected {
                reason: "missing destination".to_string(),
                unregistered_token: None,
            };
        };

        let url = format!("{}/3/device/{}", self.base_url, destination.device_token);
        let mut builder = self
            .http
            .post(&url)
            .header("content-type", "application/json")
            .header("apns-topic", &self.topic)
            .header("apns-push-type", push_type_header(request.push_type()))
            .header(
                "apns-priority",
                if request.push_type() == PushType::Background {
                    "5"
                } else {
                    "10"
                },
            )
            .header("apns-expiration", expiration_header(request.info()));
        if let Some(collapse_key) = &request.info().collapse_key {
            builder = builder.header("apns-collapse-id", collapse_key);
        }

        let response = match builder.body(request.body().to_vec()).send().await {
            Ok(response) => response,
            Err(err) => {
                return DeliveryOutcome::Retry {
                    reason: format!("APNs request failed: {err}"),
                };
            }
        };

        let status = response.status();
        let body = response.bytes().await.unwrap_or_default();
        classify_response(status, &body, &destination.device_token)
    }
}

fn loc_key(push_type: PushType) -> &'static str {
    if push_type == PushType::Call {
        "IC_MSG"
    } else {
        "IM_MSG"
    }
}

fn push_type_header(push_type: PushType) -> &'static str {
    match push_type {
        PushType::Message => "alert",
        PushType::Call => "voip",
        PushType::Background => "background",
    }
}

/// `apns-expiration`：ttl 为零表示即弃通知
fn expiration_header(info: &PushInfo) -> String {
    if info.ttl.is_zero() {
        "0".to_string()
    } else {
        (Utc::now().timestamp() + info.ttl.as_secs() as i64).to_string()
    }
}

/// APNs 响应分类
///
/// 200 成功；410 设备 token 已注销（终态，上报失效回调）；
/// 其余 4xx 终态，原因取自响应体；429 与 5xx 重试。
fn classify_response(status: StatusCode, body: &[u8], device_token: &str) -> DeliveryOutcome {
    if status.is_success() {
        return DeliveryOutcome::Delivered;
    }
    if status == StatusCode::GONE {
        return DeliveryOutcome::Rejected {
            reason: "Unregistered".to_string(),
            unregistered_token: Some(device_token.to_string()),
        };
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return DeliveryOutcome::Retry {
            reason: "APNs throttled the connection".to_string(),
        };
    }
    if status.is_client_error() {
        let reason = serde_json::from_slice::<Value>(body)
            .ok()
            .and_then(|v| v.get("reason").and_then(Value::as_str).map(String::from))
            .unwrap_or_else(|| format!("APNs rejected the notification with status {status}"));
        return DeliveryOutcome::Rejected {
            reason,
            unregistered_token: None,
        };
    }
    DeliveryOutcome::Retry {
        reason: format!("APNs unavailable (status {status})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push_info::PushDestination;

    fn info_with(push_type: PushType) -> PushInfo {
        let mut info = PushInfo::new("org.example.app");
        info.from_name = "Alice".to_string();
        info.from_uri = "sip:alice@example.org".to_string();
        info.badge = Some(3);
        info.add_destination(
            push_type,
            PushDestination::new("apns", "abc123", "org.example.app"),
        );
        info
    }

    #[test]
    fn test_message_payload_shape() {
        let info = info_with(PushType::Message);
        let body: Value = serde_json::from_slice(&build_payload(PushType::Message, &info)).unwrap();
        assert_eq!(body["aps"]["alert"]["loc-key"], "IM_MSG");
        assert_eq!(body["aps"]["alert"]["loc-args"][0], "Alice");
        assert_eq!(body["aps"]["badge"], 3);
        assert_eq!(body["from-uri"], "sip:alice@example.org");
    }

    #[test]
    fn test_remote_basic_payload_has_no_template_args() {
        let mut info = info_with(PushType::Message);
        info.kind = PushKind::RemoteBasic;
        let body: Value = serde_json::from_slice(&build_payload(PushType::Message, &info)).unwrap();
        assert_eq!(body["aps"]["alert"]["loc-key"], "IM_MSG");
        assert!(body["aps"]["alert"].get("loc-args").is_none());
        assert_eq!(body["aps"]["badge"], 3);
    }

    #[test]
    fn test_background_kind_forces_content_available() {
        let mut info = info_with(PushType::Message);
        info.kind = PushKind::Background;
        let body: Value = serde_json::from_slice(&build_payload(PushType::Message, &info)).unwrap();
        assert_eq!(body["aps"]["content-available"], 1);
        assert!(body["aps"].get("alert").is_none());
    }

    #[test]
    fn test_background_payload_shape() {
        let mut info = info_with(PushType::Background);
        info.custom_payload
            .insert("chat-room-addr".to_string(), "sip:room@conf".to_string());
        let body: Value =
            serde_json::from_slice(&build_payload(PushType::Background, &info)).unwrap();
        assert_eq!(body["aps"]["content-available"], 1);
        assert!(body["aps"].get("alert").is_none());
        assert_eq!(body["chat-room-addr"], "sip:room@conf");
    }

    #[test]
    fn test_classify_success() {
        assert!(matches!(
            classify_response(StatusCode::OK, b"", "abc"),
            DeliveryOutcome::Delivered
        ));
    }

    #[test]
    fn test_classify_unregistered_reports_token() {
        match classify_response(StatusCode::GONE, b"{\"reason\":\"Unregistered\"}", "abc") {
            DeliveryOutcome::Rejected {
                reason,
                unregistered_token,
            } => {
                assert_eq!(reason, "Unregistered");
                assert_eq!(unregistered_token.as_deref(), Some("abc"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_classify_client_error_terminal_with_reason() {
        match classify_response(
            StatusCode::BAD_REQUEST,
            b"{\"reason\":\"BadDeviceToken\"}",
            "abc",
        ) {
            DeliveryOutcome::Rejected {
                reason,
                unregistered_token,
            } => {
                assert_eq!(reason, "BadDeviceToken");
                assert!(unregistered_token.is_none());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_classify_server_error_retryable() {
        assert!(matches!(
            classify_response(StatusCode::SERVICE_UNAVAILABLE, b"", "abc"),
            DeliveryOutcome::Retry { .. }
        ));
        assert!(matches!(
            classify_response(StatusCode::TOO_MANY_REQUESTS, b"", "abc"),
            DeliveryOutcome::Retry { .. }
        ));
    }

    #[test]
    fn test_push_type_headers() {
        assert_eq!(push_type_header(PushType::Message), "alert");
        assert_eq!(push_type_header(PushType::Call), "voip");
        assert_eq!(push_type_header(PushType::Background), "background");
    }
}
