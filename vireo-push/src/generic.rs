//! 通用 HTTP 推送客户端
//!
//! 站点自建推送网关时使用：按配置的 URL / 请求体模板展开变量后发送。
//! 注册在 `"generic"` 名下时抢占所有 provider 专属分发（见 service 模块）。
//! 通过注册表弱引用委托各 provider 客户端构造原生 payload（`$payload` 变量）。

use std::str::FromStr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::warn;

use vireo_sip_core::metrics::PushClientMetrics;

use crate::client::{ClientChannel, DeliveryOutcome, DeliveryTransport, PushClient, RetryPolicy};
use crate::error::PushError;
use crate::hook::TokenInvalidationHook;
use crate::push_info::{PushInfo, PushType};
use crate::request::PushRequest;
use crate::service::ClientRegistry;

/// 通用客户端允许的 HTTP 方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenericMethod {
    Get,
    Post,
}

impl FromStr for GenericMethod {
    type Err = PushError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(GenericMethod::Get),
            "POST" => Ok(GenericMethod::Post),
            other => Err(PushError::InvalidArgument(format!(
                "invalid method value [{other}], only GET and POST are authorized"
            ))),
        }
    }
}

/// 通用客户端的传输协议
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenericProtocol {
    Http,
    Http2,
}

impl FromStr for GenericProtocol {
    type Err = PushError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(GenericProtocol::Http),
            "http2" => Ok(GenericProtocol::Http2),
            other => Err(PushError::InvalidArgument(format!(
                "invalid protocol value [{other}], only http and http2 are authorized"
            ))),
        }
    }
}

pub struct GenericHttpClient {
    channel: ClientChannel,
    body_template: Option<String>,
    method: GenericMethod,
    registry: Weak<ClientRegistry>,
}

impl GenericHttpClient {
    /// `registry` 在构造时显式传入（注册表的弱引用，非回指服务的可变指针），
    /// 供 `$payload` 委托各 provider 客户端构造原生请求体。
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        url_template: impl Into<String>,
        body_template: Option<String>,
        method: GenericMethod,
        protocol: GenericProtocol,
        registry: Weak<ClientRegistry>,
        max_queue_size: usize,
        retry: RetryPolicy,
        hook: Arc<dyn TokenInvalidationHook>,
        metrics: Arc<PushClientMetrics>,
    ) -> Result<Self, PushError> {
        let mut builder = reqwest::Client::builder().use_rustls_tls();
        let max_in_flight = match protocol {
            GenericProtocol::Http => {
                // HTTP/1 通道单连接、禁流水线，请求按入队顺序完成
                builder = builder.http1_only().pool_max_idle_per_host(1);
                1
            }
            GenericProtocol::Http2 => {
                builder = builder.http2_prior_knowledge();
                100
            }
        };
        let http = builder.build().map_err(|err| {
            PushError::Transport(format!("cannot build generic client [{name}]: {err}"))
        })?;

        let transport = Arc::new(GenericTransport {
            http,
            url_template: url_template.into(),
            method,
            registry: registry.clone(),
        });

        Ok(Self {
            channel: ClientChannel::spawn(
                name,
                max_queue_size,
                max_in_flight,
                retry,
                transport,
                hook,
                metrics,
            ),
            body_template,
            method,
            registry,
        })
    }
}

impl PushClient for GenericHttpClient {
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
        let body = match (self.method, &self.body_template) {
            (GenericMethod::Post, Some(template)) => {
                expand_template(template, push_type, info, &self.registry).into_bytes()
            }
            _ => Vec::new(),
        };
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

/// 展开模板变量
///
/// 支持：`$type`、`$token`、`$app-id`、`$provider`、`$from-name`、`$from-uri`、
/// `$call-id`、`$event-id`、`$ttl`、`$payload`。
/// `$payload` 委托注册表中 provider 同名客户端构造原生请求体；
/// 找不到对应客户端时展开为空串并记录告警。
pub(crate) fn expand_template(
    template: &str,
    push_type: PushType,
    info: &Arc<PushInfo>,
    registry: &Weak<ClientRegistry>,
) -> String {
    let destination = info.destination(push_type);
    let device_token = destination.map(|d| d.device_token.as_str()).unwrap_or("");
    let app_id = destination.map(|d| d.app_identifier.as_str()).unwrap_or("");
    let provider = destination.map(|d| d.provider.as_str()).unwrap_or("");

    let mut expanded = template.to_string();
    if expanded.contains("$payload") {
        let payload = native_payload(push_type, info, provider, registry);
        expanded = expanded.replace("$payload", &payload);
    }
    // 长变量名在前，避免前缀互相吞没
    expanded = expanded.replace("$from-name", &info.from_name);
    expanded = expanded.replace("$from-uri", &info.from_uri);
    expanded = expanded.replace("$event-id", info.event_id.as_deref().unwrap_or(""));
    expanded = expanded.replace("$call-id", &info.call_id);
    expanded = expanded.replace("$app-id", app_id);
    expanded = expanded.replace("$provider", provider);
    expanded = expanded.replace("$token", device_token);
    expanded = expanded.replace("$type", &push_type.to_string());
    expanded = expanded.replace("$ttl", &info.ttl.as_secs().to_string());
    expanded
}

/// 委托 provider 同名客户端构造原生请求体
fn native_payload(
    push_type: PushType,
    info: &Arc<PushInfo>,
    provider: &str,
    registry: &Weak<ClientRegistry>,
) -> String {
    let Some(registry) = registry.upgrade() else {
        warn!("client registry dropped, expanding $payload to empty");
        return String::new();
    };
    let clients = registry.read().unwrap_or_else(|err| err.into_inner());
    let Some(client) = clients.get(provider) else {
        warn!(provider = %provider, "no native client for provider, expanding $payload to empty");
        return String::new();
    };
    match client.make_request(push_type, info) {
        Ok(request) => String::from_utf8_lossy(request.body()).into_owned(),
        Err(err) => {
            warn!(provider = %provider, error = %err, "native payload construction failed");
            String::new()
        }
    }
}

struct GenericTransport {
    http: reqwest::Client,
    url_template: String,
    method: GenericMethod,
    registry: Weak<ClientRegistry>,
}

#[async_trait]
impl DeliveryTransport for GenericTransport {
    async fn deliver(&self, request: &PushRequest) -> DeliveryOutcome {
        let info = Arc::new(request.info().clone());
        let url = expand_template(&self.url_template, request.push_type(), &info, &self.registry);

        let builder = match self.method {
            GenericMethod::Get => self.http.get(&url),
            GenericMethod::Post => self.http.post(&url).body(request.body().to_vec()),
        };

        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => {
                return DeliveryOutcome::Retry {
                    reason: format!("generic push request failed: {err}"),
                };
            }
        };

        classify_status(response.status())
    }
}

fn classify_status(status: StatusCode) -> DeliveryOutcome {
    if status.is_success() {
        DeliveryOutcome::Delivered
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        DeliveryOutcome::Retry {
            reason: format!("generic endpoint unavailable (status {status})"),
        }
    } else {
        DeliveryOutcome::Rejected {
            reason: format!("generic endpoint rejected the notification (status {status})"),
            unregistered_token: None,
        }
    }
}
