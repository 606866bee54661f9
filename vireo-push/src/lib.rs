//! Vireo 推送通知分发库
//!
//! 负责将代理产生的推送意图（[`PushInfo`]）路由到各个推送通道客户端：
//! - Apple APNs（HTTP/2 + 双向 TLS）
//! - Firebase FCM legacy（HTTP/1.1 + 静态 API key）
//! - Firebase FCM v1（HTTP/2 + OAuth2 轮换 token）
//! - 运营商自定义的通用 HTTP 端点
//!
//! 每个客户端持有一个有界请求队列，队列满时入队同步失败（[`PushError::QueueFull`]），
//! 请求完成通过 [`PushRequest`] 上的状态通道异步通知。

pub mod apple;
pub mod client;
pub mod error;
pub mod firebase_legacy;
pub mod firebase_v1;
pub mod generic;
pub mod hook;
pub mod push_info;
pub mod request;
pub mod service;
pub mod token_manager;

pub use apple::AppleClient;
pub use client::{PushClient, RetryPolicy};
pub use error::{PushError, Result};
pub use firebase_legacy::FirebaseLegacyClient;
pub use firebase_v1::FirebaseV1Client;
pub use generic::{GenericHttpClient, GenericMethod, GenericProtocol};
pub use hook::{NoopInvalidationHook, TokenInvalidationHook};
pub use push_info::{PushDestination, PushInfo, PushKind, PushType};
pub use request::{PushRequest, RequestState};
pub use service::{FALLBACK_CLIENT_KEY, GENERIC_CLIENT_NAME, PushService};
pub use token_manager::{AccessToken, TokenManager};
