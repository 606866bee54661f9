//! 推送意图数据模型

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// 推送通知类别，决定各通道的 payload 模板
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushType {
    Message,
    Call,
    Background,
}

impl fmt::Display for PushType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PushType::Message => "message",
            PushType::Call => "call",
            PushType::Background => "background",
        };
        f.write_str(label)
    }
}

/// 推送 payload 内容类别
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PushKind {
    #[default]
    Message,
    Call,
    RemoteBasic,
    Background,
}

/// 单个推送目标：设备标识 + provider 标签 + 应用标识
#[derive(Debug, Clone)]
pub struct PushDestination {
    /// provider 标签（"apns"、"fcm" 等），用于客户端路由
    pub provider: String,
    /// 设备 token
    pub device_token: String,
    /// 应用标识
    pub app_identifier: String,
}

impl PushDestination {
    pub fn new(
        provider: impl Into<String>,
        device_token: impl Into<String>,
        app_identifier: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            device_token: device_token.into(),
            app_identifier: app_identifier.into(),
        }
    }
}

/// 一次推送通知意图的不可变描述
///
/// 由代理的消息路由层构造；在产生请求前至少要填充一个目标设备。
#[derive(Debug, Clone, Default)]
pub struct PushInfo {
    destinations: HashMap<PushType, PushDestination>,
    /// 应用标识
    pub app_identifier: String,
    /// payload 内容类别
    pub kind: PushKind,
    /// 主叫显示名
    pub from_name: String,
    /// 主叫 SIP URI
    pub from_uri: String,
    /// SIP Call-ID
    pub call_id: String,
    /// 角标计数
    pub badge: Option<u32>,
    /// 站点自定义的 payload 键值对
    pub custom_payload: HashMap<String, String>,
    /// 存活时间
    pub ttl: Duration,
    /// 折叠键，同键通知在设备上互相覆盖
    pub collapse_key: Option<String>,
    /// 事件标识
    pub event_id: Option<String>,
}

impl PushInfo {
    pub fn new(app_identifier: impl Into<String>) -> Self {
        Self {
            app_identifier: app_identifier.into(),
            ..Default::default()
        }
    }

    /// 为指定推送类别登记目标设备
    pub fn add_destination(&mut self, push_type: PushType, destination: PushDestination) {
        self.destinations.insert(push_type, destination);
    }

    pub fn destination(&self, push_type: PushType) -> Option<&PushDestination> {
        self.destinations.get(&push_type)
    }

    /// 是否至少有一个目标设备
    pub fn has_destinations(&self) -> bool {
        !self.destinations.is_empty()
    }

    /// 指定类别的 provider 标签
    pub fn provider(&self, push_type: PushType) -> Option<&str> {
        self.destinations
            .get(&push_type)
            .map(|d| d.provider.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destinations() {
        let mut info = PushInfo::new("org.example.app");
        assert!(!info.has_destinations());
        assert!(info.destination(PushType::Message).is_none());

        info.add_destination(
            PushType::Message,
            PushDestination::new("apns", "device-token", "org.example.app"),
        );
        assert!(info.has_destinations());
        assert_eq!(info.provider(PushType::Message), Some("apns"));
        // 其他类别仍然没有目标
        assert!(info.destination(PushType::Call).is_none());
    }

    #[test]
    fn test_push_type_labels() {
        assert_eq!(PushType::Message.to_string(), "message");
        assert_eq!(PushType::Call.to_string(), "call");
        assert_eq!(PushType::Background.to_string(), "background");
    }
}
