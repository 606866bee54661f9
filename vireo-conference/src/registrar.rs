//! registrar 与会议服务器的消费接口
//!
//! 分配器只消费这些接口；registrar 的存储布局与会议服务器的
//! SIP 信令由外部实现。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::uri::SipUri;

/// registrar 记录里的一条扩展联系人绑定
#[derive(Debug, Clone)]
pub struct ExtendedContact {
    /// 联系人地址
    pub contact: SipUri,
    /// 绑定时 registrar 颁发的公共 GRUU
    pub pub_gruu: Option<SipUri>,
    /// 注册时间
    pub registered_at: DateTime<Utc>,
}

/// 一个 AOR 在 registrar 里的当前视图
#[derive(Debug, Clone, Default)]
pub struct Record {
    pub contacts: Vec<ExtendedContact>,
}

impl Record {
    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// 最近注册的联系人
    pub fn latest(&self) -> Option<&ExtendedContact> {
        self.contacts.iter().max_by_key(|c| c.registered_at)
    }
}

/// registrar 查询接口
#[async_trait]
pub trait Registrar: Send + Sync {
    /// 查询 URI 的当前记录；没有绑定时返回 None
    async fn fetch(&self, uri: &SipUri) -> anyhow::Result<Option<Record>>;
}

/// 会议服务器的聊天室绑定接口
#[async_trait]
pub trait ChatRoomBinder: Send + Sync {
    /// 以设备 UUID 在指定 transport 上绑定聊天室地址，
    /// 返回绑定产生的 registrar 记录
    async fn bind_chat_room(
        &self,
        uri: &SipUri,
        transport: &str,
        device_uuid: &str,
    ) -> anyhow::Result<Record>;
}

/// 聊天室侧的地址发布回调
pub trait ChatRoomHandle: Send + Sync {
    /// 发布（或在失败时清空）聊天室的会议地址
    fn set_conference_address(&self, address: Option<SipUri>);
}
