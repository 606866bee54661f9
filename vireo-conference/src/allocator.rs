//! 会议地址分配器
//!
//! 聊天室创建握手期间的一次性状态机：
//!
//! - **Fetching**：向 registrar 查询候选 URI。记录非空说明地址冲突，
//!   重新生成 128 位随机 token 作为 user 部分后重查；连续冲突有迭代上限。
//! - **Binding**：指示会议服务器绑定该 URI，从绑定产生的记录里取
//!   最新联系人的公共 GRUU，发布为聊天室的会议地址。
//!
//! 任一阶段的传输错误都会清空聊天室的会议地址并向上游报错。
//! 分配器的生命周期就是这一次冲突重试加绑定的交换；作为被 future
//! 独占持有的状态运行，不跨回调共享所有权。

use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info, warn};

use vireo_sip_core::metrics::ConferenceMetrics;

use crate::error::ConferenceError;
use crate::registrar::{ChatRoomBinder, ChatRoomHandle, Registrar};
use crate::uri::SipUri;

/// 聊天室地址 user 部分的固定前缀
pub const CHATROOM_PREFIX: &str = "chatroom-";

/// 连续冲突的迭代上限；2^128 的地址空间下预期迭代次数约为 1
const MAX_FETCH_ATTEMPTS: usize = 10;

pub struct ConferenceAddressAllocator {
    chat_room: Arc<dyn ChatRoomHandle>,
    conference_uri: SipUri,
    device_uuid: String,
    transport: String,
    storage_path: String,
    registrar: Arc<dyn Registrar>,
    binder: Arc<dyn ChatRoomBinder>,
    metrics: Arc<ConferenceMetrics>,
}

impl ConferenceAddressAllocator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chat_room: Arc<dyn ChatRoomHandle>,
        conference_factory_uri: SipUri,
        device_uuid: impl Into<String>,
        transport: impl Into<String>,
        storage_path: impl Into<String>,
        registrar: Arc<dyn Registrar>,
        binder: Arc<dyn ChatRoomBinder>,
        metrics: Arc<ConferenceMetrics>,
    ) -> Self {
        Self {
            chat_room,
            conference_uri: conference_factory_uri,
            device_uuid: device_uuid.into(),
            transport: transport.into(),
            storage_path: storage_path.into(),
            registrar,
            binder,
            metrics,
        }
    }

    /// 聊天室持久化目录
    pub fn storage_path(&self) -> &str {
        &self.storage_path
    }

    /// 在后台任务里驱动整个分配交换
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<SipUri, ConferenceError>> {
        tokio::spawn(self.run())
    }

    /// 驱动分配直至发布 GRUU 或失败
    ///
    /// 只有在紧邻的一次查询返回空记录之后才会进入绑定，
    /// 保证发布的 GRUU 对应的地址在分配时刻是未占用的。
    pub async fn run(mut self) -> Result<SipUri, ConferenceError> {
        let mut collisions = 0usize;
        loop {
            if collisions >= MAX_FETCH_ATTEMPTS {
                self.chat_room.set_conference_address(None);
                return Err(ConferenceError::AddressExhaustion {
                    attempts: collisions,
                });
            }
            match self.registrar.fetch(&self.conference_uri).await {
                Err(err) => {
                    self.chat_room.set_conference_address(None);
                    return Err(err.into());
                }
                Ok(Some(record)) if !record.is_empty() => {
                    warn!(
                        uri = %self.conference_uri,
                        "conference address conflict detected, trying another random name"
                    );
                    self.metrics.address_collisions_total.inc();
                    collisions += 1;
                    self.randomize_address();
                }
                Ok(_) => break,
            }
        }
        self.bind().await
    }

    /// 重新生成 `chatroom-<128 位十六进制 token>` 的 user 部分
    fn randomize_address(&mut self) {
        let token: u128 = rand::thread_rng().r#gen();
        self.conference_uri
            .set_user(format!("{CHATROOM_PREFIX}{token:032x}"));
        debug!(uri = %self.conference_uri, "new conference address candidate");
    }

    async fn bind(&self) -> Result<SipUri, ConferenceError> {
        let record = match self
            .binder
            .bind_chat_room(&self.conference_uri, &self.transport, &self.device_uuid)
            .await
        {
            Ok(record) => record,
            Err(err) => {
                self.chat_room.set_conference_address(None);
                return Err(err.into());
            }
        };

        let Some(contact) = record.latest() else {
            self.metrics.bind_failures_total.inc();
            self.chat_room.set_conference_address(None);
            return Err(ConferenceError::BindFailed);
        };
        let Some(gruu) = contact.pub_gruu.clone() else {
            self.metrics.bind_failures_total.inc();
            self.chat_room.set_conference_address(None);
            return Err(ConferenceError::NoGruu);
        };

        info!(gruu = %gruu, "conference address allocated");
        self.metrics.addresses_allocated_total.inc();
        self.chat_room.set_conference_address(Some(gruu.clone()));
        Ok(gruu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registrar::{ExtendedContact, Record};
    use crate::uri::SipScheme;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    /// 按脚本应答并记录被查询 URI 的 registrar 桩
    struct StubRegistrar {
        /// 每次 fetch 弹出一个应答（队首先出）
        responses: Mutex<Vec<anyhow::Result<Option<Record>>>>,
        fetched: Mutex<Vec<SipUri>>,
    }

    impl StubRegistrar {
        fn new(responses: Vec<anyhow::Result<Option<Record>>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                fetched: Mutex::new(Vec::new()),
            })
        }

        fn fetched(&self) -> Vec<SipUri> {
            self.fetched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Registrar for StubRegistrar {
        async fn fetch(&self, uri: &SipUri) -> anyhow::Result<Option<Record>> {
            self.fetched.lock().unwrap().push(uri.clone());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(None)
            } else {
                responses.remove(0)
            }
        }
    }

    struct StubBinder {
        result: Mutex<Option<anyhow::Result<Record>>>,
        bound: Mutex<Vec<SipUri>>,
    }

    impl StubBinder {
        fn new(result: anyhow::Result<Record>) -> Arc<Self> {
            Arc::new(Self {
                result: Mutex::new(Some(result)),
                bound: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatRoomBinder for StubBinder {
        async fn bind_chat_room(
            &self,
            uri: &SipUri,
            _transport: &str,
            _device_uuid: &str,
        ) -> anyhow::Result<Record> {
            self.bound.lock().unwrap().push(uri.clone());
            self.result
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Ok(Record::default()))
        }
    }

    #[derive(Default)]
    struct StubChatRoom {
        address: Mutex<Option<Option<SipUri>>>,
    }

    impl ChatRoomHandle for StubChatRoom {
        fn set_conference_address(&self, address: Option<SipUri>) {
            *self.address.lock().unwrap() = Some(address);
        }
    }

    impl StubChatRoom {
        fn published(&self) -> Option<Option<SipUri>> {
            self.address.lock().unwrap().clone()
        }
    }

    fn factory_uri() -> SipUri {
        "sip:conference-factory@conf.example.org"
            .parse()
            .unwrap()
    }

    fn occupied_record() -> Record {
        Record {
            contacts: vec![ExtendedContact {
                contact: SipUri::new(SipScheme::Sip, Some("someone".to_string()), "host"),
                pub_gruu: None,
                registered_at: Utc::now(),
            }],
        }
    }

    fn bound_record(gruu: &str) -> Record {
        Record {
            contacts: vec![ExtendedContact {
                contact: SipUri::new(SipScheme::Sip, Some("room".to_string()), "host"),
                pub_gruu: Some(gruu.parse().unwrap()),
                registered_at: Utc::now(),
            }],
        }
    }

    fn allocator(
        registrar: Arc<StubRegistrar>,
        binder: Arc<StubBinder>,
        chat_room: Arc<StubChatRoom>,
    ) -> ConferenceAddressAllocator {
        ConferenceAddressAllocator::new(
            chat_room,
            factory_uri(),
            "device-uuid-1",
            "sip:127.0.0.1:6064;transport=tcp",
            "/var/lib/vireo/chatrooms",
            registrar,
            binder,
            Arc::new(ConferenceMetrics::new()),
        )
    }

    #[tokio::test]
    async fn test_collision_then_bind_publishes_gruu() {
        let gruu = "sip:chatroom-x@conf.example.org;gr=urn:uuid:g1";
        // 第一次查询冲突，第二次为空
        let registrar = StubRegistrar::new(vec![Ok(Some(occupied_record())), Ok(None)]);
        let binder = StubBinder::new(Ok(bound_record(gruu)));
        let chat_room = Arc::new(StubChatRoom::default());

        let result = allocator(Arc::clone(&registrar), Arc::clone(&binder), Arc::clone(&chat_room))
            .run()
            .await
            .unwrap();
        assert_eq!(result.to_string(), gruu);

        // 恰好两次查询：原始 factory 地址 + 一次重新随机化的地址
        let fetched = registrar.fetched();
        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched[0].user(), Some("conference-factory"));
        let second_user = fetched[1].user().unwrap();
        assert!(second_user.starts_with(CHATROOM_PREFIX));
        assert_eq!(second_user.len(), CHATROOM_PREFIX.len() + 32);

        // 绑定的是第二个（空记录的）地址
        let bound = binder.bound.lock().unwrap().clone();
        assert_eq!(bound.len(), 1);
        assert_eq!(bound[0].user(), Some(second_user));

        // 聊天室地址就是 GRUU
        assert_eq!(chat_room.published(), Some(Some(gruu.parse().unwrap())));
    }

    #[tokio::test]
    async fn test_no_collision_binds_factory_candidate() {
        let gruu = "sip:chatroom-y@conf.example.org;gr=urn:uuid:g2";
        let registrar = StubRegistrar::new(vec![Ok(None)]);
        let binder = StubBinder::new(Ok(bound_record(gruu)));
        let chat_room = Arc::new(StubChatRoom::default());

        allocator(Arc::clone(&registrar), binder, chat_room)
            .run()
            .await
            .unwrap();
        assert_eq!(registrar.fetched().len(), 1);
    }

    #[tokio::test]
    async fn test_bind_without_contacts_fails() {
        let registrar = StubRegistrar::new(vec![Ok(None)]);
        let binder = StubBinder::new(Ok(Record::default()));
        let chat_room = Arc::new(StubChatRoom::default());

        let result = allocator(registrar, binder, Arc::clone(&chat_room)).run().await;
        assert!(matches!(result, Err(ConferenceError::BindFailed)));
        // 失败时清空聊天室地址
        assert_eq!(chat_room.published(), Some(None));
    }

    #[tokio::test]
    async fn test_bind_without_gruu_fails() {
        let registrar = StubRegistrar::new(vec![Ok(None)]);
        let binder = StubBinder::new(Ok(occupied_record()));
        let chat_room = Arc::new(StubChatRoom::default());

        let result = allocator(registrar, binder, Arc::clone(&chat_room)).run().await;
        assert!(matches!(result, Err(ConferenceError::NoGruu)));
        assert_eq!(chat_room.published(), Some(None));
    }

    #[tokio::test]
    async fn test_registrar_error_clears_address() {
        let registrar = StubRegistrar::new(vec![Err(anyhow::anyhow!("registrar unreachable"))]);
        let binder = StubBinder::new(Ok(Record::default()));
        let chat_room = Arc::new(StubChatRoom::default());

        let result = allocator(registrar, binder, Arc::clone(&chat_room)).run().await;
        assert!(matches!(result, Err(ConferenceError::Registrar(_))));
        assert_eq!(chat_room.published(), Some(None));
    }

    #[tokio::test]
    async fn test_persistent_collisions_exhaust_address_space() {
        let responses = (0..16).map(|_| Ok(Some(occupied_record()))).collect();
        let registrar = StubRegistrar::new(responses);
        let binder = StubBinder::new(Ok(Record::default()));
        let chat_room = Arc::new(StubChatRoom::default());

        let result = allocator(Arc::clone(&registrar), binder, Arc::clone(&chat_room))
            .run()
            .await;
        assert!(matches!(
            result,
            Err(ConferenceError::AddressExhaustion { attempts: 10 })
        ));
        assert_eq!(registrar.fetched().len(), 10);
        assert_eq!(chat_room.published(), Some(None));
    }
}
