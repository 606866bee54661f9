//! 推送服务：客户端注册表与请求路由
//!
//! 服务独占持有全部客户端；注册表只在启动阶段变更，之后只读。
//! 两个保留注册名：
//! - `"generic"`：存在时抢占所有 provider 专属分发
//! - `"fallback"`：没有 provider 匹配时的兜底客户端

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, warn};

use vireo_sip_core::config::{GenericClientConfig, PushConfig};
use vireo_sip_core::metrics::PushClientMetrics;
use vireo_sip_core::parse_key_value_pairs;

use crate::apple::AppleClient;
use crate::client::{PushClient, RetryPolicy};
use crate::error::PushError;
use crate::firebase_legacy::FirebaseLegacyClient;
use crate::firebase_v1::FirebaseV1Client;
use crate::generic::GenericHttpClient;
use crate::hook::{NoopInvalidationHook, TokenInvalidationHook};
use crate::push_info::{PushInfo, PushType};
use crate::request::PushRequest;
use crate::token_manager::TokenManager;

/// 通用客户端的保留注册名
pub const GENERIC_CLIENT_NAME: &str = "generic";
/// 兜底客户端的保留注册名
pub const FALLBACK_CLIENT_KEY: &str = "fallback";

pub(crate) type ClientMap = HashMap<String, Arc<dyn PushClient>>;
pub(crate) type ClientRegistry = RwLock<ClientMap>;

pub struct PushService {
    clients: Arc<ClientRegistry>,
    max_queue_size: usize,
    retry: RetryPolicy,
    hook: Arc<dyn TokenInvalidationHook>,
    metrics: Arc<PushClientMetrics>,
}

impl PushService {
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            clients: Arc::new(RwLock::new(HashMap::new())),
            max_queue_size,
            retry: RetryPolicy::default(),
            hook: Arc::new(NoopInvalidationHook),
            metrics: Arc::new(PushClientMetrics::new()),
        }
    }

    /// 安装设备 token 失效回调
    pub fn with_invalidation_hook(mut self, hook: Arc<dyn TokenInvalidationHook>) -> Self {
        self.hook = hook;
        self
    }

    /// 覆盖默认重试策略
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// 构造绑定到具体客户端的推送请求
    ///
    /// 解析顺序：`"generic"` 客户端 → destination 的 provider 同名客户端 →
    /// `"fallback"` 客户端 → [`PushError::UnsupportedProvider`]。
    pub fn make_request(
        &self,
        push_type: PushType,
        info: &Arc<PushInfo>,
    ) -> Result<Arc<PushRequest>, PushError> {
        // 产生请求前推送意图至少要有一个目标设备
        if !info.has_destinations() {
            return Err(PushError::MissingDestination(push_type));
        }
        let clients = self.clients.read().unwrap_or_else(|err| err.into_inner());

        if let Some(generic) = clients.get(GENERIC_CLIENT_NAME) {
            return generic.make_request(push_type, info);
        }

        let destination = info
            .destination(push_type)
            .ok_or(PushError::MissingDestination(push_type))?;
        if let Some(client) = clients.get(&destination.provider) {
            return client.make_request(push_type, info);
        }
        if let Some(fallback) = clients.get(FALLBACK_CLIENT_KEY) {
            return fallback.make_request(push_type, info);
        }
        Err(PushError::UnsupportedProvider(destination.provider.clone()))
    }

    /// 将请求交给归属客户端入队；只入队，不等待完成
    pub fn send_push(&self, request: Arc<PushRequest>) -> Result<(), PushError> {
        let clients = self.clients.read().unwrap_or_else(|err| err.into_inner());
        let client = clients
            .get(request.app_identifier())
            .or_else(|| clients.get(FALLBACK_CLIENT_KEY))
            .ok_or_else(|| PushError::NoClientAvailable(request.app_identifier().to_string()))?;
        client.send_push(request)
    }

    /// 所有客户端都空闲
    pub fn is_idle(&self) -> bool {
        let clients = self.clients.read().unwrap_or_else(|err| err.into_inner());
        clients.values().all(|client| client.is_idle())
    }

    /// 配置通用 HTTP 客户端（注册在 `"generic"` 名下）
    ///
    /// method 只允许 GET / POST，protocol 只允许 http / http2，
    /// 其他取值返回 [`PushError::InvalidArgument`]。
    pub fn setup_generic_client(&self, config: &GenericClientConfig) -> Result<(), PushError> {
        let method = config.method.parse()?;
        let protocol = config.protocol.parse()?;
        let client = GenericHttpClient::new(
            GENERIC_CLIENT_NAME,
            config.url.clone(),
            config.body.clone(),
            method,
            protocol,
            Arc::downgrade(&self.clients),
            self.max_queue_size,
            self.retry.clone(),
            Arc::clone(&self.hook),
            Arc::clone(&self.metrics),
        )?;
        self.register_client(GENERIC_CLIENT_NAME, Arc::new(client));
        Ok(())
    }

    /// 扫描证书目录并为每个 `.pem` 证书创建一个 APNs 客户端
    ///
    /// 不递归；注册名为去掉 `.pem` 后缀的文件名。单个证书的 TLS
    /// 构建失败只记录告警并跳过，不影响其余证书。
    pub fn setup_ios_clients(&self, certdir: &Path, cafile: &Path) {
        let entries = match std::fs::read_dir(certdir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(
                    certdir = %certdir.display(),
                    error = %err,
                    "cannot open push notification certificates directory"
                );
                return;
            }
        };
        debug!(certdir = %certdir.display(), "searching push notification certificates");

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            let Some(name) = file_name.strip_suffix(".pem") else {
                continue;
            };
            match AppleClient::new(
                name,
                &path,
                cafile,
                self.max_queue_size,
                self.retry.clone(),
                Arc::clone(&self.hook),
                Arc::clone(&self.metrics),
            ) {
                Ok(client) => {
                    debug!(client = %name, "adding ios push notification client");
                    self.register_client(name, Arc::new(client));
                }
                Err(err) => {
                    warn!(client = %name, error = %err, "cannot make ios push notification client");
                }
            }
        }
    }

    /// 按配置创建全部 firebase 客户端
    ///
    /// 同一个 appId 同时出现在 legacy 和 v1 配置中是配置错误；
    /// 重复检查在任何注册发生之前完成，出错时注册表保持原样。
    pub fn setup_firebase_clients(&self, config: &PushConfig) -> Result<(), PushError> {
        let legacy = parse_key_value_pairs(&config.firebase_projects_api_keys)?;
        let v1 = parse_key_value_pairs(&config.firebase_service_accounts)?;

        for (app_id, _) in &v1 {
            let duplicated = legacy.iter().any(|(existing, _)| existing == app_id)
                || self.contains_client(app_id);
            if duplicated {
                return Err(PushError::DuplicateAppId(app_id.clone()));
            }
        }

        for (app_id, api_key) in legacy {
            self.add_firebase_client(&app_id, api_key)?;
        }

        if v1.is_empty() {
            return Ok(());
        }
        let script = config.firebase_token_script.clone().ok_or_else(|| {
            PushError::InvalidArgument(
                "firebase-token-script is required when firebase-service-accounts is set"
                    .to_string(),
            )
        })?;
        for (app_id, account_path) in v1 {
            self.add_firebase_v1_client(
                &app_id,
                script.clone(),
                account_path.into(),
                config.refresh_interval(),
                config.anticipation(),
            )?;
        }
        Ok(())
    }

    /// 注册一个 firebase legacy 客户端
    pub fn add_firebase_client(
        &self,
        app_id: &str,
        api_key: impl Into<String>,
    ) -> Result<(), PushError> {
        let client = FirebaseLegacyClient::new(
            app_id,
            api_key,
            self.max_queue_size,
            self.retry.clone(),
            Arc::clone(&self.hook),
            Arc::clone(&self.metrics),
        )?;
        debug!(client = %app_id, "adding firebase push notification client");
        self.register_client(app_id, Arc::new(client));
        Ok(())
    }

    /// 注册一个 firebase v1 客户端（连同它的 token 管理器）
    pub fn add_firebase_v1_client(
        &self,
        app_id: &str,
        script_path: std::path::PathBuf,
        account_path: std::path::PathBuf,
        refresh_floor: Duration,
        anticipation: Duration,
    ) -> Result<(), PushError> {
        let token_manager =
            TokenManager::new(script_path, account_path, refresh_floor, anticipation)?;
        let client = FirebaseV1Client::new(
            app_id,
            token_manager,
            self.max_queue_size,
            self.retry.clone(),
            Arc::clone(&self.hook),
            Arc::clone(&self.metrics),
        )?;
        debug!(client = %app_id, "adding firebase v1 push notification client");
        self.register_client(app_id, Arc::new(client));
        Ok(())
    }

    /// 注册兜底客户端
    pub fn set_fallback_client(&self, client: Arc<dyn PushClient>) {
        self.register_client(FALLBACK_CLIENT_KEY, client);
    }

    /// 注册表中已注册的客户端名
    pub fn client_names(&self) -> Vec<String> {
        let clients = self.clients.read().unwrap_or_else(|err| err.into_inner());
        clients.keys().cloned().collect()
    }

    fn contains_client(&self, name: &str) -> bool {
        let clients = self.clients.read().unwrap_or_else(|err| err.into_inner());
        clients.contains_key(name)
    }

    fn register_client(&self, name: &str, client: Arc<dyn PushClient>) {
        let mut clients = self.clients.write().unwrap_or_else(|err| err.into_inner());
        clients.insert(name.to_string(), client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push_info::PushDestination;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 记录调用的客户端桩
    struct StubClient {
        name: String,
        idle: bool,
        sent: AtomicUsize,
    }

    impl StubClient {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                idle: true,
                sent: AtomicUsize::new(0),
            })
        }

        fn busy(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                idle: false,
                sent: AtomicUsize::new(0),
            })
        }
    }

    impl PushClient for StubClient {
        fn name(&self) -> &str {
            &self.name
        }

        fn make_request(
            &self,
            push_type: PushType,
            info: &Arc<PushInfo>,
        ) -> Result<Arc<PushRequest>, PushError> {
            Ok(PushRequest::new(
                self.name(),
                push_type,
                Arc::clone(info),
                vec![],
            ))
        }

        fn send_push(&self, _request: Arc<PushRequest>) -> Result<(), PushError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_idle(&self) -> bool {
            self.idle
        }
    }

    fn apns_info() -> Arc<PushInfo> {
        let mut info = PushInfo::new("org.example.app");
        info.add_destination(
            PushType::Message,
            PushDestination::new("apns", "abc", "org.example.app"),
        );
        Arc::new(info)
    }

    #[test]
    fn test_make_request_prefers_generic_client() {
        let service = PushService::new(4);
        service.register_client("apns", StubClient::new("apns"));
        service.register_client(GENERIC_CLIENT_NAME, StubClient::new(GENERIC_CLIENT_NAME));

        let request = service.make_request(PushType::Message, &apns_info()).unwrap();
        assert_eq!(request.app_identifier(), GENERIC_CLIENT_NAME);
    }

    #[test]
    fn test_make_request_resolves_provider_then_fallback() {
        let service = PushService::new(4);
        service.register_client("apns", StubClient::new("apns"));
        let request = service.make_request(PushType::Message, &apns_info()).unwrap();
        assert_eq!(request.app_identifier(), "apns");

        // provider 不匹配时落到 fallback
        let service = PushService::new(4);
        service.set_fallback_client(StubClient::new(FALLBACK_CLIENT_KEY));
        let request = service.make_request(PushType::Message, &apns_info()).unwrap();
        assert_eq!(request.app_identifier(), FALLBACK_CLIENT_KEY);

        // 什么都没有注册：不支持的 provider
        let service = PushService::new(4);
        assert!(matches!(
            service.make_request(PushType::Message, &apns_info()),
            Err(PushError::UnsupportedProvider(provider)) if provider == "apns"
        ));
    }

    #[test]
    fn test_make_request_requires_destination() {
        let service = PushService::new(4);
        service.register_client("apns", StubClient::new("apns"));
        let info = Arc::new(PushInfo::new("org.example.app"));
        assert!(matches!(
            service.make_request(PushType::Message, &info),
            Err(PushError::MissingDestination(PushType::Message))
        ));

        // 注册了 generic 客户端也一样：没有任何目标设备不产生请求
        service.register_client(GENERIC_CLIENT_NAME, StubClient::new(GENERIC_CLIENT_NAME));
        assert!(matches!(
            service.make_request(PushType::Message, &info),
            Err(PushError::MissingDestination(PushType::Message))
        ));
    }

    #[test]
    fn test_send_push_routes_by_app_identifier() {
        let service = PushService::new(4);
        let apns = StubClient::new("apns");
        service.register_client("apns", Arc::clone(&apns) as Arc<dyn PushClient>);

        let request = service.make_request(PushType::Message, &apns_info()).unwrap();
        service.send_push(request).unwrap();
        assert_eq!(apns.sent.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_send_push_falls_back_then_fails() {
        // 没有归属客户端但有 fallback
        let service = PushService::new(4);
        let fallback = StubClient::new(FALLBACK_CLIENT_KEY);
        service.set_fallback_client(Arc::clone(&fallback) as Arc<dyn PushClient>);
        let request =
            PushRequest::new("unknown-app", PushType::Message, apns_info(), vec![]);
        service.send_push(request).unwrap();
        assert_eq!(fallback.sent.load(Ordering::SeqCst), 1);

        // 什么都没有：NoClientAvailable
        let service = PushService::new(4);
        let request =
            PushRequest::new("unknown-app", PushType::Message, apns_info(), vec![]);
        assert!(matches!(
            service.send_push(request),
            Err(PushError::NoClientAvailable(_))
        ));
    }

    #[test]
    fn test_is_idle_is_conjunction_over_clients() {
        let service = PushService::new(4);
        assert!(service.is_idle());

        service.register_client("a", StubClient::new("a"));
        assert!(service.is_idle());

        service.register_client("b", StubClient::busy("b"));
        assert!(!service.is_idle());
    }

    #[tokio::test]
    async fn test_duplicate_app_id_leaves_registry_empty() {
        let service = PushService::new(4);
        let config = PushConfig {
            firebase_projects_api_keys: vec!["app1:k".to_string()],
            firebase_service_accounts: vec!["app1:/path/to/sa.json".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            service.setup_firebase_clients(&config),
            Err(PushError::DuplicateAppId(app_id)) if app_id == "app1"
        ));
        assert!(service.client_names().is_empty());
    }

    #[tokio::test]
    async fn test_setup_firebase_legacy_clients() {
        let service = PushService::new(4);
        let config = PushConfig {
            firebase_projects_api_keys: vec![
                "app1:key1".to_string(),
                "app2:key2".to_string(),
            ],
            ..Default::default()
        };
        service.setup_firebase_clients(&config).unwrap();
        let mut names = service.client_names();
        names.sort();
        assert_eq!(names, vec!["app1", "app2"]);
    }

    #[tokio::test]
    async fn test_setup_firebase_v1_requires_script() {
        let service = PushService::new(4);
        let config = PushConfig {
            firebase_service_accounts: vec!["app1:/path/to/sa.json".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            service.setup_firebase_clients(&config),
            Err(PushError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_setup_generic_client_validates_method() {
        let service = PushService::new(4);
        let config = GenericClientConfig {
            url: "https://push.example.org/send".to_string(),
            method: "DELETE".to_string(),
            protocol: "http".to_string(),
            body: None,
        };
        assert!(matches!(
            service.setup_generic_client(&config),
            Err(PushError::InvalidArgument(_))
        ));
        assert!(service.client_names().is_empty());

        let config = GenericClientConfig {
            method: "GET".to_string(),
            ..config
        };
        service.setup_generic_client(&config).unwrap();
        assert_eq!(service.client_names(), vec![GENERIC_CLIENT_NAME]);
    }

    #[tokio::test]
    async fn test_setup_ios_clients_skips_bad_certificates() {
        let dir = tempfile::tempdir().unwrap();
        // 无效证书：TLS 构建失败应跳过而不是中止整个扫描
        std::fs::write(dir.path().join("org.example.app.pem"), "not a certificate").unwrap();
        // 非 .pem 文件被忽略
        std::fs::write(dir.path().join("readme.txt"), "ignore me").unwrap();
        // 子目录不递归
        std::fs::create_dir(dir.path().join("nested.pem")).unwrap();
        let cafile = dir.path().join("ca.pem");
        std::fs::write(&cafile, "not a ca").unwrap();

        let service = PushService::new(4);
        service.setup_ios_clients(dir.path(), &cafile);
        assert!(service.client_names().is_empty());
    }
}
