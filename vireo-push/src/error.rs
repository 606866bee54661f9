//! 统一异常处理模块

use thiserror::Error;

use crate::push_info::PushType;

pub type Result<T> = std::result::Result<T, PushError>;

/// 推送服务错误类型
#[derive(Debug, Error)]
pub enum PushError {
    /// 没有注册能处理该 provider 的客户端
    #[error("unsupported push notification provider [{0}]")]
    UnsupportedProvider(String),

    /// 请求无法路由到任何客户端
    #[error("no push notification client available for request [{0}]")]
    NoClientAvailable(String),

    /// 推送意图缺少目标设备
    #[error("push info carries no destination for push type [{0}]")]
    MissingDestination(PushType),

    /// 参数非法
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// 同一个 appId 同时出现在 legacy 和 v1 配置中
    #[error(
        "firebase application with id [{0}] already exists, \
         only use firebase-projects-api-keys OR firebase-service-accounts for the same appId"
    )]
    DuplicateAppId(String),

    /// 客户端队列已满，入队被同步拒绝
    #[error("client [{client}] queue is full (capacity {capacity})")]
    QueueFull { client: String, capacity: usize },

    /// 没有可用的 access token
    #[error("no usable access token available")]
    TokenUnavailable,

    /// token 刷新辅助进程失败
    #[error("access token refresh failed: {0}")]
    TokenRefreshFailed(String),

    /// service account 文件无法加载或解析
    #[error("invalid service account file: {0}")]
    InvalidServiceAccount(String),

    /// TLS 证书或客户端构建失败
    #[error("TLS setup failed: {0}")]
    Tls(String),

    /// 传输层错误
    #[error("transport error: {0}")]
    Transport(String),

    /// 配置错误
    #[error(transparent)]
    Config(#[from] vireo_sip_core::ConfigError),
}
