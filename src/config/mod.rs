//! Vireo SIP Core 配置模块
//!
//! 该模块提供推送与会议子系统的配置管理功能，包括：
//! - TOML 配置文件加载和解析
//! - 环境变量覆盖
//! - `appId:value` 键值对列表解析

use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// 全局应用配置实例，使用 OnceLock 确保只初始化一次
static APP_CONFIG: OnceLock<VireoAppConfig> = OnceLock::new();

/// 日志配置
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LoggingConfig {
    /// 日志级别（trace/debug/info/warn/error）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 是否显示日志来源 target
    #[serde(default)]
    pub with_target: bool,
    /// 是否显示线程 ID
    #[serde(default)]
    pub with_thread_ids: bool,
    /// 是否显示文件名
    #[serde(default)]
    pub with_file: bool,
    /// 是否显示行号
    #[serde(default)]
    pub with_line_number: bool,
}

fn default_log_level() -> String {
    "debug".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: false,
            with_thread_ids: false,
            with_file: false,
            with_line_number: false,
        }
    }
}

/// iOS 推送证书配置
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IosPushConfig {
    /// APNs 客户端证书目录（仅扫描 `.pem` 文件，不递归）
    pub certdir: PathBuf,
    /// CA 证书包路径
    pub cafile: PathBuf,
}

/// 通用 HTTP 推送客户端配置
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GenericClientConfig {
    /// 请求 URL 模板（支持 `$token`、`$app-id` 等变量）
    pub url: String,
    /// HTTP 方法，仅允许 GET 或 POST
    #[serde(default = "default_generic_method")]
    pub method: String,
    /// 传输协议：http 或 http2
    #[serde(default = "default_generic_protocol")]
    pub protocol: String,
    /// POST 请求体模板
    #[serde(default)]
    pub body: Option<String>,
}

fn default_generic_method() -> String {
    "POST".to_string()
}

fn default_generic_protocol() -> String {
    "http".to_string()
}

/// 推送服务配置
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PushConfig {
    /// 每个客户端的请求队列上限
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Firebase legacy 客户端列表，`appId:apiKey` 形式
    #[serde(default)]
    pub firebase_projects_api_keys: Vec<String>,
    /// Firebase v1 客户端列表，`appId:serviceAccountPath` 形式
    #[serde(default)]
    pub firebase_service_accounts: Vec<String>,
    /// 两次 token 刷新之间的最小间隔（秒）
    #[serde(default = "default_refresh_interval")]
    pub firebase_default_refresh_interval: u64,
    /// token 过期前提前刷新的时间窗口（秒）
    #[serde(default = "default_anticipation")]
    pub firebase_token_expiration_anticipation_time: u64,
    /// OAuth2 token 刷新辅助脚本路径
    #[serde(default)]
    pub firebase_token_script: Option<PathBuf>,
    /// iOS 推送证书配置
    #[serde(default)]
    pub push_ios: Option<IosPushConfig>,
    /// 通用 HTTP 客户端配置
    #[serde(default)]
    pub generic_client: Option<GenericClientConfig>,
}

fn default_max_queue_size() -> usize {
    100
}

fn default_refresh_interval() -> u64 {
    600
}

fn default_anticipation() -> u64 {
    300
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            firebase_projects_api_keys: Vec::new(),
            firebase_service_accounts: Vec::new(),
            firebase_default_refresh_interval: default_refresh_interval(),
            firebase_token_expiration_anticipation_time: default_anticipation(),
            firebase_token_script: None,
            push_ios: None,
            generic_client: None,
        }
    }
}

impl PushConfig {
    /// token 刷新最小间隔
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.firebase_default_refresh_interval)
    }

    /// token 过期提前量
    pub fn anticipation(&self) -> Duration {
        Duration::from_secs(self.firebase_token_expiration_anticipation_time)
    }
}

/// 会议服务配置
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConferenceConfig {
    /// 会议服务器绑定聊天室地址使用的 SIP transport URI
    #[serde(default = "default_conference_transport")]
    pub transport: String,
}

fn default_conference_transport() -> String {
    "sip:127.0.0.1:6064;transport=tcp".to_string()
}

impl Default for ConferenceConfig {
    fn default() -> Self {
        Self {
            transport: default_conference_transport(),
        }
    }
}

/// 应用顶层配置
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VireoAppConfig {
    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
    /// 推送配置
    #[serde(default)]
    pub push: PushConfig,
    /// 会议配置
    #[serde(default)]
    pub conference: ConferenceConfig,
}

/// 从 TOML 文件加载配置并应用环境变量覆盖
pub fn load_config(path: &str) -> Result<VireoAppConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_string(),
        source,
    })?;
    let mut config: VireoAppConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_string(),
        source,
    })?;
    apply_env_overrides(&mut config);
    validate(&config)?;
    Ok(config)
}

/// 配置取值校验
fn validate(config: &VireoAppConfig) -> Result<(), ConfigError> {
    if config.push.max_queue_size == 0 {
        return Err(ConfigError::InvalidValue {
            key: "push.max-queue-size".to_string(),
            value: "0".to_string(),
        });
    }
    const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
    if !LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::InvalidValue {
            key: "logging.level".to_string(),
            value: config.logging.level.clone(),
        });
    }
    Ok(())
}

/// 获取全局配置实例
///
/// 首次调用时从 `VIREO_CONFIG` 指定的文件加载，未指定则使用默认配置
pub fn app_config() -> &'static VireoAppConfig {
    APP_CONFIG.get_or_init(|| match env::var("VIREO_CONFIG") {
        Ok(path) => load_config(&path).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "failed to load configuration file, using defaults");
            let mut config = VireoAppConfig::default();
            apply_env_overrides(&mut config);
            config
        }),
        Err(_) => {
            let mut config = VireoAppConfig::default();
            apply_env_overrides(&mut config);
            config
        }
    })
}

/// 应用环境变量覆盖
fn apply_env_overrides(config: &mut VireoAppConfig) {
    if let Some(size) = env::var("VIREO_PUSH_MAX_QUEUE_SIZE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
    {
        config.push.max_queue_size = size;
    }
    if let Some(interval) = env::var("VIREO_FIREBASE_REFRESH_INTERVAL")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
    {
        config.push.firebase_default_refresh_interval = interval;
    }
    if let Ok(script) = env::var("VIREO_FIREBASE_TOKEN_SCRIPT") {
        config.push.firebase_token_script = Some(PathBuf::from(script));
    }
    if let Ok(transport) = env::var("VIREO_CONFERENCE_TRANSPORT") {
        config.conference.transport = transport;
    }
}

/// 解析 `appId:value` 形式的键值对列表
///
/// 仅在第一个 `:` 处切分，value 部分允许包含 `:`
pub fn parse_key_value_pairs(entries: &[String]) -> Result<Vec<(String, String)>, ConfigError> {
    entries
        .iter()
        .map(|entry| match entry.split_once(':') {
            Some((key, value)) if !key.is_empty() && !value.is_empty() => {
                Ok((key.to_string(), value.to_string()))
            }
            _ => Err(ConfigError::InvalidPair(entry.clone())),
        })
        .collect()
}
