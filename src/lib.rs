//! Vireo SIP Core 公共库
//!
//! 为代理的各个子系统（推送、会议）提供统一的配置加载、日志初始化和指标收集功能

pub mod config;
pub mod error;
pub mod metrics;
pub mod tracing;

pub use config::{
    ConferenceConfig, GenericClientConfig, IosPushConfig, LoggingConfig, PushConfig,
    VireoAppConfig, app_config, load_config, parse_key_value_pairs,
};
pub use error::ConfigError;
pub use metrics::{ConferenceMetrics, PushClientMetrics, REGISTRY};
pub use tracing::init_tracing_from_config;
