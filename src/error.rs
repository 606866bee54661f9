//! 统一异常处理模块

use thiserror::Error;

/// 配置加载与校验错误类型
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 配置文件读取失败
    #[error("failed to read configuration file [{path}]: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// 配置文件解析失败
    #[error("failed to parse configuration file [{path}]: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    /// `appId:value` 键值对格式错误
    #[error("invalid key/value entry [{0}], expected \"appId:value\"")]
    InvalidPair(String),

    /// 配置项取值非法
    #[error("invalid value [{value}] for configuration key [{key}]")]
    InvalidValue { key: String, value: String },
}
